use std::sync::Arc;
use std::time::Duration;

use clap::{App, Arg};
use pinbroker::broker::{Broker, BrokerConfig};
use pinbroker::bus::SimulatedBus;
use pinbroker::protocol::{self, ParseError, Token, WireRequest, MAX_REQUEST_SIZE};
use pinbroker::registers::{MAX_BOARD_ADDR, MIN_BOARD_ADDR, PIN_COUNT};
use pinbroker::store::FetchOutcome;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

const DEFAULT_PORT: &str = "8888";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("pinbrokerd")
        .version("0.1.0")
        .author("Hardware Platform Team")
        .about("I/O expander command broker - serializes pin/register commands onto a shared bus")
        .arg(
            Arg::with_name("host")
                .long("host")
                .value_name("HOST")
                .help("Listen address")
                .takes_value(true)
                .default_value("127.0.0.1"),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Listen port")
                .takes_value(true)
                .default_value(DEFAULT_PORT),
        )
        .arg(
            Arg::with_name("command-ttl")
                .long("command-ttl")
                .value_name("MS")
                .help("Queued command lifetime in milliseconds")
                .takes_value(true)
                .default_value("1500"),
        )
        .arg(
            Arg::with_name("result-ttl")
                .long("result-ttl")
                .value_name("MS")
                .help("Unread result lifetime in milliseconds")
                .takes_value(true)
                .default_value("1500"),
        )
        .arg(
            Arg::with_name("wait-timeout")
                .long("wait-timeout")
                .value_name("MS")
                .help("How long a connection waits for a result before answering with an error")
                .takes_value(true)
                .default_value("2000"),
        )
        .arg(
            Arg::with_name("boards")
                .long("boards")
                .value_name("ADDRS")
                .help("Comma-separated hex addresses of simulated boards to attach")
                .takes_value(true)
                .default_value("0x20"),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or("127.0.0.1");
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let command_ttl: u64 = matches.value_of("command-ttl").unwrap_or("1500").parse()?;
    let result_ttl: u64 = matches.value_of("result-ttl").unwrap_or("1500").parse()?;
    let wait_timeout: u64 = matches.value_of("wait-timeout").unwrap_or("2000").parse()?;

    // The bundled server runs against the simulated bus; a hardware
    // deployment swaps in an I2C-backed BusDriver here.
    let bus = SimulatedBus::new();
    for addr in matches.value_of("boards").unwrap_or("0x20").split(',') {
        let addr = addr.trim().trim_start_matches("0x");
        match u8::from_str_radix(addr, 16) {
            Ok(addr) => {
                bus.add_board(addr);
                info!("attached simulated board 0x{addr:02X}");
            }
            Err(_) => warn!("ignoring malformed board address '{addr}'"),
        }
    }

    let config = BrokerConfig {
        command_ttl: Duration::from_millis(command_ttl),
        result_ttl: Duration::from_millis(result_ttl),
        ..BrokerConfig::default()
    };
    let mut broker = Broker::new(config);
    broker.start(bus)?;
    let broker = Arc::new(broker);
    let wait_timeout = Duration::from_millis(wait_timeout);

    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    info!("pinbrokerd listening on {host}:{port}");

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("client connected: {addr}");
                let client_broker = Arc::clone(&broker);
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, client_broker, wait_timeout).await {
                        warn!("client {addr} error: {e}");
                    }
                    info!("client disconnected: {addr}");
                });
            }
            Err(e) => {
                error!("failed to accept connection: {e}");
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    broker: Arc<Broker>,
    wait_timeout: Duration,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        match read_bounded_line(&mut buf_reader, &mut line).await? {
            LineRead::Eof => return Ok(()),
            LineRead::TooLong => {
                writer
                    .write_all(ParseError::RequestTooLarge.to_string().as_bytes())
                    .await?;
                writer.write_all(b"\n").await?;
                continue;
            }
            LineRead::Line => {}
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let reply = if trimmed.eq_ignore_ascii_case("STATS") {
            serde_json::to_string(&broker.stats())?
        } else {
            answer_request(&broker, trimmed, wait_timeout).await
        };

        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
}

enum LineRead {
    Line,
    TooLong,
    Eof,
}

/// Read one newline-terminated request into `line` without ever
/// buffering more than the wire protocol's maximum request size. An
/// oversized line is drained up to its newline and reported as too
/// long, so a misbehaving client cannot grow the buffer.
async fn read_bounded_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    line: &mut String,
) -> std::io::Result<LineRead> {
    line.clear();
    let mut too_long = false;

    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            // EOF; a final unterminated line is still delivered.
            return Ok(match (line.is_empty(), too_long) {
                (true, false) => LineRead::Eof,
                (_, true) => LineRead::TooLong,
                (false, false) => LineRead::Line,
            });
        }

        let newline = chunk.iter().position(|&b| b == b'\n');
        let used = newline.map_or(chunk.len(), |pos| pos + 1);

        if !too_long {
            let body = &chunk[..newline.unwrap_or(chunk.len())];
            if line.len() + body.len() > MAX_REQUEST_SIZE {
                too_long = true;
                line.clear();
            } else {
                line.push_str(&String::from_utf8_lossy(body));
            }
        }

        reader.consume(used);
        if newline.is_some() {
            return Ok(if too_long {
                LineRead::TooLong
            } else {
                LineRead::Line
            });
        }
    }
}

/// Parse, pre-validate, submit, and wait for one wire request.
///
/// Range checks mirror the dispatcher's own validation so malformed
/// requests are answered immediately instead of spending queue space.
async fn answer_request(broker: &Broker, request: &str, wait_timeout: Duration) -> String {
    let parsed: Result<WireRequest, ParseError> = protocol::parse_request(request);
    let request = match parsed {
        Ok(request) => request,
        Err(err) => return err.to_string(),
    };

    if !(MIN_BOARD_ADDR..=MAX_BOARD_ADDR).contains(&request.board) {
        return format!(
            "Error: Board ID not in range [0x{MIN_BOARD_ADDR:02X}, 0x{MAX_BOARD_ADDR:02X}]."
        );
    }
    if request.arg >= PIN_COUNT {
        return format!("Error: registervalue not in range [0x00, 0x{:02X}].", PIN_COUNT - 1);
    }

    let token = match broker.submit(request.verb, request.board, request.arg) {
        Ok(token) => token,
        Err(err) => return format!("Error: {err}."),
    };

    match wait_for_result(broker, token, wait_timeout).await {
        Some(value) => protocol::format_response(value).to_string(),
        None => "Error: no result arrived in time.".to_string(),
    }
}

async fn wait_for_result(
    broker: &Broker,
    token: Token,
    timeout: Duration,
) -> Option<pinbroker::CommandValue> {
    let poll = broker.config().result_poll_interval;
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        match broker.fetch_result(token) {
            FetchOutcome::Ready(result) => return Some(result.value),
            FetchOutcome::NotReady | FetchOutcome::Expired => {
                if tokio::time::Instant::now() >= deadline {
                    return None;
                }
                tokio::time::sleep(poll).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_oversized_request_line_is_bounded() {
        let input = format!("SETPIN 0x20 {}\nIDENTIFY 0x20 0x00\n", "f".repeat(4096));
        let mut reader = input.as_bytes();
        let mut line = String::new();

        // The flood is rejected without being accumulated.
        assert!(matches!(
            read_bounded_line(&mut reader, &mut line).await.unwrap(),
            LineRead::TooLong
        ));
        assert!(line.len() <= MAX_REQUEST_SIZE);

        // The connection recovers at the next request.
        assert!(matches!(
            read_bounded_line(&mut reader, &mut line).await.unwrap(),
            LineRead::Line
        ));
        assert_eq!(line, "IDENTIFY 0x20 0x00");

        assert!(matches!(
            read_bounded_line(&mut reader, &mut line).await.unwrap(),
            LineRead::Eof
        ));
    }

    #[tokio::test]
    async fn test_unterminated_final_line_is_delivered() {
        let mut reader = "IDENTIFY 0x20 0x00".as_bytes();
        let mut line = String::new();

        assert!(matches!(
            read_bounded_line(&mut reader, &mut line).await.unwrap(),
            LineRead::Line
        ));
        assert_eq!(line, "IDENTIFY 0x20 0x00");
    }
}
