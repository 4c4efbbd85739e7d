use clap::{App, Arg};
use colored::*;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8888";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("pinbroker")
        .version("0.1.0")
        .author("Hardware Platform Team")
        .about("Client for the pinbrokerd I/O expander command broker")
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Broker host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Broker port")
                .takes_value(true)
                .default_value(DEFAULT_PORT),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["plain", "json"])
                .default_value("plain"),
        )
        .arg(
            Arg::with_name("VERB")
                .help("Command verb (e.g. SETPIN, GETDIRREG, IDENTIFY) or STATS")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("BOARD")
                .help("Board address in hex (0x20-0x27)")
                .index(2),
        )
        .arg(
            Arg::with_name("ARG")
                .help("Pin index (0x00-0x0F) or register half (0x00/0x01)")
                .index(3),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT);
    let format = matches.value_of("format").unwrap_or("plain");
    let verb = matches.value_of("VERB").unwrap_or("").to_uppercase();

    let request = if verb == "STATS" {
        verb
    } else {
        let board = matches.value_of("BOARD").unwrap_or("0x20");
        // IDENTIFY takes a dummy argument; the frame is always 3 fields.
        let arg = matches.value_of("ARG").unwrap_or("0x00");
        format!("{verb} {board} {arg}")
    };

    let stream = TcpStream::connect(format!("{host}:{port}")).await?;
    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);

    writer.write_all(request.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    let mut response = String::new();
    buf_reader.read_line(&mut response).await?;
    let response = response.trim();

    match format {
        "json" => {
            let body = serde_json::json!({
                "request": request,
                "response": response,
            });
            println!("{body}");
        }
        _ => {
            if response.ends_with("OK") {
                println!("{} {}", response.trim_end_matches("OK"), "OK".green().bold());
            } else if response.starts_with("Error") {
                println!("{}", response.red());
            } else {
                println!("{response}");
            }
        }
    }

    Ok(())
}
