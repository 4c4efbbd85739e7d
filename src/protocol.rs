//! Command protocol: the nine verbs, the queued `Command` unit of work,
//! the `PendingResult` it produces, and the wire-text encoding used by
//! the TCP server (`VERB BOARD ARG` hex triplets, `<value> OK` replies).

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_REQUEST_SIZE: usize = 128;
pub const MAX_RESPONSE_SIZE: usize = 256;

pub type ResponseBuffer = ArrayString<MAX_RESPONSE_SIZE>;

/// Opaque correlation identifier handed back at submission time.
pub type Token = u64;

/// The nine command kinds the broker understands.
///
/// Pin verbs carry a pin index (0-15) in the command argument, the
/// whole-register verbs carry a half selector (0 = A, 1 = B), and
/// IDENTIFY ignores the argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verb {
    /// Probe board presence.
    Identify,
    /// Read one direction bit (1 = input, 0 = output).
    GetDirBit,
    /// Read a full 8-bit direction register.
    GetDirReg,
    /// Read a full 8-bit state register.
    GetIoReg,
    /// Set a direction bit to input.
    SetDirBit,
    /// Set a direction bit to output.
    ClrDirBit,
    /// Read the logic level of one pin.
    GetPin,
    /// Drive an output pin high.
    SetPin,
    /// Drive an output pin low.
    ClrPin,
}

pub const ALL_VERBS: [Verb; 9] = [
    Verb::Identify,
    Verb::GetDirBit,
    Verb::GetDirReg,
    Verb::GetIoReg,
    Verb::SetDirBit,
    Verb::ClrDirBit,
    Verb::GetPin,
    Verb::SetPin,
    Verb::ClrPin,
];

impl Verb {
    pub fn wire_name(self) -> &'static str {
        match self {
            Verb::Identify => "IDENTIFY",
            Verb::GetDirBit => "GETDBIT",
            Verb::GetDirReg => "GETDIRREG",
            Verb::GetIoReg => "GETIOREG",
            Verb::SetDirBit => "SETDBIT",
            Verb::ClrDirBit => "CLRDBIT",
            Verb::GetPin => "GETPIN",
            Verb::SetPin => "SETPIN",
            Verb::ClrPin => "CLRPIN",
        }
    }

    /// Whole-register verbs take a half selector instead of a pin index.
    pub fn takes_register_half(self) -> bool {
        matches!(self, Verb::GetDirReg | Verb::GetIoReg)
    }

    /// Value published when execution or validation fails. Read verbs
    /// get the failure sentinel so a caller can tell "no answer from
    /// the hardware" apart from a legitimate zero; write verbs and
    /// IDENTIFY report an unset flag.
    pub fn failure_value(self) -> CommandValue {
        match self {
            Verb::Identify | Verb::SetDirBit | Verb::ClrDirBit | Verb::SetPin | Verb::ClrPin => {
                CommandValue::Flag(false)
            }
            Verb::GetDirBit | Verb::GetDirReg | Verb::GetIoReg | Verb::GetPin => {
                CommandValue::Failed
            }
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl FromStr for Verb {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_VERBS
            .iter()
            .copied()
            .find(|v| v.wire_name() == s)
            .ok_or(ParseError::UnknownVerb)
    }
}

/// One unit of work. Immutable once submitted; only the store's
/// retention mechanism removes it.
#[derive(Debug, Clone, Copy)]
pub struct Command {
    pub token: Token,
    pub verb: Verb,
    /// 7-bit bus address, validated at execution time.
    pub board: u8,
    /// Pin index or register-half selector, depending on the verb.
    pub arg: u8,
    pub submitted_at: Instant,
}

/// Chip-specific value produced by executing a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandValue {
    /// Success flag of a write verb, or IDENTIFY presence.
    Flag(bool),
    /// Single bit read (0 or 1).
    Bit(u8),
    /// Full 8-bit register read.
    Byte(u8),
    /// Read verb failure sentinel: the bus gave no usable answer.
    Failed,
}

/// Created only by the dispatcher; clients never publish results.
#[derive(Debug, Clone, Copy)]
pub struct PendingResult {
    pub token: Token,
    pub value: CommandValue,
    pub produced_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Error: commands must have 3 fields: (command, board, data).")]
    FieldCount,
    #[error("Error: first field must be one of IDENTIFY, GETDBIT, GETDIRREG, GETIOREG, SETDBIT, CLRDBIT, GETPIN, SETPIN, CLRPIN.")]
    UnknownVerb,
    #[error("Error: wrongly formatted board address.")]
    BadBoardField,
    #[error("Error: wrongly formatted data byte.")]
    BadArgField,
    #[error("Error: request exceeds buffer size.")]
    RequestTooLarge,
}

/// A parsed wire request, not yet validated against the register model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireRequest {
    pub verb: Verb,
    pub board: u8,
    pub arg: u8,
}

/// Parse one request line: a verb, a board address, and a pin/half
/// argument, hex-formatted and space-separated. IDENTIFY still requires
/// a (dummy) third field, keeping the three-field frame fixed.
pub fn parse_request(line: &str) -> Result<WireRequest, ParseError> {
    if line.len() > MAX_REQUEST_SIZE {
        return Err(ParseError::RequestTooLarge);
    }

    let mut fields = line.split_whitespace();
    let verb = fields.next().ok_or(ParseError::FieldCount)?;
    let board = fields.next().ok_or(ParseError::FieldCount)?;
    let arg = fields.next().ok_or(ParseError::FieldCount)?;
    if fields.next().is_some() {
        return Err(ParseError::FieldCount);
    }

    let verb = verb.parse::<Verb>()?;
    let board = parse_hex_byte(board).ok_or(ParseError::BadBoardField)?;
    let arg = parse_hex_byte(arg).ok_or(ParseError::BadArgField)?;

    Ok(WireRequest { verb, board, arg })
}

fn parse_hex_byte(field: &str) -> Option<u8> {
    let digits = field
        .strip_prefix("0x")
        .or_else(|| field.strip_prefix("0X"))
        .unwrap_or(field);
    u8::from_str_radix(digits, 16).ok()
}

/// Render a result value as a wire response line (without newline).
pub fn format_response(value: CommandValue) -> ResponseBuffer {
    use std::fmt::Write;

    let mut buf = ResponseBuffer::new();
    // Buffer is sized well past the longest rendering.
    let _ = match value {
        CommandValue::Flag(flag) => write!(buf, "0x{:02X} OK", u8::from(flag)),
        CommandValue::Bit(bit) => write!(buf, "0x{bit:02X} OK"),
        CommandValue::Byte(byte) => write!(buf, "0x{byte:02X} OK"),
        CommandValue::Failed => write!(buf, "Error: bus transaction failed."),
    };
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_wire_names_round_trip() {
        for verb in ALL_VERBS {
            assert_eq!(verb.wire_name().parse::<Verb>(), Ok(verb));
        }
        assert_eq!("TOGGLE".parse::<Verb>(), Err(ParseError::UnknownVerb));
    }

    #[test]
    fn test_parse_request_happy_path() {
        let req = parse_request("SETPIN 0x20 0x05").unwrap();
        assert_eq!(req.verb, Verb::SetPin);
        assert_eq!(req.board, 0x20);
        assert_eq!(req.arg, 0x05);

        // Bare hex digits and a dummy IDENTIFY arg are accepted.
        let req = parse_request("IDENTIFY 23 00").unwrap();
        assert_eq!(req.verb, Verb::Identify);
        assert_eq!(req.board, 0x23);
    }

    #[test]
    fn test_parse_request_field_count() {
        assert_eq!(parse_request("SETPIN 0x20"), Err(ParseError::FieldCount));
        assert_eq!(
            parse_request("SETPIN 0x20 0x05 extra"),
            Err(ParseError::FieldCount)
        );
        assert_eq!(parse_request(""), Err(ParseError::FieldCount));
    }

    #[test]
    fn test_parse_request_bad_fields() {
        assert_eq!(
            parse_request("SETPIN board 0x05"),
            Err(ParseError::BadBoardField)
        );
        assert_eq!(
            parse_request("SETPIN 0x20 pin"),
            Err(ParseError::BadArgField)
        );
    }

    #[test]
    fn test_format_response() {
        assert_eq!(&format_response(CommandValue::Flag(true))[..], "0x01 OK");
        assert_eq!(&format_response(CommandValue::Flag(false))[..], "0x00 OK");
        assert_eq!(&format_response(CommandValue::Byte(0xAB))[..], "0xAB OK");
        assert_eq!(
            &format_response(CommandValue::Failed)[..],
            "Error: bus transaction failed."
        );
    }

    #[test]
    fn test_failure_values_by_verb() {
        assert_eq!(Verb::SetPin.failure_value(), CommandValue::Flag(false));
        assert_eq!(Verb::Identify.failure_value(), CommandValue::Flag(false));
        assert_eq!(Verb::GetPin.failure_value(), CommandValue::Failed);
        assert_eq!(Verb::GetDirReg.failure_value(), CommandValue::Failed);
    }
}
