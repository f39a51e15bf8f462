//! RemoteEx wire format.
//!
//! Protocol Overview:
//! - Two TCP sockets on adjacent ports: commands on `port`, raw image data on `port + 1`
//! - Greetings: `RemoteEx Ready\r` (command) and `RemoteEx Data Ready\r` (data)
//! - Request: `Name(arg1,arg2,...)\r`, latin-1 text
//! - Reply: `code,Name,field,...\r`
//! - A `\r\n` pair is a line break inside one message (e.g. `CameraInfo`),
//!   only a `\r` not followed by `\n` ends a message
//!
//! Status codes 4 and 5 are unsolicited: code 4 from `Livemonitor` announces
//! a new image in the ring buffer, everything else is a log line.

use std::fmt::Write as _;

use crate::error::{RemoteExError, RxResult};

/// Greeting sent on the command socket right after connect.
pub const CMD_GREETING: &[u8] = b"RemoteEx Ready\r";

/// Greeting sent on the data socket right after connect.
pub const DATA_GREETING: &[u8] = b"RemoteEx Data Ready\r";

/// Command executed.
pub const STATUS_OK: i32 = 0;
/// Asynchronous notification (image ready or log line).
pub const STATUS_ASYNC: i32 = 4;
/// Log line.
pub const STATUS_LOG: i32 = 5;
/// Another command (usually an acquisition) is still running.
pub const STATUS_BUSY: i32 = 7;

/// Name of the function announcing new ring-buffer images.
pub const LIVE_MONITOR: &str = "Livemonitor";

/// Human readable description of a RemoteEx status code.
pub fn describe_status(code: i32) -> &'static str {
    match code {
        0 => "Command successfully executed",
        1 => "Invalid syntax for command",
        2 => "Command or Parameters are unknown",
        3 => "Command currently not possible",
        6 => "Parameter is missing",
        7 => "Command cannot be executed",
        8 => "An error has occurred during execution",
        9 => "Data cannot be sent by TCP-IP",
        10 => "Value of a parameter is out of range",
        _ => "Unknown RemoteEx error",
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Values accepted as command arguments.
pub trait WireValue {
    /// Text sent on the wire.
    fn to_wire(&self) -> String;
}

impl WireValue for &str {
    fn to_wire(&self) -> String {
        (*self).to_string()
    }
}

impl WireValue for String {
    fn to_wire(&self) -> String {
        self.clone()
    }
}

impl WireValue for f64 {
    fn to_wire(&self) -> String {
        format_float(*self)
    }
}

macro_rules! int_wire_value {
    ($($t:ty),*) => {
        $(impl WireValue for $t {
            fn to_wire(&self) -> String {
                self.to_string()
            }
        })*
    };
}

int_wire_value!(i32, i64, u32, u64, usize);

/// Format a float the way RemoteEx accepts it: 11 decimals, then trailing
/// zeros and a trailing point removed (`2.0` -> `"2"`, `2e-8` -> `"0.00000002"`).
pub fn format_float(value: f64) -> String {
    let text = format!("{value:.11}");
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// A command and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    args: Vec<String>,
}

impl Command {
    /// Command without arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Append an argument.
    pub fn arg(mut self, value: impl WireValue) -> Self {
        self.args.push(value.to_wire());
        self
    }

    /// Function name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Formatted arguments.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Bytes sent on the command socket. Characters outside latin-1 become `?`.
    pub fn encode(&self) -> Vec<u8> {
        let text = format!("{}({})\r", self.name, self.args.join(","));
        text.chars()
            .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
            .collect()
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name, self.args.join(","))
    }
}

// =============================================================================
// Replies
// =============================================================================

/// A decoded message from the command socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Status code.
    pub code: i32,
    /// Function or notification name.
    pub function: String,
    /// Result fields.
    pub args: Vec<String>,
}

impl Response {
    /// Whether the reply belongs to `command` (names compare case-insensitively).
    pub fn answers(&self, command: &str) -> bool {
        self.function.eq_ignore_ascii_case(command)
    }
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.code, self.function)?;
        for arg in &self.args {
            write!(f, ",{arg}")?;
        }
        Ok(())
    }
}

/// Parse one complete message (without its terminator).
///
/// A single trailing empty field, as in `0,AcqStart,`, is dropped so that a
/// command without results yields no arguments.
pub fn decode_message(msg: &str) -> RxResult<Response> {
    let mut fields = msg.split(',');
    let code_field = fields.next().unwrap_or_default();
    let code = code_field
        .trim()
        .parse::<i32>()
        .map_err(|e| RemoteExError::Protocol {
            raw: escape(msg.as_bytes()),
            reason: format!("status '{}' is not an integer ({e})", escape(code_field.as_bytes())),
        })?;
    let function = fields.next().ok_or_else(|| RemoteExError::Protocol {
        raw: escape(msg.as_bytes()),
        reason: "missing function name".to_string(),
    })?;
    let mut args: Vec<String> = fields.map(str::to_string).collect();
    if args.last().is_some_and(String::is_empty) {
        args.pop();
    }
    Ok(Response {
        code,
        function: function.to_string(),
        args,
    })
}

/// Reassembles messages from a byte stream that may cut them anywhere.
#[derive(Debug, Default)]
pub struct MessageDecoder {
    residual: Vec<u8>,
}

impl MessageDecoder {
    /// Empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.residual.extend_from_slice(bytes);
    }

    /// Bytes waiting for their terminator.
    pub fn pending(&self) -> usize {
        self.residual.len()
    }

    /// Split off every complete message received so far.
    ///
    /// A `\r` at the very end of the buffer counts as a terminator.
    pub fn take_messages(&mut self) -> Vec<String> {
        let mut messages = Vec::new();
        let mut start = 0;
        let mut i = 0;
        while i < self.residual.len() {
            if self.residual[i] == b'\r' && self.residual.get(i + 1) != Some(&b'\n') {
                messages.push(latin1(&self.residual[start..i]));
                start = i + 1;
            }
            i += 1;
        }
        self.residual.drain(..start);
        messages
    }
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Printable form of wire bytes, with control characters escaped.
pub fn escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'\r' => out.push_str("\\r"),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(char::from(b)),
            _ => {
                let _ = write!(out, "\\x{b:02x}");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_commands() {
        let cmd = Command::new("DevParamSet")
            .arg("Delaybox")
            .arg("Delay B")
            .arg(0.00000002);
        assert_eq!(cmd.encode(), b"DevParamSet(Delaybox,Delay B,0.00000002)\r".to_vec());
        assert_eq!(Command::new("AppEnd").encode(), b"AppEnd()\r".to_vec());
        assert_eq!(cmd.to_string(), "DevParamSet(Delaybox,Delay B,0.00000002)");
    }

    #[test]
    fn formats_numbers() {
        assert_eq!(format_float(2.0), "2");
        assert_eq!(format_float(0.0), "0");
        assert_eq!(format_float(1.5), "1.5");
        assert_eq!(format_float(2e-8), "0.00000002");
        assert_eq!(3_i64.to_wire(), "3");
    }

    #[test]
    fn non_latin1_becomes_question_mark() {
        assert_eq!(Command::new("AppInfo").arg("µ€").encode(), b"AppInfo(\xb5?)\r".to_vec());
    }

    #[test]
    fn decodes_replies() {
        let r = decode_message("0,CamParamGet,2 x 2").unwrap();
        assert_eq!(r.code, 0);
        assert!(r.answers("camparamget"));
        assert_eq!(r.args, vec!["2 x 2"]);

        let empty = decode_message("0,AcqStart,").unwrap();
        assert!(empty.args.is_empty());

        let bare = decode_message("0,AcqStart").unwrap();
        assert!(bare.args.is_empty());
    }

    #[test]
    fn rejects_malformed_replies() {
        assert!(matches!(
            decode_message("RemoteEx,Ready"),
            Err(RemoteExError::Protocol { .. })
        ));
        assert!(matches!(decode_message("0"), Err(RemoteExError::Protocol { .. })));
    }

    #[test]
    fn round_trip_through_reply() {
        let cmd = Command::new("ImgRingBufferGet").arg("Data").arg(12_u64);
        let reply = format!("0,{},{}", cmd.name(), cmd.args().join(","));
        let decoded = decode_message(&reply).unwrap();
        assert_eq!(decoded.function, "ImgRingBufferGet");
        assert_eq!(decoded.args, cmd.args());
    }

    #[test]
    fn crlf_is_not_a_boundary() {
        let mut decoder = MessageDecoder::new();
        decoder.push(b"0,CamParamGet,C4742\r\nVersion 1\r4,Livemonitor,5\r0,Acq");
        let msgs = decoder.take_messages();
        assert_eq!(msgs, vec!["0,CamParamGet,C4742\r\nVersion 1", "4,Livemonitor,5"]);
        assert_eq!(decoder.pending(), 5);

        decoder.push(b"Stop,\r");
        assert_eq!(decoder.take_messages(), vec!["0,AcqStop,"]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn split_notification_is_reassembled() {
        let mut decoder = MessageDecoder::new();
        decoder.push(b"4,Livemonitor,12");
        assert!(decoder.take_messages().is_empty());
        decoder.push(b"3\r");
        let msgs = decoder.take_messages();
        assert_eq!(msgs.len(), 1);
        let r = decode_message(&msgs[0]).unwrap();
        assert_eq!(r.args, vec!["123"]);
    }

    #[test]
    fn escapes_control_characters() {
        assert_eq!(escape(b"a\r\n\x01"), "a\\r\\n\\x01");
    }
}
