//! Text command/response protocol spoken by the detector heads.
//!
//! Commands are `<head><verb> <args...>`, responses echo `<head><verb>`
//! and either carry fields or a negative device code glued to the verb.
//! Lines of the form `<head>!<payload>` are unsolicited.

use crate::error::DhiError;
use std::fmt;
use std::str::FromStr;

/// Bus address of the coincidence processor.
pub const CP_ADDRESS: u8 = 64;
/// Wire value selecting every block of a head in one command.
pub const ALL_BLOCKS: u16 = 255;
/// Marker separating the head address from an unsolicited payload.
pub const ASYNC_MARKER: char = '!';
pub const LINE_TERMINATOR: &str = "\r\n";

/// Command verbs understood by the head and coincidence processor firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    SetMode,
    SelectBlock,
    SetAnalog,
    GetAnalog,
    Zap,
    Calibrate,
    Query,
    Voltage,
    Singles,
    Upload,
    Download,
    Progress,
    TemperatureLimits,
    PointSource,
    HighVoltage,
    HighVoltageLevel,
    Reboot,
    Transmission,
    OsCommand,
}

impl Verb {
    pub fn letter(&self) -> char {
        match self {
            Verb::SetMode => 'M',
            Verb::SelectBlock => 'I',
            Verb::SetAnalog => 'S',
            Verb::GetAnalog => 'G',
            Verb::Zap => 'Z',
            Verb::Calibrate => 'X',
            Verb::Query => 'Q',
            Verb::Voltage => 'A',
            Verb::Singles => 'K',
            Verb::Upload => 'U',
            Verb::Download => 'D',
            Verb::Progress => 'P',
            Verb::TemperatureLimits => 'C',
            Verb::PointSource => 'F',
            Verb::HighVoltage => 'H',
            Verb::HighVoltageLevel => 'J',
            Verb::Reboot => 'R',
            Verb::Transmission => 'T',
            Verb::OsCommand => 'O',
        }
    }

    pub fn from_letter(c: char) -> Option<Verb> {
        let verb = match c {
            'M' => Verb::SetMode,
            'I' => Verb::SelectBlock,
            'S' => Verb::SetAnalog,
            'G' => Verb::GetAnalog,
            'Z' => Verb::Zap,
            'X' => Verb::Calibrate,
            'Q' => Verb::Query,
            'A' => Verb::Voltage,
            'K' => Verb::Singles,
            'U' => Verb::Upload,
            'D' => Verb::Download,
            'P' => Verb::Progress,
            'C' => Verb::TemperatureLimits,
            'F' => Verb::PointSource,
            'H' => Verb::HighVoltage,
            'J' => Verb::HighVoltageLevel,
            'R' => Verb::Reboot,
            'T' => Verb::Transmission,
            'O' => Verb::OsCommand,
            _ => return None,
        };
        Some(verb)
    }
}

/// One outgoing command line, without terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    head: u8,
    verb: Verb,
    args: Vec<String>,
}

impl Command {
    pub fn new(head: u8, verb: Verb) -> Self {
        Command {
            head,
            verb,
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl fmt::Display) -> Self {
        self.args.push(arg.to_string());
        self
    }

    /// Builds a command from caller-supplied text such as `"3Q 1"`.
    pub fn parse(text: &str) -> Result<Self, DhiError> {
        let text = text.trim();
        let (head, rest) = split_head(text)
            .ok_or_else(|| DhiError::argument(format!("no head address in {:?}", text)))?;
        let mut chars = rest.chars();
        let verb = chars
            .next()
            .and_then(Verb::from_letter)
            .ok_or_else(|| DhiError::argument(format!("unknown verb in {:?}", text)))?;
        let args = chars
            .as_str()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        Ok(Command { head, verb, args })
    }

    pub fn head(&self) -> u8 {
        self.head
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn text(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.head, self.verb.letter())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// A parsed response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub head: u8,
    pub verb: Verb,
    /// Zero on success, otherwise the negative device code.
    pub status: i32,
    pub fields: Vec<String>,
}

impl Response {
    pub fn parse(line: &str) -> Result<Self, DhiError> {
        let line = line.trim();
        let (head, rest) = split_head(line)
            .ok_or_else(|| DhiError::Parse(format!("no head address in {:?}", line)))?;
        let mut chars = rest.chars();
        let verb = chars
            .next()
            .and_then(Verb::from_letter)
            .ok_or_else(|| DhiError::Parse(format!("unknown verb in {:?}", line)))?;
        let rest = chars.as_str();

        if let Some(code_text) = rest.strip_prefix('-') {
            let mut tokens = code_text.split_whitespace();
            let code: i32 = tokens
                .next()
                .and_then(|t| t.parse().ok())
                .ok_or_else(|| DhiError::Parse(format!("bad status code in {:?}", line)))?;
            return Ok(Response {
                head,
                verb,
                status: -code,
                fields: tokens.map(str::to_string).collect(),
            });
        }

        if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
            return Err(DhiError::Parse(format!("malformed response {:?}", line)));
        }
        Ok(Response {
            head,
            verb,
            status: 0,
            fields: rest.split_whitespace().map(str::to_string).collect(),
        })
    }

    pub fn answers(&self, command: &Command) -> bool {
        self.head == command.head && self.verb == command.verb
    }

    pub fn is_ok(&self) -> bool {
        self.status >= 0
    }

    /// Converts a negative status into a device error.
    pub fn into_result(self) -> Result<Self, DhiError> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(DhiError::device(self.head, self.status))
        }
    }

    /// Reads field `index`, validating it exists before trusting it.
    pub fn field<T: FromStr>(&self, index: usize, name: &str) -> Result<T, DhiError> {
        let raw = self.fields.get(index).ok_or_else(|| {
            DhiError::Parse(format!(
                "response {}{} has {} fields, {} missing",
                self.head,
                self.verb.letter(),
                self.fields.len(),
                name
            ))
        })?;
        raw.parse()
            .map_err(|_| DhiError::Parse(format!("field {} = {:?} is not valid", name, raw)))
    }

    pub fn int_fields(&self) -> Result<Vec<i64>, DhiError> {
        self.fields
            .iter()
            .map(|f| {
                f.parse::<i64>()
                    .map_err(|_| DhiError::Parse(format!("non-numeric field {:?}", f)))
            })
            .collect()
    }

    pub fn require_fields(&self, count: usize) -> Result<(), DhiError> {
        if self.fields.len() < count {
            return Err(DhiError::Parse(format!(
                "response {}{} has {} fields, expected {}",
                self.head,
                self.verb.letter(),
                self.fields.len(),
                count
            )));
        }
        Ok(())
    }

    pub fn joined(&self) -> String {
        self.fields.join(" ")
    }
}

/// Payload of an unsolicited line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncPayload {
    Error(i32),
    Message(String),
}

/// Unsolicited device line not matched to any outstanding command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncNotice {
    pub head: Option<u8>,
    pub payload: AsyncPayload,
}

/// Classification of one received line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Response(Response),
    Async(AsyncNotice),
    Garbage(String),
}

pub fn classify_line(line: &str) -> Line {
    let trimmed = line.trim();
    let digits = trimmed.chars().take_while(|c| c.is_ascii_digit()).count();
    if trimmed[digits..].starts_with(ASYNC_MARKER) {
        let head = trimmed[..digits].parse::<u8>().ok();
        let payload = trimmed[digits + 1..].trim();
        let code = payload
            .split_whitespace()
            .next()
            .filter(|t| t.starts_with('-'))
            .and_then(|t| t.parse::<i32>().ok());
        let payload = match code {
            Some(code) => AsyncPayload::Error(code),
            None => AsyncPayload::Message(payload.to_string()),
        };
        return Line::Async(AsyncNotice { head, payload });
    }
    match Response::parse(trimmed) {
        Ok(response) => Line::Response(response),
        Err(_) => Line::Garbage(trimmed.to_string()),
    }
}

/// Sum used by the firmware for settings tables: values wrap as u32.
pub fn settings_sum<'a>(values: impl IntoIterator<Item = &'a i32>) -> u32 {
    values
        .into_iter()
        .fold(0u32, |acc, v| acc.wrapping_add(*v as u32))
}

/// Additive checksum over transfer bytes.
pub fn byte_sum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |acc, b| acc.wrapping_add(u16::from(*b)))
}

fn split_head(text: &str) -> Option<(u8, &str)> {
    let digits = text.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let head = text[..digits].parse().ok()?;
    Some((head, &text[digits..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_text() {
        let cmd = Command::new(2, Verb::SetMode).arg(0).arg(1).arg(250).arg(700);
        assert_eq!(cmd.text(), "2M 0 1 250 700");
        assert_eq!(Command::new(64, Verb::Singles).text(), "64K");
        assert_eq!(Command::new(5, Verb::Reboot).arg(999).text(), "5R 999");
    }

    #[test]
    fn test_parse_command() {
        let cmd = Command::parse(" 3Q 1 ").unwrap();
        assert_eq!(cmd.head(), 3);
        assert_eq!(cmd.verb(), Verb::Query);
        assert_eq!(cmd.args(), &["1".to_string()]);
        assert!(Command::parse("Q 1").is_err());
        assert!(Command::parse("3W 1").is_err());
    }

    #[test]
    fn test_parse_response() {
        let r = Response::parse("2Q 0 1 117 250 700\r\n").unwrap();
        assert_eq!(r.head, 2);
        assert_eq!(r.verb, Verb::Query);
        assert!(r.is_ok());
        assert_eq!(r.field::<u16>(2, "block").unwrap(), 117);
        assert!(r.field::<u16>(9, "missing").is_err());

        let err = Response::parse("2M-7").unwrap();
        assert_eq!(err.status, -7);
        assert!(err.into_result().unwrap_err().is_benign());

        let bare = Response::parse("12I").unwrap();
        assert_eq!(bare.head, 12);
        assert!(bare.fields.is_empty());

        assert!(Response::parse("2Mx 3").is_err());
        assert!(Response::parse("M 3").is_err());
    }

    #[test]
    fn test_negative_fields_are_not_status() {
        let r = Response::parse("1G 3 -12 4").unwrap();
        assert!(r.is_ok());
        assert_eq!(r.int_fields().unwrap(), vec![3, -12, 4]);
    }

    #[test]
    fn test_classify_line() {
        match classify_line("3! -8 hv trip") {
            Line::Async(n) => {
                assert_eq!(n.head, Some(3));
                assert_eq!(n.payload, AsyncPayload::Error(-8));
            }
            other => panic!("unexpected {:?}", other),
        }
        match classify_line("64!scan started") {
            Line::Async(n) => assert_eq!(n.payload, AsyncPayload::Message("scan started".into())),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(classify_line("2O hello!"), Line::Response(_)));
        assert!(matches!(classify_line("\u{7f}#2M"), Line::Garbage(_)));
    }

    #[test]
    fn test_sums() {
        assert_eq!(byte_sum(&[0xFF, 0x02]), 0x101);
        assert_eq!(settings_sum(&[1, 2, -1]), 2);
    }
}
