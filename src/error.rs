//! Error taxonomy shared by every layer of the crate.

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Coarse error classes used when reporting failures to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller value out of range, detected before any I/O.
    Argument,
    /// Timeout, bus conflict or correlation failure on the link.
    Transport,
    /// Negative status reported by the hardware.
    Device,
    /// Settings or transfer integrity failure.
    Checksum,
    /// Allocation, file or thread resource failure.
    Resource,
}

/// Whether a device error stops the operation that received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Fatal,
    Benign,
}

/// Status codes the head firmware reports after the echoed head/verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCode {
    UnknownCommand,
    BadArgument,
    Busy,
    HardwareTimeout,
    Checksum,
    EndOfFile,
    OutOfRange,
    HardwareFault,
    NoSuchFile,
    WrongMode,
    Other(i32),
}

impl DeviceCode {
    pub fn from_code(code: i32) -> Self {
        match code {
            -1 => DeviceCode::UnknownCommand,
            -2 => DeviceCode::BadArgument,
            -3 => DeviceCode::Busy,
            -4 => DeviceCode::HardwareTimeout,
            -5 => DeviceCode::Checksum,
            -6 => DeviceCode::EndOfFile,
            -7 => DeviceCode::OutOfRange,
            -8 => DeviceCode::HardwareFault,
            -9 => DeviceCode::NoSuchFile,
            -10 => DeviceCode::WrongMode,
            other => DeviceCode::Other(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            DeviceCode::UnknownCommand => -1,
            DeviceCode::BadArgument => -2,
            DeviceCode::Busy => -3,
            DeviceCode::HardwareTimeout => -4,
            DeviceCode::Checksum => -5,
            DeviceCode::EndOfFile => -6,
            DeviceCode::OutOfRange => -7,
            DeviceCode::HardwareFault => -8,
            DeviceCode::NoSuchFile => -9,
            DeviceCode::WrongMode => -10,
            DeviceCode::Other(code) => *code,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            DeviceCode::UnknownCommand => "unknown command",
            DeviceCode::BadArgument => "bad argument",
            DeviceCode::Busy => "busy, operation in progress",
            DeviceCode::HardwareTimeout => "hardware timeout",
            DeviceCode::Checksum => "checksum error",
            DeviceCode::EndOfFile => "end of file",
            DeviceCode::OutOfRange => "calibration value out of range",
            DeviceCode::HardwareFault => "hardware fault",
            DeviceCode::NoSuchFile => "no such file",
            DeviceCode::WrongMode => "wrong mode for command",
            DeviceCode::Other(_) => "unrecognised device error",
        }
    }

    /// End of file and out-of-range calibration values do not abort an operation.
    pub fn class(&self) -> ErrorClass {
        match self {
            DeviceCode::EndOfFile | DeviceCode::OutOfRange => ErrorClass::Benign,
            _ => ErrorClass::Fatal,
        }
    }
}

#[derive(Error, Debug)]
/// Errors that can occur when talking to the detector heads.
pub enum DhiError {
    #[error("Argument error: {0}")]
    Argument(String),
    #[error("Timeout after {0:?} waiting for response")]
    Timeout(Duration),
    #[error("Bus conflict: {0}")]
    BusConflict(String),
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: String },
    #[error("Device error {code} on head {head}: {description}")]
    Device {
        head: u8,
        code: i32,
        description: &'static str,
    },
    #[error("Checksum error: expected {expected:#X}, got {actual:#X}")]
    Checksum { expected: u32, actual: u32 },
    #[error("Resource error: {0}")]
    Resource(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Thread communication error: {0}")]
    ThreadComm(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DhiError {
    pub fn device(head: u8, code: i32) -> Self {
        DhiError::Device {
            head,
            code,
            description: DeviceCode::from_code(code).description(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DhiError::Argument(_) | DhiError::Config(_) => ErrorKind::Argument,
            DhiError::Timeout(_)
            | DhiError::BusConflict(_)
            | DhiError::RetryExhausted { .. }
            | DhiError::Serial(_)
            | DhiError::Parse(_) => ErrorKind::Transport,
            DhiError::Device { .. } => ErrorKind::Device,
            DhiError::Checksum { .. } => ErrorKind::Checksum,
            DhiError::Resource(_) | DhiError::Io(_) | DhiError::ThreadComm(_) => {
                ErrorKind::Resource
            }
        }
    }

    /// Stable numeric code for the uniform result. Device errors keep
    /// the hardware's own code; host-side failures use -100 and below.
    pub fn code(&self) -> i32 {
        match self {
            DhiError::Device { code, .. } => *code,
            DhiError::Argument(_) => -100,
            DhiError::Config(_) => -101,
            DhiError::Timeout(_) => -110,
            DhiError::BusConflict(_) => -111,
            DhiError::RetryExhausted { .. } => -112,
            DhiError::Parse(_) => -113,
            DhiError::Serial(_) => -114,
            DhiError::Checksum { .. } => -120,
            DhiError::Resource(_) => -130,
            DhiError::Io(_) => -131,
            DhiError::ThreadComm(_) => -132,
        }
    }

    pub fn device_code(&self) -> Option<DeviceCode> {
        match self {
            DhiError::Device { code, .. } => Some(DeviceCode::from_code(*code)),
            _ => None,
        }
    }

    pub fn is_benign(&self) -> bool {
        self.device_code()
            .map(|c| c.class() == ErrorClass::Benign)
            .unwrap_or(false)
    }

    pub(crate) fn argument(msg: impl Into<String>) -> Self {
        DhiError::Argument(msg.into())
    }
}

/// Failure of one Controller operation, naming the operation and head.
#[derive(Debug)]
pub struct OpError {
    pub op: &'static str,
    pub head: Option<u8>,
    pub source: DhiError,
}

impl OpError {
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }

    pub fn code(&self) -> i32 {
        self.source.code()
    }
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.head {
            Some(head) => write!(f, "{} (head {}): {}", self.op, head, self.source),
            None => write!(f, "{}: {}", self.op, self.source),
        }
    }
}

impl std::error::Error for OpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Result type of every Controller operation.
pub type OpResult<T> = Result<T, OpError>;

/// Uniform (success, code, message) triple handed to callers that do
/// not want to match on error variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub success: bool,
    pub code: i32,
    pub message: String,
}

impl Outcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Outcome {
            success: true,
            code: 0,
            message: message.into(),
        }
    }
}

impl<T> From<&OpResult<T>> for Outcome {
    fn from(result: &OpResult<T>) -> Self {
        match result {
            Ok(_) => Outcome::ok("ok"),
            Err(e) => Outcome {
                success: false,
                code: e.code(),
                message: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_codes() {
        for code in -10..=-1 {
            assert_eq!(DeviceCode::from_code(code).code(), code);
        }
        assert_eq!(DeviceCode::from_code(-42), DeviceCode::Other(-42));
        assert_eq!(DeviceCode::EndOfFile.class(), ErrorClass::Benign);
        assert_eq!(DeviceCode::OutOfRange.class(), ErrorClass::Benign);
        assert_eq!(DeviceCode::Busy.class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_kinds_and_codes() {
        let e = DhiError::device(3, -7);
        assert_eq!(e.kind(), ErrorKind::Device);
        assert_eq!(e.code(), -7);
        assert!(e.is_benign());
        assert!(!DhiError::device(3, -8).is_benign());

        assert_eq!(DhiError::Timeout(Duration::from_secs(1)).kind(), ErrorKind::Transport);
        assert_ne!(
            DhiError::Timeout(Duration::from_secs(1)).code(),
            DhiError::RetryExhausted { attempts: 3, last: String::new() }.code()
        );
        assert_eq!(DhiError::argument("x").kind(), ErrorKind::Argument);
    }

    #[test]
    fn test_outcome_embeds_operation_and_head() {
        let result: OpResult<()> = Err(OpError {
            op: "set_head_mode",
            head: Some(2),
            source: DhiError::argument("mode TEST not allowed"),
        });
        let outcome = Outcome::from(&result);
        assert!(!outcome.success);
        assert_eq!(outcome.code, -100);
        assert!(outcome.message.contains("set_head_mode"));
        assert!(outcome.message.contains("head 2"));
    }
}
