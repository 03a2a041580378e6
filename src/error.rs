use std::{fmt, result};

pub type Result<T> = result::Result<T, Error>;

/// Basic error type for instrument communication
#[derive(Clone, Debug, PartialEq)]
pub struct Error {
    code: ErrorCode,
    message: String,
}

impl Error {
    /// Create an Error with the provided code and message
    pub fn new<S>(code: ErrorCode, message: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Create a generic failure Error
    pub fn failure<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self::new(ErrorCode::Failure, message)
    }

    /// Create a Timeout Error (I/O deadline exceeded)
    pub fn timeout<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self::new(ErrorCode::Timeout, message)
    }

    /// Create a Decode Error (non-ASCII byte or malformed response)
    pub fn decode<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self::new(ErrorCode::Decode, message)
    }

    /// Create a NoDevice Error (discovery got no reply or an unknown model)
    pub fn no_device<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self::new(ErrorCode::NoDevice, message)
    }

    /// Create a Version Error (firmware too old and no fallback form exists)
    pub fn version<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self::new(ErrorCode::Version, message)
    }

    /// Create an UnknownStat Error (statistics table lookup miss)
    pub fn unknown_stat(name: &str) -> Self {
        Self::new(ErrorCode::UnknownStat, format!("unknown statistic: {name}"))
    }

    /// Create an UnknownUnit Error (engineering-unit table lookup miss)
    pub fn unknown_unit(name: &str) -> Self {
        Self::new(ErrorCode::UnknownUnit, format!("unknown unit: {name}"))
    }

    /// Create an UnknownGas Error (gas table lookup miss)
    pub fn unknown_gas(name: &str) -> Self {
        Self::new(ErrorCode::UnknownGas, format!("unknown gas: {name}"))
    }

    /// Create a TooManyStats Error (more than the request frame allows)
    pub fn too_many_stats(have: usize, max: usize) -> Self {
        Self::new(
            ErrorCode::TooManyStats,
            format!("request accepts at most {max} statistics, have: {have}"),
        )
    }

    /// Create an InvalidArgument Error
    pub fn invalid_argument<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    /// Create a TransportClosed Error (operation on a closed handle)
    pub fn closed<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self::new(ErrorCode::TransportClosed, message)
    }

    /// Get the error code
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        self.message.as_str()
    }

    /// Gets whether the error is a timeout
    ///
    /// The logger tolerates per-tick timeouts, all other errors are fatal.
    pub fn is_timeout(&self) -> bool {
        self.code == ErrorCode::Timeout
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code: {}, message: {}", self.code, self.message)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Self::timeout(format!("I/O error: {err}"))
            }
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::UnexpectedEof => Self::closed(format!("I/O error: {err}")),
            _ => Self::failure(format!("I/O error: {err}")),
        }
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(err: std::str::Utf8Error) -> Self {
        Self::decode(format!("Utf8 error: {err}"))
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::Io(std::io::ErrorKind::TimedOut) => {
                Self::timeout(format!("serial port error: {err}"))
            }
            serialport::ErrorKind::NoDevice => Self::no_device(format!("serial port error: {err}")),
            _ => Self::failure(format!("serial port error: {err}")),
        }
    }
}

impl<T> From<std::sync::mpsc::SendError<T>> for Error {
    fn from(err: std::sync::mpsc::SendError<T>) -> Self {
        Self::failure(format!("failed to send an item to the queue: {err}"))
    }
}

/// Error codes for failed instrument operations
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    /// Generic failure code
    Failure = -1,
    /// I/O deadline exceeded
    Timeout = -2,
    /// Non-ASCII byte, `?` sentinel, or token count mismatch
    Decode = -3,
    /// Discovery returned nothing, or an unrecognized model
    NoDevice = -4,
    /// Command requires a newer firmware version
    Version = -5,
    /// Statistics table lookup miss
    UnknownStat = -6,
    /// Engineering-unit table lookup miss
    UnknownUnit = -7,
    /// Gas table lookup miss
    UnknownGas = -8,
    /// Too many statistics for one averaged request
    TooManyStats = -9,
    /// Out-of-range slot, bad mode, bad mix percentage sum
    InvalidArgument = -10,
    /// Operation on a closed handle
    TransportClosed = -11,
}

impl From<ErrorCode> for &'static str {
    fn from(e: ErrorCode) -> Self {
        match e {
            ErrorCode::Failure => "failure",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Decode => "decode",
            ErrorCode::NoDevice => "no device",
            ErrorCode::Version => "version",
            ErrorCode::UnknownStat => "unknown statistic",
            ErrorCode::UnknownUnit => "unknown unit",
            ErrorCode::UnknownGas => "unknown gas",
            ErrorCode::TooManyStats => "too many statistics",
            ErrorCode::InvalidArgument => "invalid argument",
            ErrorCode::TransportClosed => "transport closed",
        }
    }
}

impl From<&ErrorCode> for &'static str {
    fn from(e: &ErrorCode) -> Self {
        (*e).into()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", <&'static str>::from(self))
    }
}
