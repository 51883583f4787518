use std::error;
use std::fmt;

use crate::frame::Reason;

/// Errors surfaced by the application-facing methods of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The connection was torn down by a protocol violation.
    Protocol(Reason),

    /// The referenced stream does not exist or is already closed.
    InactiveStream,

    /// The connection is shutting down and will not carry new frames.
    Closing,

    /// The API was used out of order.
    User(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Protocol(reason) => write!(fmt, "protocol error: {}", reason),
            Error::InactiveStream => write!(fmt, "stream no longer active"),
            Error::Closing => write!(fmt, "connection is closing"),
            Error::User(desc) => write!(fmt, "user error: {}", desc),
        }
    }
}

impl error::Error for Error {}

impl From<Reason> for Error {
    fn from(src: Reason) -> Error {
        Error::Protocol(src)
    }
}
