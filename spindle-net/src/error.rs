use std::io;

use spindle_core::RemoteError;
use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

/// Enumeration of errors that may occur during network operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("peer disconnected")]
    Disconnected,
    #[error("timed out")]
    TimedOut,
    #[error("connection to {addr} failed after {trials} trial(s): {last}")]
    ConnectionFailed {
        addr: String,
        trials: u32,
        last: String,
    },

    /// Error raised on the remote end of a call. Displays exactly as the
    /// original message.
    #[error("{0}")]
    Remote(RemoteError),
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    #[error("unknown handler class: {0}")]
    UnknownHandlerClass(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("server is shutting down")]
    ShuttingDown,

    #[error("worker lost: {0}")]
    WorkerLost(String),
    #[error("not enough idle workers: requested {requested}, available {available}")]
    PoolExhausted { requested: usize, available: usize },

    #[error("io error: {0}")]
    IoError(io::Error),
    #[error("failed parsing int: {0}")]
    IntParseError(#[from] std::num::ParseIntError),
    #[error("failed parsing address: {0}")]
    AddrParseError(#[from] std::net::AddrParseError),

    #[error("bincode error: {0}")]
    BincodeError(#[from] bincode::Error),

    #[cfg(feature = "msgpack_encoding")]
    #[error("rmp_serde decode error: {0}")]
    RmpsDecodeError(#[from] rmp_serde::decode::Error),
    #[cfg(feature = "msgpack_encoding")]
    #[error("rmp_serde encode error: {0}")]
    RmpsEncodeError(#[from] rmp_serde::encode::Error),

    #[cfg(feature = "json_encoding")]
    #[error("serde_json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("core error: {0}")]
    CoreError(#[from] spindle_core::Error),

    #[error("other: {0}")]
    Other(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Error::Disconnected,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::TimedOut,
            _ => Error::IoError(e),
        }
    }
}

impl From<RemoteError> for Error {
    fn from(e: RemoteError) -> Self {
        Error::Remote(e)
    }
}

impl Error {
    /// Connection-level errors that are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Disconnected | Error::TimedOut | Error::IoError(_) => true,
            _ => false,
        }
    }

    /// Converts into a remote error to be sent back to a caller.
    pub fn to_remote(&self, context: &str) -> RemoteError {
        match self {
            Error::Remote(e) => e.clone(),
            _ => RemoteError::capture(self, context),
        }
    }
}
