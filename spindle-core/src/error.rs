//! Error types.

use std::fmt;
use std::io;
use std::num::ParseIntError;

pub type Result<T> = core::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::IoError(e.to_string())
    }
}

/// Crate-wide error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(String),

    #[error("parsing error: {0}")]
    ParsingError(String),
    #[error("failed parsing int: {0}")]
    ParseIntError(#[from] ParseIntError),

    #[error("invalid value type: expected {expected}, found {found}")]
    InvalidValueType { expected: String, found: String },
    #[error("value list too short: no element at index {0}")]
    MissingElement(usize),

    #[error("invalid resource type: {0}")]
    InvalidResourceType(String),
    #[error("invalid machine address: {0}")]
    InvalidMachine(String),
    #[error("invalid job id: {0}")]
    InvalidJobId(String),

    #[error("invalid topology: {0}")]
    InvalidTopology(String),
    #[error("node has no tube named: {0}")]
    NoTube(String),
    #[error("tube disconnected: {0}")]
    TubeDisconnected(String),

    #[error("registry: no task named: {0}")]
    NoTask(String),
    #[error("registry: no job function named: {0}")]
    NoJob(String),

    #[error("task failed: {0}")]
    TaskFailed(String),
    #[error("job failed: {0}")]
    JobFailed(String),

    #[error("bincode error: {0}")]
    BincodeError(#[from] bincode::Error),

    #[error("other: {0}")]
    Other(String),
}

/// Error raised on a remote machine, carried back to the caller as data.
///
/// `trace` holds a textual description of where the error came from, so that
/// it can be diagnosed without access to the remote logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
    pub trace: String,
}

impl RemoteError {
    pub fn new(message: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: trace.into(),
        }
    }

    /// Captures an error together with its chain of sources.
    pub fn capture(err: &(dyn std::error::Error + 'static), context: &str) -> Self {
        let mut trace = format!("{}: {}", context, err);
        let mut source = err.source();
        while let Some(s) = source {
            trace.push_str(&format!("\n  caused by: {}", s));
            source = s.source();
        }
        Self {
            message: err.to_string(),
            trace,
        }
    }

    /// Builds a remote error out of a caught panic payload.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>, context: &str) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self {
            trace: format!("{}: panicked: {}", context, message),
            message: format!("panicked: {}", message),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RemoteError {}
