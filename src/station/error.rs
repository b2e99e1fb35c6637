//! Error types for the command-station client
//!
//! Line-level failures (`FormatError`, `FramingError`) are recovered at the
//! line boundary and only taint the message being assembled. Request-level
//! failures are `Clone` because one outcome fans out to every caller sharing a
//! deduplicated request.

use std::io;
use std::sync::Arc;
use thiserror::Error;

use super::value::ObjectId;

/// Malformed value or option syntax.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (at {position} in `{line}`)")]
pub struct FormatError {
    /// Description of the problem
    pub message: String,
    /// The offending line
    pub line: String,
    /// Byte offset where parsing stopped
    pub position: usize,
}

impl FormatError {
    /// Create a format error for `line` at `position`.
    pub fn new(message: impl Into<String>, line: impl Into<String>, position: usize) -> Self {
        Self {
            message: message.into(),
            line: line.into(),
            position,
        }
    }
}

/// Malformed header or terminator structure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (in `{line}`)")]
pub struct FramingError {
    /// Description of the problem
    pub message: String,
    /// The offending line
    pub line: String,
}

impl FramingError {
    /// Create a framing error for `line`.
    pub fn new(message: impl Into<String>, line: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: line.into(),
        }
    }
}

/// A line that could not be taken apart.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Value/option syntax error
    #[error("format error: {0}")]
    Format(#[from] FormatError),

    /// Header/terminator structure error
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),
}

/// An option value that cannot be written to the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid option argument: {0}")]
pub struct ArgumentError(pub String);

/// Failure of a single request sent to the command station.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    /// No active connection, or the connection was torn down while pending
    #[error("no connection to the command station")]
    Connectivity,

    /// No reply arrived within the request deadline
    #[error("no reply for `{command}` within the request timeout")]
    Timeout {
        /// Serialized command text
        command: String,
    },

    /// The device answered with a non-zero return code
    #[error("command station returned {code}: {message}")]
    Protocol {
        /// Device return code
        code: i32,
        /// Device message
        message: String,
    },

    /// Socket-level failure while sending
    #[error("transport error: {0}")]
    Transport(Arc<io::Error>),

    /// The reply block could not be parsed
    #[error("malformed reply: {0}")]
    Parse(#[from] ParseError),

    /// The command could not be serialized
    #[error(transparent)]
    Argument(#[from] ArgumentError),
}

impl RequestError {
    /// Device return code, if this is a protocol error.
    pub fn code(&self) -> Option<i32> {
        match self {
            RequestError::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<io::Error> for RequestError {
    fn from(err: io::Error) -> Self {
        RequestError::Transport(Arc::new(err))
    }
}

/// Top-level error for lifecycle calls and out-of-band notifications.
#[derive(Debug, Error)]
pub enum StationError {
    /// Socket-level failure (connect, read)
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// A request failed
    #[error("request failed: {0}")]
    Request(#[from] RequestError),

    /// An inbound message could not be parsed
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// A remote `request`/`release` for a subscription failed
    #[error("subscription change for object {id} failed: {source}")]
    Subscription {
        /// Object id
        id: ObjectId,
        /// Underlying request failure
        source: RequestError,
    },

    /// An event consumer rejected an event
    #[error("event consumer for object {id} failed: {message}")]
    Consumer {
        /// Object id the event was addressed to
        id: ObjectId,
        /// Consumer failure description
        message: String,
    },

    /// The device answered without the expected result rows
    #[error("reply to `{0}` carried no result")]
    EmptyReply(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),
}

/// Convenience result alias for codec operations
pub type CodecResult<T> = std::result::Result<T, FormatError>;

/// Convenience result alias for requests
pub type RequestResult<T> = std::result::Result<T, RequestError>;

/// Result type using StationError
pub type Result<T> = std::result::Result<T, StationError>;
