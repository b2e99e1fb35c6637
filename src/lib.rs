//! ecoslink – client for ECoS model-railway command stations
//!
//! The command station speaks a line-oriented text protocol over TCP:
//! - Commands of the form `name(id,option,...)` answered by `<REPLY ...>` blocks
//! - Spontaneous `<EVENT id>` blocks for objects a client has requested a view on
//! - `<END code (message)>` terminators carrying the device return code
//!
//! [`Station`] owns the connection and exposes connect/close, request/reply,
//! per-object event subscriptions and a notification channel.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Protocol engine: codec, framing, correlation, events and connection control
pub mod station;

// Re-export key types for convenience
pub use station::{
    ConnectionState, DEFAULT_PORT, DeviceInfo, EngineObject, EventSink, Notification,
    NotificationKind, ObjectId, ObjectOption, OptionResult, RequestError, SinkHandle, Station,
    StationConfig, StationError, Value,
};

/// Current version of the ecoslink crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
