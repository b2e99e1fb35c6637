//! Command-station protocol engine
//!
//! Leaves first: the value codec and data model, line splitting and message
//! assembly, request/reply correlation, event routing, and the connection
//! controller that ties them to a TCP socket.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

pub mod assembler;
pub mod codec;
pub mod controller;
pub mod correlator;
pub mod error;
pub mod notify;
pub mod registry;
pub mod splitter;
pub mod value;

pub use controller::Station;
pub use error::{ArgumentError, FormatError, FramingError, ParseError, RequestError, StationError};
pub use notify::{Notification, NotificationKind};
pub use registry::{EventSink, SinkHandle};
pub use value::{ObjectId, ObjectOption, OptionResult, Value};

/// Default TCP port of the command station.
pub const DEFAULT_PORT: u16 = 15471;

/// Object id of the station itself.
pub const STATION_ID: ObjectId = 1;

/// Object id of the engine (locomotive) manager.
pub const ROSTER_ID: ObjectId = 10;

/// Configuration for a [`Station`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    /// Port used when `connect` is given none (default: 15471)
    pub port: u16,

    /// Per-request reply deadline in milliseconds
    pub request_timeout_ms: u64,

    /// Socket read buffer size in bytes
    pub read_buffer: usize,

    /// Trace every wire line at `trace` level
    pub echo_lines: bool,

    /// Undelivered notifications kept per listener
    pub notify_capacity: usize,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            request_timeout_ms: 5_000,
            read_buffer: 1024,
            echo_lines: false,
            notify_capacity: 64,
        }
    }
}

impl StationConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn load(path: impl AsRef<Path>) -> error::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|err| StationError::Config(format!("{}: {err}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|err| StationError::Config(format!("{}: {err}", path.display())))?;
        if config.read_buffer == 0 {
            return Err(StationError::Config(format!(
                "{}: read_buffer must be positive",
                path.display()
            )));
        }
        Ok(config)
    }

    /// Reply deadline as a duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Session state of the connection controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected yet, or the device reported an unknown status
    Idle,
    /// Socket is being opened
    Connecting,
    /// Connected, track power on (`GO`)
    RunningActive,
    /// Connected, track power off (`STOP`)
    RunningHalted,
    /// Connection closed or device shut down
    Closed,
}

impl ConnectionState {
    /// Map a device status word; unknown words map to `Idle`.
    pub fn parse(status: &str) -> Self {
        if status.eq_ignore_ascii_case("GO") {
            ConnectionState::RunningActive
        } else if status.eq_ignore_ascii_case("STOP") {
            ConnectionState::RunningHalted
        } else if status.eq_ignore_ascii_case("SHUTDOWN") {
            ConnectionState::Closed
        } else {
            ConnectionState::Idle
        }
    }

    /// Status word as the device spells it.
    pub fn as_wire(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "IDLE",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::RunningActive => "GO",
            ConnectionState::RunningHalted => "STOP",
            ConnectionState::Closed => "SHUTDOWN",
        }
    }

    /// True in either running state.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            ConnectionState::RunningActive | ConnectionState::RunningHalted
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Identification read from `get(1,info,...)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Station name; the first option without values
    pub name: String,
    /// `ProtocolVersion`
    pub protocol_version: String,
    /// `ApplicationVersion`
    pub application_version: String,
    /// `HardwareVersion`
    pub hardware_version: String,
}

impl DeviceInfo {
    /// Collect identification from the rows of the station object.
    pub fn from_results(results: &[OptionResult]) -> Self {
        let mut info = DeviceInfo::default();
        let options = results
            .iter()
            .filter(|result| result.id == STATION_ID)
            .flat_map(|result| result.options.iter());

        for option in options {
            if option.values.is_empty() {
                if info.name.is_empty() {
                    info.name = option.name.clone();
                }
                continue;
            }
            let slot = if option.is("ProtocolVersion") {
                &mut info.protocol_version
            } else if option.is("ApplicationVersion") {
                &mut info.application_version
            } else if option.is("HardwareVersion") {
                &mut info.hardware_version
            } else {
                continue;
            };
            *slot = plain_text(&option.values[0]);
        }
        info
    }
}

/// An engine known to the station.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineObject {
    /// Object id
    pub id: ObjectId,
    /// Display name (`E<id>` when the station has none)
    pub name: String,
    /// Decoder address (-1 when unknown)
    pub address: i32,
}

impl EngineObject {
    /// Build a roster entry from one `queryObjects` row.
    pub fn from_result(result: &OptionResult) -> Self {
        let name = result
            .option("name")
            .and_then(|option| option.value(0))
            .map(plain_text)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("E{}", result.id));
        let address = result.int_of("addr").unwrap_or(-1);
        Self {
            id: result.id,
            name,
            address,
        }
    }
}

fn plain_text(value: &Value) -> String {
    match value {
        Value::Int(number) => number.to_string(),
        Value::Symbol(text) | Value::Text(text) => text.clone(),
    }
}
