use core::fmt;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A candidate endpoint and whatever identifying metadata the OS reports.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub path: String,
    pub driver: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vid: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u16>,
}

impl PortInfo {
    pub fn new(path: impl Into<String>, driver: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            driver: driver.into(),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called.
    Requested,
    /// A new `connect()` closed this link first.
    Replaced,
    /// The port reported an error.
    Fault(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Requested => write!(f, "requested"),
            DisconnectReason::Replaced => write!(f, "replaced"),
            DisconnectReason::Fault(e) => write!(f, "fault: {e}"),
        }
    }
}

/// Everything the transport reports to its consumer, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    Connected { path: String },
    Disconnected { path: String, reason: DisconnectReason },
    /// One complete line with the terminator stripped.
    Line(String),
    Error(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub path: Option<String>,
    pub baud_rate: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub baud_rate: u32,
    pub connect_timeout_ms: u64,
    pub send_timeout_ms: u64,
    /// Port read timeout; also bounds how long a disconnect waits for the reader.
    pub read_timeout_ms: u64,
    pub max_line_bytes: usize,
    /// JSON file recording the active port; in-memory when absent.
    pub registry_path: Option<PathBuf>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            connect_timeout_ms: 3_000,
            send_timeout_ms: 1_000,
            read_timeout_ms: 100,
            max_line_bytes: 16 * 1024,
            registry_path: None,
        }
    }
}
