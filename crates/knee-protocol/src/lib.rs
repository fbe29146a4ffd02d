//! knee-protocol: newline-delimited tagged text spoken between the knee sensor and its host
//!
//! Each line carries one message: telemetry as `KNEE_DATA:<json>`, lifecycle
//! notices as bare tags, and host commands in the opposite direction. The
//! tagged-variant types here are the only place the literal tags exist.

pub mod tags;

mod types;
pub use types::{Command, DeviceMessage, DeviceStatus, TelemetryFrame};

mod error;
pub use error::{ProtocolError, Result};

mod encode;

mod decode;
pub use decode::{decode_telemetry, parse_line};
