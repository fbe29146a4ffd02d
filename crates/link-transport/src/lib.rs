//! link-transport: line-oriented serial link to the knee sensor
//!
//! Backends implement [`LinkDriver`]/[`LinkPort`]; [`LinkTransport`] owns the
//! connection lifecycle on top of them and reports connects, disconnects,
//! complete lines and errors on one ordered event channel.
//! - `mock` feature (default): in-process simulated device.
//! - `serial` feature: USB/serial ports via `serialport`.

mod error;
pub use error::{Result, TransportError};

mod types;
pub use types::{ConnectionStatus, DisconnectReason, LinkConfig, LinkEvent, PortInfo};

mod traits;
pub use traits::{LinkDriver, LinkPort};

mod lines;
pub use lines::LineAssembler;

mod registry;
pub use registry::{FilePortRegistry, MemoryPortRegistry, PortRecord, PortRegistry};

mod transport;
pub use transport::LinkTransport;

#[cfg(feature = "mock")]
mod mock;
#[cfg(feature = "mock")]
pub use mock::MockDriver;

#[cfg(feature = "serial")]
mod serial;
#[cfg(feature = "serial")]
pub use serial::SerialDriver;
