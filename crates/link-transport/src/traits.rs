use crate::{PortInfo, Result};
use std::time::Duration;

/// An open byte stream to one device. Blocking, driven from a dedicated thread.
pub trait LinkPort: Send {
    /// Read whatever bytes are available. Returns `Err(Timeout)` when nothing
    /// arrived within the port's read timeout.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write and flush the whole buffer.
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// A second handle onto the same stream, for a separate reader.
    fn try_clone(&self) -> Result<Box<dyn LinkPort>>;
}

/// A backend able to enumerate and open ports.
pub trait LinkDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Attempt to list candidate ports for this backend.
    fn list(&self) -> Result<Vec<PortInfo>>;

    /// Open a port by path. Returns only once the port is usable.
    fn open(&self, path: &str, baud_rate: u32, read_timeout: Duration) -> Result<Box<dyn LinkPort>>;
}
