use crate::{LinkDriver, LinkPort, PortInfo, Result, TransportError};
use serialport::{SerialPort, SerialPortType};
use std::io::{self, Read, Write};
use std::time::Duration;

/// USB/serial backend built on `serialport`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialDriver;

impl SerialDriver {
    pub fn new() -> Self {
        Self
    }
}

fn map_serial_err(path: &str, e: serialport::Error) -> TransportError {
    match e.kind() {
        serialport::ErrorKind::NoDevice => TransportError::PortNotFound(path.to_string()),
        serialport::ErrorKind::Io(io::ErrorKind::TimedOut) => TransportError::Timeout,
        _ => TransportError::Io(e.to_string()),
    }
}

fn map_io_err(e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportError::Timeout,
        _ => TransportError::Io(e.to_string()),
    }
}

impl LinkDriver for SerialDriver {
    fn name(&self) -> &str {
        "serial"
    }

    fn list(&self) -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(ports
            .into_iter()
            .map(|p| {
                let mut info = PortInfo::new(p.port_name, "serial");
                if let SerialPortType::UsbPort(usb) = p.port_type {
                    info.vid = Some(usb.vid);
                    info.pid = Some(usb.pid);
                    info.manufacturer = usb.manufacturer;
                    info.product = usb.product;
                    info.serial_number = usb.serial_number;
                }
                info
            })
            .collect())
    }

    fn open(&self, path: &str, baud_rate: u32, read_timeout: Duration) -> Result<Box<dyn LinkPort>> {
        let port = serialport::new(path, baud_rate)
            .timeout(read_timeout)
            .open()
            .map_err(|e| map_serial_err(path, e))?;
        Ok(Box::new(SerialLink {
            path: path.to_string(),
            port,
        }))
    }
}

struct SerialLink {
    path: String,
    port: Box<dyn SerialPort>,
}

impl LinkPort for SerialLink {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.port.read(buf).map_err(map_io_err)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data).map_err(map_io_err)?;
        self.port.flush().map_err(map_io_err)
    }

    fn try_clone(&self) -> Result<Box<dyn LinkPort>> {
        let port = self
            .port
            .try_clone()
            .map_err(|e| map_serial_err(&self.path, e))?;
        Ok(Box::new(SerialLink {
            path: self.path.clone(),
            port,
        }))
    }
}
