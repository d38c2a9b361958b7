//! Serial Transportation.
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use anyhow::Result;
use serialport::SerialPort;

use super::Transport;

/// How long a read waits for the first byte before reporting "nothing yet".
const SERIAL_POLL_MS: u64 = 10;

pub const DEFAULT_BAUDRATE: u32 = 115200;

#[cfg(windows)]
pub const DEFAULT_PORT: &str = "COM1";
#[cfg(not(windows))]
pub const DEFAULT_PORT: &str = "/dev/ttyACM0";

pub struct SerialTransport {
    serial_port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    /// 8N1, no flow control.
    pub fn open(port: &str, baudrate: u32) -> Result<Self> {
        log::info!("Opening serial port: \"{}\" @ {} baud", port, baudrate);
        let port = serialport::new(port, baudrate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(SERIAL_POLL_MS))
            .open()
            .map_err(|e| anyhow::format_err!("Failed to open port {}: {}", port, e))?;
        let mut transport = SerialTransport { serial_port: port };
        transport.discard_input()?;
        Ok(transport)
    }

    /// Drop stale bytes left over from a previous session.
    pub fn discard_input(&mut self) -> Result<()> {
        self.serial_port.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }
}

impl Transport for SerialTransport {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        self.serial_port.write_all(raw)?;
        self.serial_port.flush()?;
        Ok(())
    }

    fn recv_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.serial_port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(0)
            }
            Err(e) => Err(anyhow::format_err!(
                "An I/O error occurred while reading from the port: {}",
                e
            )),
        }
    }
}
