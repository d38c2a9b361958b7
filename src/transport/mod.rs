//! Abstract link transport interface.
use anyhow::Result;

pub use self::emulated::EmulatedTransport;
pub use self::serial::SerialTransport;

pub mod emulated;
pub mod serial;

/// Raw byte channel to the programmer board.
/// Might be a UART, a USB-CDC port, or an in-process emulation.
pub trait Transport {
    /// Hand a complete frame to the channel.
    fn send_raw(&mut self, raw: &[u8]) -> Result<()>;

    /// Copy the bytes that have arrived so far into `buf`.
    /// Returns 0 when nothing arrived within the transport's poll interval.
    fn recv_raw(&mut self, buf: &mut [u8]) -> Result<usize>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        (**self).send_raw(raw)
    }

    fn recv_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).recv_raw(buf)
    }
}
