//! Synchronous byte-transport capabilities consumed by the device backends.
//!
//! The crate never opens serial ports or BLE connections itself.  A caller
//! hands an already-connected implementation of [`Transport`] (or
//! [`PacketTransport`] for packet-granular links such as BLE GATT) to a
//! backend's `open`, and the backend drives it with blocking reads and
//! writes.  All operations are synchronous; cancellation is only observed
//! between transport calls.

use std::time::Duration;

use crate::{DivestreamError, Result};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StopBits {
    One,
    Two,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FlowControl {
    None,
    Hardware,
    Software,
}

/// Serial line parameters for [`Transport::configure`].
///
/// Transports that have no notion of line settings (HID, BLE) accept and
/// ignore them.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct LineSettings {
    pub baudrate: u32,
    pub databits: u8,
    pub parity: Parity,
    pub stopbits: StopBits,
    pub flow: FlowControl,
}

impl LineSettings {
    /// The ubiquitous 8N1 framing at the given baud rate.
    pub fn eight_n_one(baudrate: u32) -> Self {
        LineSettings {
            baudrate,
            databits: 8,
            parity: Parity::None,
            stopbits: StopBits::One,
            flow: FlowControl::None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PurgeDirection {
    Input,
    Output,
    Both,
}

/// A synchronous byte stream with a per-read timeout.
///
/// `read` returns the number of bytes transferred, which may be short;
/// a read that transfers nothing before the timeout must return
/// [`DivestreamError::Timeout`].
pub trait Transport {
    fn configure(&mut self, settings: &LineSettings) -> Result<()>;
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
    fn flush(&mut self) -> Result<()>;
    fn purge(&mut self, direction: PurgeDirection) -> Result<()>;
    fn sleep(&mut self, duration: Duration);
    fn close(&mut self) -> Result<()>;

    /// Read until `buf` is full.  A zero-length transfer means the peer went
    /// away and surfaces as an I/O error.
    fn read_all(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..])? {
                0 => return Err(DivestreamError::io("transport closed during read")),
                n => filled += n,
            }
        }
        Ok(())
    }

    /// Write the whole buffer.
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let mut sent = 0;
        while sent < buf.len() {
            match self.write(&buf[sent..])? {
                0 => return Err(DivestreamError::io("transport closed during write")),
                n => sent += n,
            }
        }
        Ok(())
    }
}

/// A packet-granular transport, e.g. a BLE GATT characteristic pair.
///
/// `packet_read` always delivers one inbound packet (at most
/// [`packet_size`](PacketTransport::packet_size) bytes); `packet_write`
/// sends one outbound packet.
pub trait PacketTransport: Transport {
    fn packet_size(&self) -> usize;
    fn packet_read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn packet_write(&mut self, buf: &[u8]) -> Result<()>;
}
