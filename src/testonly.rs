//! Test support: a scripted transport double.
//!
//! Public so that downstream consumers can exercise their own device
//! plumbing against the backends without hardware on the bench.

use std::collections::VecDeque;
use std::time::Duration;

use crate::transport::{LineSettings, PacketTransport, PurgeDirection, Transport};
use crate::{DivestreamError, Result};

/// A [`Transport`] that replays queued inbound chunks and records writes.
///
/// Each queued chunk is drained across as many `read` calls as needed;
/// reading past the script yields [`DivestreamError::Timeout`], matching a
/// silent device.
#[derive(Default)]
pub struct ScriptedTransport {
    reads: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    packet_size: usize,
    pub timeout: Duration,
    pub closed: bool,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        ScriptedTransport {
            packet_size: 64,
            ..ScriptedTransport::default()
        }
    }

    /// Queue one inbound chunk.
    pub fn push_read(&mut self, data: impl AsRef<[u8]>) {
        self.reads.push_back(data.as_ref().to_vec());
    }

    /// Everything written so far, in order.
    pub fn written(&self) -> &[u8] {
        &self.written
    }

    /// Drop the write record (useful between protocol phases).
    pub fn clear_written(&mut self) {
        self.written.clear();
    }

    /// True when the script has been fully consumed.
    pub fn exhausted(&self) -> bool {
        self.reads.is_empty()
    }
}

impl Transport for ScriptedTransport {
    fn configure(&mut self, _settings: &LineSettings) -> Result<()> {
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let chunk = match self.reads.front_mut() {
            Some(chunk) => chunk,
            None => return Err(DivestreamError::Timeout),
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        chunk.drain(..n);
        if chunk.is_empty() {
            self.reads.pop_front();
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn purge(&mut self, direction: PurgeDirection) -> Result<()> {
        if direction != PurgeDirection::Output {
            self.reads.clear();
        }
        Ok(())
    }

    fn sleep(&mut self, _duration: Duration) {}

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

impl PacketTransport for ScriptedTransport {
    fn packet_size(&self) -> usize {
        self.packet_size
    }

    fn packet_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        // One queued chunk is one packet.
        let chunk = match self.reads.pop_front() {
            Some(chunk) => chunk,
            None => return Err(DivestreamError::Timeout),
        };
        if chunk.len() > buf.len() {
            return Err(DivestreamError::io("inbound packet larger than buffer"));
        }
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    fn packet_write(&mut self, buf: &[u8]) -> Result<()> {
        self.written.extend_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_drain_chunks_then_time_out() {
        let mut transport = ScriptedTransport::new();
        transport.push_read([1u8, 2, 3]);
        let mut buf = [0u8; 2];
        assert_eq!(transport.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [1, 2]);
        assert_eq!(transport.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], 3);
        assert!(matches!(
            transport.read(&mut buf),
            Err(DivestreamError::Timeout)
        ));
    }

    #[test]
    fn purge_input_discards_script() {
        let mut transport = ScriptedTransport::new();
        transport.push_read([1u8]);
        transport.purge(PurgeDirection::Input).unwrap();
        assert!(transport.exhausted());
    }
}
