//! McLean Extreme backend: a checksummed binary packet protocol over BLE
//! serial.
//!
//! Every packet is `0x7E 0x00 | u32le(payload_len) | cmd | payload |
//! u16be(CRC-16/XMODEM over header+payload) | 0x00 0x00`.  The device is
//! slow to wake: the first command can take 6–8 s to answer, which is
//! handled by a bounded retry loop with growing inter-attempt delays rather
//! than a long transport timeout.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::bytes;
use crate::device::{Cancel, Device, DeviceBase, DiveCallback};
use crate::event::{Event, EventSink};
use crate::transport::Transport;
use crate::{DivestreamError, Result};

/// Fingerprint width: the dive's timestamp word.
pub const FINGERPRINT_LEN: usize = 4;

const PACKET_START: u8 = 0x7E;
const CMD_COMPUTER: u8 = 0xA0;
const CMD_DIVE: u8 = 0xA3;
const CMD_SET_TIME: u8 = 0xAC;
const CMD_NAK: u8 = 0xEE;

const HEADER_LEN: usize = 7;
const MAX_PAYLOAD: usize = 64 * 1024;
const MAX_ATTEMPTS: u32 = 8;
const DEFAULT_CHUNK: usize = 1000;

/// The fixed layout of the CMD_COMPUTER reply.
const COMPUTER_BLOCK_LEN: usize = 16;

fn frame(cmd: u8, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![PACKET_START, 0x00];
    packet.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    packet.push(cmd);
    packet.extend_from_slice(payload);
    let crc = bytes::crc16_xmodem(&packet, 0);
    packet.extend_from_slice(&crc.to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x00]);
    packet
}

pub struct McleanDevice<T: Transport> {
    base: DeviceBase,
    transport: T,
    chunk_size: usize,
    ndives: u16,
}

impl<T: Transport> McleanDevice<T> {
    pub fn open(transport: T, sink: Option<EventSink>) -> Result<Self> {
        Self::open_with_chunk_size(transport, sink, DEFAULT_CHUNK)
    }

    /// Open with a custom read chunk size, for transports whose MTU makes
    /// the default 1000-byte reads misbehave.
    pub fn open_with_chunk_size(
        mut transport: T,
        sink: Option<EventSink>,
        chunk_size: usize,
    ) -> Result<Self> {
        transport.set_timeout(Duration::from_millis(1000))?;
        let mut device = McleanDevice {
            base: DeviceBase::new(FINGERPRINT_LEN, sink),
            transport,
            chunk_size: chunk_size.max(1),
            ndives: 0,
        };

        let block = device.transfer(CMD_COMPUTER, &[])?;
        if block.len() < COMPUTER_BLOCK_LEN {
            return Err(DivestreamError::protocol(format!(
                "computer block too short: {} bytes",
                block.len()
            )));
        }
        let model = bytes::u16_le(&block[0..2]);
        let firmware = bytes::u32_le(&block[2..6]);
        let serial = bytes::u32_le(&block[6..10]);
        let devtime = bytes::u32_le(&block[10..14]);
        device.ndives = bytes::u16_le(&block[14..16]);

        device.base.emit(&Event::Devinfo {
            model: model as u32,
            firmware,
            serial,
        });
        device.base.emit(&Event::Clock {
            systime: Utc::now(),
            devtime,
        });
        // Surface the raw block for diagnostics; it carries more than the
        // fields decoded above.
        device.base.emit(&Event::Vendor(&block));
        Ok(device)
    }

    /// Send a command and receive its reply, absorbing timeouts while the
    /// device wakes up.
    fn transfer(&mut self, cmd: u8, payload: &[u8]) -> Result<Vec<u8>> {
        let packet = frame(cmd, payload);
        self.transport.write_all(&packet)?;
        self.transport.flush()?;

        let mut attempt = 0u32;
        loop {
            self.base.check_cancelled()?;
            match self.receive() {
                Ok((reply_cmd, reply)) => {
                    if reply_cmd == CMD_NAK {
                        return Err(DivestreamError::Nack);
                    }
                    if reply_cmd != cmd {
                        return Err(DivestreamError::protocol(format!(
                            "unexpected reply opcode {reply_cmd:#04x} to {cmd:#04x}"
                        )));
                    }
                    return Ok(reply);
                }
                Err(DivestreamError::Timeout) if attempt < MAX_ATTEMPTS => {
                    attempt += 1;
                    debug!("no reply yet, retry {attempt}/{MAX_ATTEMPTS}");
                    self.transport
                        .sleep(Duration::from_millis(100 * attempt as u64));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn receive(&mut self) -> Result<(u8, Vec<u8>)> {
        let mut header = [0u8; HEADER_LEN];
        self.read_exact_chunked(&mut header)?;
        if header[0] != PACKET_START || header[1] != 0x00 {
            return Err(DivestreamError::protocol("bad packet preamble"));
        }
        let size = bytes::u32_le(&header[2..6]) as usize;
        if size > MAX_PAYLOAD {
            return Err(DivestreamError::protocol("oversized packet payload"));
        }
        let cmd = header[6];

        let mut rest = vec![0u8; size + 4];
        self.read_exact_chunked(&mut rest)?;
        let stored = bytes::u16_be(&rest[size..size + 2]);
        if rest[size + 2] != 0x00 || rest[size + 3] != 0x00 {
            return Err(DivestreamError::protocol("bad packet trailer"));
        }
        let computed = {
            let crc = bytes::crc16_xmodem(&header, 0);
            bytes::crc16_xmodem(&rest[..size], crc)
        };
        if computed != stored {
            return Err(DivestreamError::protocol(format!(
                "packet CRC mismatch: stored {stored:#06x}, computed {computed:#06x}"
            )));
        }
        rest.truncate(size);
        Ok((cmd, rest))
    }

    /// Fill `buf`, never asking the transport for more than the configured
    /// chunk size at once.
    fn read_exact_chunked(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let limit = (filled + self.chunk_size).min(buf.len());
            match self.transport.read(&mut buf[filled..limit])? {
                0 => return Err(DivestreamError::io("transport closed during read")),
                n => filled += n,
            }
        }
        Ok(())
    }

    fn read_dive(&mut self, index: u16) -> Result<Vec<u8>> {
        self.transfer(CMD_DIVE, &index.to_le_bytes())
    }
}

impl<T: Transport> Device for McleanDevice<T> {
    fn set_fingerprint(&mut self, fingerprint: &[u8]) -> Result<()> {
        self.base.set_fingerprint(fingerprint)
    }

    fn dump(&mut self, out: &mut Vec<u8>) -> Result<()> {
        self.base.ensure_open()?;
        let maximum = self.ndives as u32;
        self.base.emit_progress(0, maximum);
        for index in 0..self.ndives {
            self.base.check_cancelled()?;
            let dive = self.read_dive(index)?;
            out.extend_from_slice(&dive);
            self.base.emit_progress(index as u32 + 1, maximum);
        }
        Ok(())
    }

    fn foreach(&mut self, callback: DiveCallback<'_>) -> Result<()> {
        self.base.ensure_open()?;
        let maximum = self.ndives as u32;
        self.base.emit_progress(0, maximum);

        // Slot 0 holds the oldest dive; walk backwards for newest-first.
        let mut current = 0u32;
        for index in (0..self.ndives).rev() {
            self.base.check_cancelled()?;
            let dive = self.read_dive(index)?;
            if dive.len() < FINGERPRINT_LEN {
                return Err(DivestreamError::data("dive record too short"));
            }
            let fingerprint = dive[..FINGERPRINT_LEN].to_vec();
            if self.base.fingerprint_matches(&fingerprint) {
                debug!("fingerprint match at dive slot {index}; stopping");
                break;
            }

            current += 1;
            let keep_going = callback(&dive, &fingerprint);
            self.base.emit_progress(current, maximum);
            if !keep_going {
                break;
            }
        }
        Ok(())
    }

    fn timesync(&mut self, time: DateTime<Utc>) -> Result<()> {
        self.base.ensure_open()?;
        let epoch = u32::try_from(time.timestamp())
            .map_err(|_| DivestreamError::InvalidArgs("time out of device range"))?;
        self.transfer(CMD_SET_TIME, &epoch.to_le_bytes())?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.base.close()?;
        self.transport.close()
    }

    fn cancel_handle(&self) -> Cancel {
        self.base.cancel_handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testonly::ScriptedTransport;

    fn computer_block(ndives: u16) -> Vec<u8> {
        let mut block = Vec::new();
        block.extend_from_slice(&2u16.to_le_bytes()); // model
        block.extend_from_slice(&0x0001_0203u32.to_le_bytes()); // firmware
        block.extend_from_slice(&0x00C0FFEEu32.to_le_bytes()); // serial
        block.extend_from_slice(&1_600_000_000u32.to_le_bytes()); // clock
        block.extend_from_slice(&ndives.to_le_bytes());
        block
    }

    fn dive_record(stamp: u32, body: &[u8]) -> Vec<u8> {
        let mut record = stamp.to_le_bytes().to_vec();
        record.extend_from_slice(body);
        record
    }

    #[test]
    fn computer_command_wire_format() {
        let packet = frame(CMD_COMPUTER, &[]);
        // 7E 00 | size 0 | A0 | crc hi/lo | 00 00
        assert_eq!(&packet[..7], &[0x7E, 0x00, 0x00, 0x00, 0x00, 0x00, 0xA0]);
        let crc = bytes::crc16_xmodem(&packet[..7], 0);
        assert_eq!(packet[7], (crc >> 8) as u8);
        assert_eq!(packet[8], (crc & 0xFF) as u8);
        assert_eq!(&packet[9..], &[0x00, 0x00]);
        assert_eq!(packet.len(), 11);
    }

    #[test]
    fn open_parses_the_computer_block() {
        let mut transport = ScriptedTransport::new();
        transport.push_read(frame(CMD_COMPUTER, &computer_block(3)));
        let device = McleanDevice::open(transport, None).unwrap();
        assert_eq!(device.ndives, 3);
        assert_eq!(&device.transport.written()[..], &frame(CMD_COMPUTER, &[])[..]);
    }

    #[test]
    fn corrupted_reply_crc_is_protocol_error() {
        let mut transport = ScriptedTransport::new();
        let mut reply = frame(CMD_COMPUTER, &computer_block(0));
        let crc_at = reply.len() - 4;
        reply[crc_at] ^= 0xFF;
        transport.push_read(reply);
        let result = McleanDevice::open(transport, None);
        assert!(matches!(result, Err(DivestreamError::Protocol(_))));
    }

    #[test]
    fn foreach_walks_newest_first_and_respects_anchor() {
        let mut transport = ScriptedTransport::new();
        transport.push_read(frame(CMD_COMPUTER, &computer_block(2)));
        // Requested in reverse slot order: newest (slot 1) first.
        transport.push_read(frame(CMD_DIVE, &dive_record(2_000, b"newest")));
        transport.push_read(frame(CMD_DIVE, &dive_record(1_000, b"oldest")));
        let mut device = McleanDevice::open(transport, None).unwrap();

        let mut stamps = Vec::new();
        device
            .foreach(&mut |dive, fingerprint| {
                assert_eq!(&dive[..4], fingerprint);
                stamps.push(bytes::u32_le(fingerprint));
                true
            })
            .unwrap();
        assert_eq!(stamps, vec![2_000, 1_000]);

        // Anchored on the newest dive, nothing is delivered.
        let mut transport = ScriptedTransport::new();
        transport.push_read(frame(CMD_COMPUTER, &computer_block(2)));
        transport.push_read(frame(CMD_DIVE, &dive_record(2_000, b"newest")));
        let mut device = McleanDevice::open(transport, None).unwrap();
        device.set_fingerprint(&2_000u32.to_le_bytes()).unwrap();
        let mut count = 0;
        device.foreach(&mut |_, _| {
            count += 1;
            true
        })
        .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn events_flow_through_the_sink() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let events: Rc<RefCell<Vec<String>>> = Rc::default();
        let seen = events.clone();
        let sink: EventSink = Box::new(move |event| {
            seen.borrow_mut().push(match event {
                Event::Progress { current, maximum } => format!("progress {current}/{maximum}"),
                Event::Devinfo { serial, .. } => format!("devinfo {serial:#010x}"),
                Event::Clock { devtime, .. } => format!("clock {devtime}"),
                Event::Vendor(payload) => format!("vendor {} bytes", payload.len()),
            });
        });

        let mut transport = ScriptedTransport::new();
        transport.push_read(frame(CMD_COMPUTER, &computer_block(1)));
        transport.push_read(frame(CMD_DIVE, &dive_record(1_000, b"only")));
        let mut device = McleanDevice::open(transport, Some(sink)).unwrap();
        device.foreach(&mut |_, _| true).unwrap();

        assert_eq!(
            events.borrow().as_slice(),
            &[
                "devinfo 0x00c0ffee".to_owned(),
                "clock 1600000000".to_owned(),
                "vendor 16 bytes".to_owned(),
                "progress 0/1".to_owned(),
                "progress 1/1".to_owned(),
            ]
        );
    }

    #[test]
    fn nak_reply_surfaces_as_nack() {
        let mut transport = ScriptedTransport::new();
        transport.push_read(frame(CMD_COMPUTER, &computer_block(1)));
        transport.push_read(frame(CMD_NAK, &[]));
        let mut device = McleanDevice::open(transport, None).unwrap();
        let result = device.foreach(&mut |_, _| true);
        assert!(matches!(result, Err(DivestreamError::Nack)));
    }

    #[test]
    fn timesync_sends_the_epoch() {
        let mut transport = ScriptedTransport::new();
        transport.push_read(frame(CMD_COMPUTER, &computer_block(0)));
        transport.push_read(frame(CMD_SET_TIME, &[]));
        let mut device = McleanDevice::open(transport, None).unwrap();
        device.transport.clear_written();

        let time = DateTime::<Utc>::from_timestamp(1_600_000_000, 0).unwrap();
        device.timesync(time).unwrap();
        assert_eq!(
            device.transport.written(),
            &frame(CMD_SET_TIME, &1_600_000_000u32.to_le_bytes())[..]
        );
    }
}
