//! Scubapro G2 backend: a request/reply protocol over packet-granular
//! transports (USB-HID reports or BLE GATT).
//!
//! Every outbound packet is `[length, cmd, payload...]`; replies are
//! `[length, data...]`.  Over BLE the device additionally demands a
//! passphrase before answering anything: the six trailing ASCII digits of
//! its advertised name, parsed as a decimal number and sent little-endian.
//! That derivation is exactly what the handshake implements, nothing more.
//!
//! The log memory is one image of variable-length dive records, oldest
//! first: `[u16le record_len][u32le timestamp][profile bytes...]`, with
//! `record_len` counting the whole record and erased flash (`0x0000` or
//! `0xFFFF`) marking the end.  Enumeration reads the image once and walks
//! the records backwards, anchored on the timestamp fingerprint.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::bytes;
use crate::device::{Cancel, Device, DeviceBase, DiveCallback};
use crate::event::{Event, EventSink};
use crate::transport::PacketTransport;
use crate::{DivestreamError, Result};

/// Fingerprint width: the dive's timestamp word.
pub const FINGERPRINT_LEN: usize = 4;

const DIVE_HEADER_LEN: usize = 6;
const END_OF_LOG: [u16; 2] = [0x0000, 0xFFFF];

const CMD_AUTH: u8 = 0x1C;
const CMD_MODEL: u8 = 0x10;
const CMD_SERIAL: u8 = 0x14;
const CMD_FIRMWARE: u8 = 0x20;
const CMD_SETTIME: u8 = 0x31;
const CMD_DUMP_SIZE: u8 = 0xC2;
const CMD_DUMP: u8 = 0xC4;

/// Bytes requested per dump chunk; comfortably inside one HID report.
const DUMP_CHUNK: u32 = 56;

/// Split the log image into per-dive records, oldest first.
fn split_image(image: &[u8]) -> Result<Vec<&[u8]>> {
    let mut dives = Vec::new();
    let mut offset = 0;
    while offset + DIVE_HEADER_LEN <= image.len() {
        let length = bytes::u16_le(&image[offset..offset + 2]);
        if END_OF_LOG.contains(&length) {
            break;
        }
        let length = length as usize;
        if length < DIVE_HEADER_LEN || offset + length > image.len() {
            return Err(DivestreamError::data(format!(
                "dive record of {length} bytes overruns the log image"
            )));
        }
        dives.push(&image[offset..offset + length]);
        offset += length;
    }
    Ok(dives)
}

/// Derive the BLE handshake passphrase from the advertised name: its six
/// trailing ASCII digits as a decimal `u32`.
fn passphrase(advertised_name: &str) -> Result<u32> {
    let digits: Vec<u8> = advertised_name
        .bytes()
        .rev()
        .take_while(u8::is_ascii_digit)
        .collect();
    if digits.len() < 6 {
        return Err(DivestreamError::InvalidArgs(
            "advertised name carries no six-digit suffix",
        ));
    }
    let suffix: String = digits[..6].iter().rev().map(|b| *b as char).collect();
    suffix
        .parse()
        .map_err(|_| DivestreamError::InvalidArgs("unparseable passphrase digits"))
}

pub struct ScubaproG2Device<T: PacketTransport> {
    base: DeviceBase,
    transport: T,
}

impl<T: PacketTransport> ScubaproG2Device<T> {
    /// Open over USB-HID, where no authentication is required.
    pub fn open(transport: T, sink: Option<EventSink>) -> Result<Self> {
        Self::open_inner(transport, sink, None)
    }

    /// Open over BLE, authenticating with the passphrase derived from the
    /// advertised device name.
    pub fn open_ble(
        transport: T,
        sink: Option<EventSink>,
        advertised_name: &str,
    ) -> Result<Self> {
        let secret = passphrase(advertised_name)?;
        Self::open_inner(transport, sink, Some(secret))
    }

    fn open_inner(mut transport: T, sink: Option<EventSink>, secret: Option<u32>) -> Result<Self> {
        transport.set_timeout(Duration::from_millis(1000))?;
        let mut device = ScubaproG2Device {
            base: DeviceBase::new(FINGERPRINT_LEN, sink),
            transport,
        };

        if let Some(secret) = secret {
            let reply = device.command(CMD_AUTH, &secret.to_le_bytes())?;
            if reply.first() != Some(&0x01) {
                return Err(DivestreamError::Nack);
            }
        }

        let model = device.command(CMD_MODEL, &[])?;
        let serial = device.command(CMD_SERIAL, &[])?;
        let firmware = device.command(CMD_FIRMWARE, &[])?;
        if model.is_empty() || serial.len() < 4 || firmware.len() < 4 {
            return Err(DivestreamError::protocol("short identity reply"));
        }
        device.base.emit(&Event::Devinfo {
            model: model[0] as u32,
            firmware: bytes::u32_le(&firmware[..4]),
            serial: bytes::u32_le(&serial[..4]),
        });
        Ok(device)
    }

    fn command(&mut self, cmd: u8, payload: &[u8]) -> Result<Vec<u8>> {
        self.base.check_cancelled()?;
        let mut packet = Vec::with_capacity(payload.len() + 2);
        packet.push((payload.len() + 1) as u8);
        packet.push(cmd);
        packet.extend_from_slice(payload);
        self.transport.packet_write(&packet)?;

        let mut buf = vec![0u8; self.transport.packet_size().max(64)];
        let transferred = self.transport.packet_read(&mut buf)?;
        if transferred == 0 {
            return Err(DivestreamError::io("empty reply packet"));
        }
        let length = buf[0] as usize;
        if length + 1 > transferred {
            return Err(DivestreamError::protocol(
                "reply length exceeds transferred packet",
            ));
        }
        Ok(buf[1..1 + length].to_vec())
    }
}

impl<T: PacketTransport> Device for ScubaproG2Device<T> {
    fn set_fingerprint(&mut self, fingerprint: &[u8]) -> Result<()> {
        self.base.set_fingerprint(fingerprint)
    }

    fn dump(&mut self, out: &mut Vec<u8>) -> Result<()> {
        self.base.ensure_open()?;
        let size_reply = self.command(CMD_DUMP_SIZE, &[])?;
        if size_reply.len() < 4 {
            return Err(DivestreamError::protocol("short dump size reply"));
        }
        let size = bytes::u32_le(&size_reply[..4]);
        self.base.emit_progress(0, size);

        let mut address = 0u32;
        while address < size {
            self.base.check_cancelled()?;
            let length = DUMP_CHUNK.min(size - address);
            let mut request = address.to_le_bytes().to_vec();
            request.extend_from_slice(&length.to_le_bytes());
            let chunk = self.command(CMD_DUMP, &request)?;
            if chunk.is_empty() {
                return Err(DivestreamError::protocol("empty dump chunk"));
            }
            out.extend_from_slice(&chunk);
            address += chunk.len() as u32;
            self.base.emit_progress(address, size);
        }
        Ok(())
    }

    fn foreach(&mut self, callback: DiveCallback<'_>) -> Result<()> {
        self.base.ensure_open()?;
        let mut image = Vec::new();
        self.dump(&mut image)?;
        let dives = split_image(&image)?;
        let maximum = dives.len() as u32;
        self.base.emit_progress(0, maximum);

        // The image stores dives oldest first; the contract is newest first.
        let mut current = 0u32;
        for dive in dives.iter().rev() {
            self.base.check_cancelled()?;
            let fingerprint = &dive[2..2 + FINGERPRINT_LEN];
            if self.base.fingerprint_matches(fingerprint) {
                debug!(
                    "fingerprint match at timestamp {}; stopping",
                    bytes::u32_le(fingerprint)
                );
                break;
            }

            current += 1;
            let keep_going = callback(dive, fingerprint);
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
        self.command(CMD_SETTIME, &epoch.to_le_bytes())?;
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
