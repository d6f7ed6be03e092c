//! Deepblu Cosmiq+ backend: commands and replies are single ASCII-hex lines.
//!
//! A command line is `'#' hh(cmd) hh(csum) hh(ndata) hh*(data) '\n'` where
//! `ndata` counts the hex digits of the payload (twice the byte count); the
//! reply uses `'$'` in place of `'#'`.  The checksum is the two's complement
//! of the modular byte sum over `cmd`, `ndata` and the payload, so a valid
//! line sums to zero.

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

const CMD_SETTIME: u8 = 0x20;
const CMD_VERSION: u8 = 0x30;
const CMD_GETDIVE: u8 = 0xA0;
const CMD_GETPROFILE: u8 = 0xA1;

const MAX_LINE: usize = 1024;
const VERSION_LEN: usize = 9;

fn checksum(cmd: u8, ndata: u8, data: &[u8]) -> u8 {
    0u8.wrapping_sub(bytes::sum8(data, cmd.wrapping_add(ndata)))
}

fn encode(cmd: u8, data: &[u8]) -> Vec<u8> {
    let ndata = (data.len() * 2) as u8;
    let mut line = vec![b'#'];
    line.extend_from_slice(&bytes::hex_pair(cmd));
    line.extend_from_slice(&bytes::hex_pair(checksum(cmd, ndata, data)));
    line.extend_from_slice(&bytes::hex_pair(ndata));
    for byte in data {
        line.extend_from_slice(&bytes::hex_pair(*byte));
    }
    line.push(b'\n');
    line
}

fn decode_hex_byte(line: &[u8], at: usize) -> Result<u8> {
    let (Some(hi), Some(lo)) = (line.get(at), line.get(at + 1)) else {
        return Err(DivestreamError::protocol("reply line truncated"));
    };
    bytes::hex_byte(*hi, *lo).ok_or_else(|| DivestreamError::protocol("non-hex digit in reply"))
}

/// Parse a `$`-framed reply line into `(cmd, payload)`.
fn decode(line: &[u8]) -> Result<(u8, Vec<u8>)> {
    if line.first() != Some(&b'$') {
        return Err(DivestreamError::protocol("reply does not start with '$'"));
    }
    let cmd = decode_hex_byte(line, 1)?;
    let csum = decode_hex_byte(line, 3)?;
    let ndata = decode_hex_byte(line, 5)?;
    if ndata % 2 != 0 {
        return Err(DivestreamError::protocol("odd payload digit count"));
    }
    let received = ndata as usize / 2;
    let mut data = Vec::with_capacity(received);
    for index in 0..received {
        data.push(decode_hex_byte(line, 7 + 2 * index)?);
    }
    if bytes::sum8(&data, cmd.wrapping_add(ndata).wrapping_add(csum)) != 0 {
        return Err(DivestreamError::protocol("reply checksum mismatch"));
    }
    Ok((cmd, data))
}

pub struct DeepbluDevice<T: Transport> {
    base: DeviceBase,
    transport: T,
    ndives: u16,
}

impl<T: Transport> DeepbluDevice<T> {
    pub fn open(mut transport: T, sink: Option<EventSink>) -> Result<Self> {
        transport.set_timeout(Duration::from_millis(1000))?;
        let mut device = DeepbluDevice {
            base: DeviceBase::new(FINGERPRINT_LEN, sink),
            transport,
            ndives: 0,
        };

        let version = device.transfer(CMD_VERSION, &[])?;
        if version.len() < VERSION_LEN {
            return Err(DivestreamError::protocol(format!(
                "version block too short: {} bytes",
                version.len()
            )));
        }
        let model = version[0] as u32;
        let firmware = ((version[1] as u32) << 8) | version[2] as u32;
        let serial = bytes::u32_le(&version[3..7]);
        device.ndives = bytes::u16_le(&version[7..9]);
        device.base.emit(&Event::Devinfo {
            model,
            firmware,
            serial,
        });
        Ok(device)
    }

    fn transfer(&mut self, cmd: u8, data: &[u8]) -> Result<Vec<u8>> {
        self.base.check_cancelled()?;
        self.transport.write_all(&encode(cmd, data))?;
        self.transport.flush()?;

        let line = self.recv_line()?;
        let (reply_cmd, payload) = decode(&line)?;
        if reply_cmd != cmd {
            return Err(DivestreamError::protocol(format!(
                "unexpected reply opcode {reply_cmd:#04x} to {cmd:#04x}"
            )));
        }
        Ok(payload)
    }

    /// Accumulate one reply line.  The filled length is tracked explicitly,
    /// so the terminator scan never reaches before the buffer start.
    fn recv_line(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            self.transport.read_all(&mut byte)?;
            if byte[0] == b'\n' {
                return Ok(line);
            }
            line.push(byte[0]);
            if line.len() > MAX_LINE {
                return Err(DivestreamError::protocol("reply line too long"));
            }
        }
    }

    /// One dive: the header block followed by all its profile chunks.
    fn read_dive(&mut self, index: u16) -> Result<Vec<u8>> {
        let mut dive = self.transfer(CMD_GETDIVE, &index.to_le_bytes())?;
        if dive.len() < FINGERPRINT_LEN {
            return Err(DivestreamError::data("dive header too short"));
        }
        loop {
            let chunk = self.transfer(CMD_GETPROFILE, &index.to_le_bytes())?;
            if chunk.is_empty() {
                break;
            }
            dive.extend_from_slice(&chunk);
        }
        Ok(dive)
    }
}

impl<T: Transport> Device for DeepbluDevice<T> {
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

        // Slot 0 is the most recent dive.
        for index in 0..self.ndives {
            self.base.check_cancelled()?;
            let dive = self.read_dive(index)?;
            let fingerprint = dive[..FINGERPRINT_LEN].to_vec();
            if self.base.fingerprint_matches(&fingerprint) {
                debug!("fingerprint match at dive slot {index}; stopping");
                break;
            }

            let keep_going = callback(&dive, &fingerprint);
            self.base.emit_progress(index as u32 + 1, maximum);
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
        self.transfer(CMD_SETTIME, &epoch.to_le_bytes())?;
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
