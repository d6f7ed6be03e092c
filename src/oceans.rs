//! Oceans S1 backend: a line-oriented ASCII protocol over BLE serial, with a
//! framed "blob mode" for bulk transfers.
//!
//! Commands are newline-terminated (`utc`, `dllist`, `dlget N M`) and every
//! reply starts with `<cmd>>ok`.  Bulk data arrives after the host sends
//! `C`: the device streams `{0x01, seq, 255-seq, 512-byte payload, 16-bit
//! checksum}` frames, each acked with `0x06`, and signals the end with
//! `0x04`.  The log itself is text: `dive`, `continue`, `enddive` and sample
//! lines at a fixed sample interval.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::bytes;
use crate::device::{Cancel, Device, DeviceBase, DiveCallback};
use crate::event::{Event, EventSink};
use crate::fields::{DiveMode, FieldCache, FieldType, FieldValue, GasMix};
use crate::parser::{DiveDateTime, Parser, Sample, SampleCallback, Severity};
use crate::transport::Transport;
use crate::{DivestreamError, Result};

/// Fingerprint width: the dive's header line, zero-padded.
pub const FINGERPRINT_LEN: usize = 32;

const BLOB_START: u8 = b'C';
const BLOB_PACKET: u8 = 0x01;
const BLOB_END: u8 = 0x04;
const BLOB_ACK: u8 = 0x06;
const BLOB_PAYLOAD: usize = 512;
const MAX_LINE: usize = 256;
const DEFAULT_INTERVAL: u32 = 10;

pub struct OceansDevice<T: Transport> {
    base: DeviceBase,
    transport: T,
}

/// One entry of the `dllist` log listing.
struct DiveEntry {
    number: u32,
    header: String,
}

impl<T: Transport> OceansDevice<T> {
    /// Take ownership of a connected transport and validate the link with a
    /// `utc` round-trip, reporting the device clock through the sink.
    pub fn open(mut transport: T, sink: Option<EventSink>) -> Result<Self> {
        transport.set_timeout(Duration::from_millis(1000))?;
        let mut device = OceansDevice {
            base: DeviceBase::new(FINGERPRINT_LEN, sink),
            transport,
        };
        let clock = device.command("utc")?;
        if let Ok(devtime) = clock.parse::<u32>() {
            let systime = Utc::now();
            device.base.emit(&Event::Clock { systime, devtime });
        }
        Ok(device)
    }

    /// Send one command and return the payload after `<cmd>>ok`.
    fn command(&mut self, command: &str) -> Result<String> {
        self.base.check_cancelled()?;
        self.transport.write_all(command.as_bytes())?;
        self.transport.write_all(b"\n")?;
        self.transport.flush()?;

        let line = self.read_line()?;
        let stem = command.split_whitespace().next().unwrap_or(command);
        let prefix = format!("{stem}>ok");
        match line.strip_prefix(&prefix) {
            Some(rest) => Ok(rest.trim().to_owned()),
            None => Err(DivestreamError::protocol(format!(
                "unexpected reply to {stem:?}: {line:?}"
            ))),
        }
    }

    fn read_line(&mut self) -> Result<String> {
        let mut line = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            self.transport.read_all(&mut byte)?;
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
            if line.len() > MAX_LINE {
                return Err(DivestreamError::protocol("reply line too long"));
            }
        }
        while line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8(line)
            .map_err(|_| DivestreamError::protocol("reply line is not ASCII"))
    }

    /// Pull one blob-mode transfer and strip the zero padding of the last
    /// frame.
    fn read_blob(&mut self) -> Result<Vec<u8>> {
        self.transport.write_all(&[BLOB_START])?;
        let mut blob = Vec::new();
        let mut seq: u8 = 0;
        loop {
            self.base.check_cancelled()?;
            let mut opcode = [0u8; 1];
            self.transport.read_all(&mut opcode)?;
            match opcode[0] {
                BLOB_END => {
                    self.transport.write_all(&[BLOB_ACK])?;
                    break;
                }
                BLOB_PACKET => {
                    let mut header = [0u8; 2];
                    self.transport.read_all(&mut header)?;
                    if header[0] != seq || header[1] as u16 + seq as u16 != 255 {
                        return Err(DivestreamError::io(format!(
                            "blob sequence mismatch: expected {seq}, got {}/{}",
                            header[0], header[1]
                        )));
                    }
                    let mut payload = [0u8; BLOB_PAYLOAD];
                    self.transport.read_all(&mut payload)?;
                    let mut checksum = [0u8; 2];
                    self.transport.read_all(&mut checksum)?;
                    let expected = bytes::u16_le(&checksum);
                    let computed = bytes::sum16(&payload, 0);
                    if computed != expected {
                        return Err(DivestreamError::protocol(format!(
                            "blob checksum mismatch: stored {expected:#06x}, computed {computed:#06x}"
                        )));
                    }
                    blob.extend_from_slice(&payload);
                    self.transport.write_all(&[BLOB_ACK])?;
                    seq = seq.wrapping_add(1);
                }
                other => {
                    return Err(DivestreamError::protocol(format!(
                        "unexpected blob opcode {other:#04x}"
                    )));
                }
            }
        }
        while blob.last() == Some(&0) {
            blob.pop();
        }
        Ok(blob)
    }

    /// Parse the `dllist` text into per-dive entries, oldest first.
    fn parse_listing(listing: &[u8]) -> Vec<DiveEntry> {
        let text = String::from_utf8_lossy(listing);
        let mut entries = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("dive ") {
                let number = rest
                    .split(',')
                    .next()
                    .and_then(|field| field.trim().parse().ok())
                    .unwrap_or(0);
                entries.push(DiveEntry {
                    number,
                    header: line.to_owned(),
                });
            }
        }
        entries
    }

    fn fingerprint_for(entry: &DiveEntry) -> Vec<u8> {
        let mut fingerprint = entry.header.as_bytes().to_vec();
        fingerprint.truncate(FINGERPRINT_LEN);
        fingerprint.resize(FINGERPRINT_LEN, 0);
        fingerprint
    }
}

impl<T: Transport> Device for OceansDevice<T> {
    fn set_fingerprint(&mut self, fingerprint: &[u8]) -> Result<()> {
        self.base.set_fingerprint(fingerprint)
    }

    fn dump(&mut self, out: &mut Vec<u8>) -> Result<()> {
        self.base.ensure_open()?;
        self.base.emit_progress(0, 1);
        self.command("dllist")?;
        let listing = self.read_blob()?;
        out.extend_from_slice(&listing);
        self.base.emit_progress(1, 1);
        Ok(())
    }

    fn foreach(&mut self, callback: DiveCallback<'_>) -> Result<()> {
        self.base.ensure_open()?;
        self.command("dllist")?;
        let listing = self.read_blob()?;
        let entries = Self::parse_listing(&listing);
        let maximum = entries.len() as u32;
        self.base.emit_progress(0, maximum);

        // The log lists dives oldest first; the contract is newest first.
        let mut current = 0u32;
        for entry in entries.iter().rev() {
            self.base.check_cancelled()?;
            let fingerprint = Self::fingerprint_for(entry);
            if self.base.fingerprint_matches(&fingerprint) {
                debug!("fingerprint match at dive {}; stopping", entry.number);
                break;
            }

            self.command(&format!("dlget {} {}", entry.number, entry.number + 1))?;
            let dive = self.read_blob()?;

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
        self.command(&format!("utc {epoch}"))?;
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

/// Decoded form of one sample line.
enum LogLine<'l> {
    Header { interval: u32 },
    Dive { mode: u32, oxygen: u32, epoch: i64 },
    Continue { surface_s: u32 },
    EndDive { max_depth_cm: u32, duration_s: u32 },
    Sample { depth_cm: u32, temperature: f64, flags: u32 },
    Other(&'l str),
}

fn classify(line: &str) -> LogLine<'_> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("divelog ") {
        // e.g. "v1,10s/sample"
        let interval = rest
            .split(',')
            .nth(1)
            .and_then(|f| f.trim().strip_suffix("s/sample"))
            .and_then(|f| f.parse().ok())
            .unwrap_or(DEFAULT_INTERVAL);
        return LogLine::Header { interval };
    }
    if let Some(rest) = line.strip_prefix("dive ") {
        let mut fields = rest.split(',').map(str::trim);
        let _number: u32 = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        let mode = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        let oxygen = fields.next().and_then(|f| f.parse().ok()).unwrap_or(21);
        let epoch = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        return LogLine::Dive { mode, oxygen, epoch };
    }
    if let Some(rest) = line.strip_prefix("continue ") {
        let surface_s = rest
            .split(',')
            .nth(1)
            .and_then(|f| f.trim().parse().ok())
            .unwrap_or(0);
        return LogLine::Continue { surface_s };
    }
    if let Some(rest) = line.strip_prefix("enddive ") {
        let mut fields = rest.split(',').map(str::trim);
        let max_depth_cm = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        let duration_s = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        return LogLine::EndDive { max_depth_cm, duration_s };
    }
    // Sample lines are bare "depth_cm,temperature,flags_hex".
    let mut fields = line.split(',').map(str::trim);
    if let (Some(depth), temperature, flags) = (
        fields.next().and_then(|f| f.parse::<u32>().ok()),
        fields.next().and_then(|f| f.parse::<f64>().ok()),
        fields.next().and_then(|f| u32::from_str_radix(f, 16).ok()),
    ) {
        return LogLine::Sample {
            depth_cm: depth,
            temperature: temperature.unwrap_or(f64::NAN),
            flags: flags.unwrap_or(0),
        };
    }
    LogLine::Other(line)
}

/// Parser for the Oceans S1 text log of one dive.
pub struct OceansParser<'d> {
    data: Option<&'d str>,
    cache: FieldCache,
    datetime: Option<DiveDateTime>,
    interval: u32,
}

impl OceansParser<'_> {
    pub fn new() -> Self {
        OceansParser {
            data: None,
            cache: FieldCache::new(),
            datetime: None,
            interval: DEFAULT_INTERVAL,
        }
    }
}

impl Default for OceansParser<'_> {
    fn default() -> Self {
        OceansParser::new()
    }
}

impl<'d> Parser<'d> for OceansParser<'d> {
    fn set_data(&mut self, data: &'d [u8]) -> Result<()> {
        self.data = None;
        self.datetime = None;
        self.interval = DEFAULT_INTERVAL;
        self.cache.clear();

        let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
        let text = std::str::from_utf8(&data[..end])
            .map_err(|_| DivestreamError::data("dive log is not UTF-8 text"))?;

        let mut cache = FieldCache::new();
        let mut datetime = None;
        let mut interval = DEFAULT_INTERVAL;
        for line in text.lines() {
            match classify(line) {
                LogLine::Header { interval: parsed } => interval = parsed,
                LogLine::Dive { mode, oxygen, epoch } => {
                    cache.set_divemode(match mode {
                        1 => DiveMode::Gauge,
                        2 => DiveMode::Freedive,
                        _ => DiveMode::OpenCircuit,
                    });
                    cache.assign_gasmix(
                        0,
                        GasMix {
                            helium: 0.0,
                            oxygen: oxygen as f64 / 100.0,
                        },
                    )?;
                    datetime = DateTime::<Utc>::from_timestamp(epoch, 0)
                        .map(|utc| DiveDateTime::Local(utc.naive_utc()));
                }
                LogLine::EndDive { max_depth_cm, duration_s } => {
                    cache.set_maxdepth(max_depth_cm as f64 / 100.0);
                    cache.set_divetime(duration_s);
                }
                LogLine::Continue { .. } | LogLine::Sample { .. } => {}
                LogLine::Other(other) => {
                    if !other.is_empty() && other != "endlog" {
                        debug!("unrecognized log line {other:?}");
                    }
                }
            }
        }

        self.cache = cache;
        self.datetime = datetime;
        self.interval = interval;
        self.data = Some(text);
        Ok(())
    }

    fn datetime(&self) -> Result<DiveDateTime> {
        self.datetime.ok_or(DivestreamError::Unsupported)
    }

    fn field(&self, field: FieldType) -> Result<FieldValue> {
        self.cache.get(field)
    }

    fn samples_foreach(&mut self, callback: SampleCallback<'_>) -> Result<()> {
        let text = self
            .data
            .ok_or(DivestreamError::InvalidArgs("no dive data bound"))?;
        let mut time = 0u32;
        for line in text.lines() {
            match classify(line) {
                LogLine::Sample { depth_cm, temperature, flags } => {
                    callback(&Sample::Time(time));
                    callback(&Sample::Depth(depth_cm as f64 / 100.0));
                    if temperature.is_finite() {
                        callback(&Sample::Temperature(temperature));
                    }
                    if flags & 0x01 != 0 {
                        callback(&Sample::Event {
                            kind: 1,
                            name: "Ascent rate warning",
                            severity: Severity::Warning,
                        });
                    }
                    if flags & 0x02 != 0 {
                        callback(&Sample::Event {
                            kind: 2,
                            name: "Safety stop",
                            severity: Severity::Info,
                        });
                    }
                    time += self.interval;
                }
                LogLine::Continue { surface_s } => {
                    // Bracket the surface interval with a pair of surface
                    // samples so plots do not interpolate across it.
                    callback(&Sample::Time(time));
                    callback(&Sample::Depth(0.0));
                    time += surface_s;
                    callback(&Sample::Time(time));
                    callback(&Sample::Depth(0.0));
                    time += self.interval;
                }
                _ => {}
            }
        }
        Ok(())
    }
}
