//! Streaming FIT decoder for Garmin Descent dive logs.
//!
//! FIT is self-describing: *definition* records install a layout into one of
//! sixteen local type slots, and subsequent *data* records reference a slot
//! by number.  Each definition declares its own byte order, and every base
//! type has an invalid-value sentinel that marks an absent field.  Fields of
//! one physical record that belong together semantically (a gas mix, a deco
//! stop, a tank pressure update) are aggregated in a pending buffer and
//! flushed as one normalized output at the record boundary.
//!
//! The input is one dive as delivered by the Garmin device backend: a
//! 24-byte filename fingerprint followed by the FIT file proper.

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Utc};
use tracing::debug;

use super::profile::{
    self, BaseKind, EVENT_GAS_SWITCH, EVENT_SETPOINT_HIGH, EVENT_SETPOINT_LOW, EVENT_TABLE,
    GARMIN_EPOCH_OFFSET, MessageDesc, SENSOR_TYPE_TANK_POD, Value, decode_value,
};
use crate::fields::{FieldCache, FieldType, FieldValue, GasMix, Tank};
use crate::parser::{DecoKind, DiveDateTime, Parser, Sample, SampleCallback, Severity};
use crate::{DivestreamError, Result, bytes};

/// Length of the filename fingerprint prefixed to every dive.
pub const FINGERPRINT_LEN: usize = 24;

const LOCAL_TYPE_SLOTS: usize = 16;
const MAX_FIELD_COUNT: u8 = 128;
const MAX_SENSORS: usize = 6;

/// Semicircles to degrees: 180° / 2³¹.
fn semicircles(raw: i32) -> f64 {
    raw as f64 * (180.0 / 2_147_483_648.0)
}

#[derive(Clone, Copy, Default, Debug)]
pub(crate) struct LatLon {
    pub lat: Option<i32>,
    pub lon: Option<i32>,
}

impl LatLon {
    fn degrees(&self) -> Option<(f64, f64)> {
        Some((semicircles(self.lat?), semicircles(self.lon?)))
    }
}

/// GPS fixes collected across SESSION, LAP and RECORD messages.
#[derive(Clone, Copy, Default, Debug)]
pub(crate) struct GpsBox {
    pub session_entry: LatLon,
    pub session_exit: LatLon,
    pub session_ne: LatLon,
    pub session_sw: LatLon,
    pub lap_entry: LatLon,
    pub lap_exit: LatLon,
    pub record: LatLon,
}

#[derive(Clone, Default, Debug)]
pub(crate) struct SensorInfo {
    pub id: u32,
    pub name: Option<String>,
    pub enabled: bool,
    pub sensor_type: Option<u8>,
    pub rated_pressure: Option<f64>,
    pub volume: Option<f64>,
}

/// Mutable per-dive decoder state, created fresh for every pass.
#[derive(Default, Debug)]
pub(crate) struct DiveState {
    pub start_time: Option<u32>,
    pub file_time: Option<u32>,
    pub utc_offset: Option<i64>,
    pub time_offset: Option<i64>,
    /// Last absolute timestamp seen; base for compressed timestamps.
    pub prev_time: u32,
    pub last_emitted: Option<u32>,
    pub firmware: Option<u32>,
    pub serial: Option<u32>,
    pub product: Option<u32>,
    pub sub_sport: Option<u8>,
    pub sensors: Vec<SensorInfo>,
    pub scratch_sensor: SensorInfo,
    pub active_tank: Option<usize>,
    pub setpoint_low_cbar: Option<u8>,
    pub setpoint_low_depth_mm: Option<u32>,
    pub setpoint_high_cbar: Option<u8>,
    pub setpoint_high_depth_mm: Option<u32>,
    /// Measured water density, which outranks the water-type table value.
    pub water_density: Option<f64>,
    pub gps: GpsBox,
    pub dive_number_set: bool,
    pub deco_model_set: bool,
}

#[derive(Default, Debug)]
pub(crate) struct PendingGasmix {
    pub helium: Option<u8>,
    pub oxygen: Option<u8>,
    pub status: Option<u8>,
}

#[derive(Default, Debug)]
pub(crate) struct PendingDeco {
    pub time: Option<u32>,
    pub depth: Option<f64>,
}

#[derive(Default, Debug)]
pub(crate) struct PendingEvent {
    pub event: Option<u8>,
    pub event_type: Option<u8>,
    pub data: Option<u32>,
    pub group: Option<u8>,
}

#[derive(Default, Debug)]
pub(crate) struct PendingDeviceInfo {
    pub index: Option<u8>,
    pub serial: Option<u32>,
    pub product: Option<u32>,
    pub firmware: Option<u32>,
}

#[derive(Default, Debug)]
pub(crate) struct PendingDecoModel {
    pub model: Option<u8>,
    pub gf_low: Option<u8>,
    pub gf_high: Option<u8>,
}

#[derive(Default, Debug)]
pub(crate) struct PendingTank {
    pub sensor: Option<u32>,
    pub pressure_cbar: Option<u32>,
}

/// Aggregation buffer for the data record currently being decoded.  Drained
/// and cleared at every record boundary; fields never leak across records.
#[derive(Default, Debug)]
pub(crate) struct Pending {
    pub message_index: Option<u16>,
    pub gasmix: Option<PendingGasmix>,
    pub deco: Option<PendingDeco>,
    pub event: Option<PendingEvent>,
    pub device_info: Option<PendingDeviceInfo>,
    pub deco_model: Option<PendingDecoModel>,
    pub sensor_profile: bool,
    pub tank_update: Option<PendingTank>,
    pub setpoint_cbar: Option<u32>,
}

impl Pending {
    pub(crate) fn gasmix_mut(&mut self) -> &mut PendingGasmix {
        self.gasmix.get_or_insert_with(PendingGasmix::default)
    }

    pub(crate) fn deco_mut(&mut self) -> &mut PendingDeco {
        self.deco.get_or_insert_with(PendingDeco::default)
    }

    pub(crate) fn event_mut(&mut self) -> &mut PendingEvent {
        self.event.get_or_insert_with(PendingEvent::default)
    }

    pub(crate) fn device_info_mut(&mut self) -> &mut PendingDeviceInfo {
        self.device_info.get_or_insert_with(PendingDeviceInfo::default)
    }

    pub(crate) fn deco_model_mut(&mut self) -> &mut PendingDecoModel {
        self.deco_model.get_or_insert_with(PendingDecoModel::default)
    }

    pub(crate) fn tank_update_mut(&mut self) -> &mut PendingTank {
        self.tank_update.get_or_insert_with(PendingTank::default)
    }
}

/// Everything a field handler may touch while one record is being decoded.
pub(crate) struct DecodeCx<'r, 's> {
    pub cache: &'r mut FieldCache,
    pub state: &'s mut DiveState,
    pub pending: &'s mut Pending,
    sink: Option<&'r mut dyn FnMut(&Sample)>,
}

impl DecodeCx<'_, '_> {
    pub(crate) fn emit(&mut self, sample: &Sample) {
        if let Some(sink) = self.sink.as_mut() {
            sink(sample);
        }
    }

    /// Register an absolute timestamp and, once the dive start is known,
    /// emit the relative `Time` sample.  A timestamp that would run time
    /// backwards is refused.
    pub(crate) fn note_timestamp(&mut self, timestamp: u32) {
        self.state.prev_time = timestamp;
        let Some(start) = self.state.start_time else {
            return;
        };
        if timestamp < start {
            return;
        }
        let relative = timestamp - start;
        if self.state.last_emitted.is_some_and(|last| relative < last) {
            debug!("refusing to emit non-monotonic time sample {relative}");
            return;
        }
        self.emit(&Sample::Time(relative));
        self.state.last_emitted = Some(relative);
    }
}

/// One slot of the local type table.
struct LocalDef {
    global: u16,
    big_endian: bool,
    message: Option<&'static MessageDesc>,
    fields: Vec<(u8, u8, BaseKind)>,
    data_size: usize,
}

/// Parser for one Garmin Descent dive.
///
/// Construct, bind the dive bytes with [`Parser::set_data`], then read
/// summary fields and replay samples.  The trailing FIT CRC is verified
/// unless the parser was built with [`FitParser::lenient`]; a stored CRC of
/// zero means "not set" and is never checked.
pub struct FitParser<'d> {
    data: Option<&'d [u8]>,
    verify_crc: bool,
    cache: FieldCache,
    datetime: Option<DiveDateTime>,
}

impl<'d> FitParser<'d> {
    pub fn new() -> Self {
        FitParser {
            data: None,
            verify_crc: true,
            cache: FieldCache::new(),
            datetime: None,
        }
    }

    /// A parser that skips trailing-CRC verification, for archives truncated
    /// by interrupted downloads.
    pub fn lenient() -> Self {
        FitParser {
            verify_crc: false,
            ..FitParser::new()
        }
    }
}

impl Default for FitParser<'_> {
    fn default() -> Self {
        FitParser::new()
    }
}

impl<'d> Parser<'d> for FitParser<'d> {
    fn set_data(&mut self, data: &'d [u8]) -> Result<()> {
        self.data = None;
        self.datetime = None;
        self.cache.clear();

        let mut cache = FieldCache::new();
        let state = run_decode(data, &mut cache, None, self.verify_crc)?;
        finalize_strings(&mut cache, &state);
        self.datetime = resolve_datetime(data, &state);
        self.cache = cache;
        self.data = Some(data);
        Ok(())
    }

    fn datetime(&self) -> Result<DiveDateTime> {
        self.datetime.ok_or(DivestreamError::Unsupported)
    }

    fn field(&self, field: FieldType) -> Result<FieldValue> {
        self.cache.get(field)
    }

    fn samples_foreach(&mut self, callback: SampleCallback<'_>) -> Result<()> {
        let data = self
            .data
            .ok_or(DivestreamError::InvalidArgs("no dive data bound"))?;
        // Replay into a scratch cache so the primed one stays untouched.
        let mut scratch = FieldCache::new();
        run_decode(data, &mut scratch, Some(callback), self.verify_crc)?;
        Ok(())
    }
}

/// Garmin's table-driven CRC, covering the header and data region; the
/// 16-bit result is stored little-endian after the data.
fn fit_crc(data: &[u8]) -> u16 {
    static TABLE: [u16; 16] = [
        0x0000, 0xCC01, 0xD801, 0x1400, 0xF001, 0x3C00, 0x2800, 0xE401, 0xA001, 0x6C00, 0x7800,
        0xB401, 0x5000, 0x9C01, 0x8801, 0x4400,
    ];
    let mut sum: u16 = 0;
    for byte in data {
        let mut tmp = TABLE[(sum & 0x0F) as usize];
        sum = (sum >> 4) & 0x0FFF;
        sum = sum ^ tmp ^ TABLE[(byte & 0x0F) as usize];
        tmp = TABLE[(sum & 0x0F) as usize];
        sum = (sum >> 4) & 0x0FFF;
        sum = sum ^ tmp ^ TABLE[(byte >> 4) as usize];
    }
    sum
}

fn run_decode<'a>(
    data: &[u8],
    cache: &'a mut FieldCache,
    sink: Option<&'a mut dyn FnMut(&Sample)>,
    verify_crc: bool,
) -> Result<DiveState> {
    if data.len() < FINGERPRINT_LEN {
        return Err(DivestreamError::io("input shorter than dive fingerprint"));
    }
    let fit = &data[FINGERPRINT_LEN..];
    if fit.len() < 12 {
        return Err(DivestreamError::io("FIT header truncated"));
    }
    let header_size = fit[0] as usize;
    if header_size < 12 || header_size > fit.len() {
        return Err(DivestreamError::io("invalid FIT header size"));
    }
    if &fit[8..12] != b".FIT" {
        return Err(DivestreamError::io("missing .FIT magic"));
    }
    let data_size = bytes::u32_le(&fit[4..8]) as usize;
    let end = header_size
        .checked_add(data_size)
        .ok_or_else(|| DivestreamError::io("FIT data size overflow"))?;
    if end + 2 > fit.len() {
        return Err(DivestreamError::io("FIT data region exceeds input"));
    }
    let stored_crc = bytes::u16_le(&fit[end..end + 2]);
    if verify_crc && stored_crc != 0 {
        let computed = fit_crc(&fit[..end]);
        if computed != stored_crc {
            return Err(DivestreamError::data(format!(
                "FIT file CRC mismatch: stored {stored_crc:#06x}, computed {computed:#06x}"
            )));
        }
    }

    let mut state = DiveState::default();
    let mut pending = Pending::default();
    let mut cx = DecodeCx {
        cache,
        state: &mut state,
        pending: &mut pending,
        sink,
    };

    let mut locals: [Option<LocalDef>; LOCAL_TYPE_SLOTS] = std::array::from_fn(|_| None);
    let mut pos = header_size;
    while pos < end {
        let header = fit[pos];
        if header & 0x80 != 0 {
            // Compressed timestamp data record.
            let local = ((header >> 5) & 0x03) as usize;
            let delta = (header & 0x1F) as u32;
            let mut timestamp = (cx.state.prev_time & !0x1F) | delta;
            if timestamp < cx.state.prev_time {
                timestamp += 0x20;
            }
            cx.note_timestamp(timestamp);
            pos = decode_data_record(fit, pos, end, &locals, local, &mut cx)?;
            flush_pending(&mut cx)?;
        } else if header & 0x40 != 0 {
            let local = (header & 0x0F) as usize;
            let (def, next) = parse_definition(fit, pos, end, header)?;
            debug!(
                "definition: local {local} -> global {} ({})",
                def.global,
                def.message.map_or("unknown", |m| m.name)
            );
            locals[local] = Some(def);
            pos = next;
        } else {
            let local = (header & 0x0F) as usize;
            pos = decode_data_record(fit, pos, end, &locals, local, &mut cx)?;
            flush_pending(&mut cx)?;
        }
    }

    debug!(
        "decode complete: sub_sport {:?}, {} tank pods",
        state.sub_sport,
        state.sensors.len()
    );
    Ok(state)
}

fn parse_definition(fit: &[u8], pos: usize, end: usize, header: u8) -> Result<(LocalDef, usize)> {
    if header & 0x20 != 0 {
        return Err(DivestreamError::data(
            "developer field definitions are not supported",
        ));
    }
    if pos + 6 > end {
        return Err(DivestreamError::io("truncated definition record"));
    }
    let big_endian = fit[pos + 2] != 0;
    let global = bytes::uint(&fit[pos + 3..pos + 5], big_endian) as u16;
    let field_count = fit[pos + 5];
    if field_count > MAX_FIELD_COUNT {
        return Err(DivestreamError::io("definition field count out of range"));
    }
    let mut offset = pos + 6;
    let mut fields = Vec::with_capacity(field_count as usize);
    let mut data_size = 0usize;
    for _ in 0..field_count {
        if offset + 3 > end {
            return Err(DivestreamError::io("truncated definition record"));
        }
        let number = fit[offset];
        let size = fit[offset + 1];
        let base = BaseKind::from_code(fit[offset + 2]).ok_or_else(|| {
            DivestreamError::data(format!("unknown base type {:#04x}", fit[offset + 2]))
        })?;
        fields.push((number, size, base));
        data_size += size as usize;
        offset += 3;
    }
    Ok((
        LocalDef {
            global,
            big_endian,
            message: profile::MESSAGES.get(&global).copied(),
            fields,
            data_size,
        },
        offset,
    ))
}

fn decode_data_record(
    fit: &[u8],
    pos: usize,
    end: usize,
    locals: &[Option<LocalDef>; LOCAL_TYPE_SLOTS],
    local: usize,
    cx: &mut DecodeCx<'_, '_>,
) -> Result<usize> {
    let def = locals[local]
        .as_ref()
        .ok_or_else(|| DivestreamError::io(format!("data record references undefined local type {local}")))?;
    if pos + 1 + def.data_size > end {
        return Err(DivestreamError::io("truncated data record"));
    }

    let mut offset = pos + 1;
    for (number, size, base) in &def.fields {
        let raw = &fit[offset..offset + *size as usize];
        offset += *size as usize;
        if *size as usize % base.size() != 0 {
            return Err(DivestreamError::io(format!(
                "field size {size} not a multiple of base type width"
            )));
        }
        let Some(value) = decode_value(*base, raw, def.big_endian) else {
            // Invalid sentinel: field not present in this record.
            continue;
        };
        dispatch_field(cx, def, *number, *base, &value)?;
    }
    Ok(offset)
}

fn dispatch_field(
    cx: &mut DecodeCx<'_, '_>,
    def: &LocalDef,
    number: u8,
    wire_base: BaseKind,
    value: &Value<'_>,
) -> Result<()> {
    // Cross-message fixed-meaning field numbers come first.
    match number {
        253 => {
            if let Some(v) = value.uint() {
                cx.note_timestamp(v as u32);
            }
            return Ok(());
        }
        254 => {
            if let Some(v) = value.uint() {
                cx.pending.message_index = Some(v as u16);
            }
            return Ok(());
        }
        250 => {
            debug!("part index {value:?}");
            return Ok(());
        }
        _ => {}
    }

    match def.message {
        Some(message) => match message.field(number) {
            Some(field) => {
                if field.base != wire_base {
                    debug!(
                        "{} field {number} declared {wire_base:?}, profile expects {:?}",
                        message.name, field.base
                    );
                }
                (field.handler)(cx, value)
            }
            None => {
                profile::log_unknown_field(message.name, number, value);
                Ok(())
            }
        },
        None => {
            // Placeholder descriptor for an unknown global number.
            debug!("msg-{} field {number}: {value:?}", def.global);
            Ok(())
        }
    }
}

/// Drain the pending buffer at a data-record boundary.
fn flush_pending(cx: &mut DecodeCx<'_, '_>) -> Result<()> {
    if let Some(gas) = cx.pending.gasmix.take() {
        if gas.status.unwrap_or(0) > 0 {
            let index = cx
                .pending
                .message_index
                .map(usize::from)
                .unwrap_or_else(|| cx.cache.gasmix_count());
            let mix = GasMix {
                helium: gas.helium.unwrap_or(0) as f64 / 100.0,
                oxygen: gas.oxygen.unwrap_or(0) as f64 / 100.0,
            };
            cx.cache.assign_gasmix(index, mix)?;
        }
    }

    if let Some(deco) = cx.pending.deco.take() {
        cx.emit(&Sample::Deco {
            kind: DecoKind::DecoStop,
            time: deco.time.unwrap_or(0),
            depth: deco.depth.unwrap_or(0.0),
        });
    }

    if let Some(event) = cx.pending.event.take() {
        flush_event(cx, event);
    }

    if let Some(info) = cx.pending.device_info.take() {
        if info.index == Some(0) {
            if let Some(v) = info.serial {
                cx.state.serial = Some(v);
            }
            if let Some(v) = info.product {
                cx.state.product = Some(v);
            }
            if let Some(v) = info.firmware {
                cx.state.firmware = Some(v);
            }
        }
    }

    if let Some(model) = cx.pending.deco_model.take() {
        if model.model.unwrap_or(0) != 0 {
            debug!("unrecognized deco model {:?}", model.model);
        } else if let (Some(low), Some(high), false) =
            (model.gf_low, model.gf_high, cx.state.deco_model_set)
        {
            cx.cache
                .add_string("Deco model", format!("Buhlmann ZHL-16C {low}/{high}"));
            cx.state.deco_model_set = true;
        }
    }

    if cx.pending.sensor_profile {
        cx.pending.sensor_profile = false;
        let scratch = std::mem::take(&mut cx.state.scratch_sensor);
        if scratch.sensor_type == Some(SENSOR_TYPE_TANK_POD)
            && cx.state.sensors.len() < MAX_SENSORS
        {
            debug!(
                "tank pod {:#010x} ({:?}, enabled {}) registered",
                scratch.id, scratch.name, scratch.enabled
            );
            cx.cache.add_tank(Tank {
                sensor: scratch.id,
                volume: scratch.volume,
                rated_pressure: scratch.rated_pressure,
                begin_pressure: None,
                end_pressure: None,
            });
            cx.state.sensors.push(scratch);
        }
    }

    if let Some(update) = cx.pending.tank_update.take() {
        if let (Some(sensor), Some(cbar)) = (update.sensor, update.pressure_cbar) {
            match cx.cache.tank_by_sensor(sensor) {
                Some(tank) => cx.emit(&Sample::Pressure {
                    tank,
                    bar: cbar as f64 / 100.0,
                }),
                None => debug!("tank update for unknown sensor {sensor:#010x}"),
            }
        }
    }

    if let Some(cbar) = cx.pending.setpoint_cbar.take() {
        cx.emit(&Sample::Setpoint(cbar as f64 / 100.0));
    }

    cx.pending.message_index = None;
    Ok(())
}

fn flush_event(cx: &mut DecodeCx<'_, '_>, event: PendingEvent) {
    let Some(code) = event.event else {
        return;
    };
    debug!(
        "event {code}: type {:?}, group {:?}, data {:?}",
        event.event_type, event.group, event.data
    );
    if code == EVENT_GAS_SWITCH {
        let Some(data) = event.data else {
            return;
        };
        let index = data as usize;
        if index < cx.cache.gasmix_count() {
            cx.emit(&Sample::GasMix(index));
        } else {
            debug!("gas switch to unknown mix index {index}");
        }
        return;
    }

    let (name, severity) = EVENT_TABLE
        .get(code as usize)
        .copied()
        .unwrap_or(("Unknown event", Severity::Info));
    cx.emit(&Sample::Event {
        kind: code as u16,
        name,
        severity,
    });

    if code == EVENT_SETPOINT_LOW {
        cx.pending.setpoint_cbar = cx.state.setpoint_low_cbar.map(u32::from);
    } else if code == EVENT_SETPOINT_HIGH {
        cx.pending.setpoint_cbar = cx.state.setpoint_high_cbar.map(u32::from);
    }
}

/// Summary strings derived from the per-dive state after a priming pass.
fn finalize_strings(cache: &mut FieldCache, state: &DiveState) {
    if let Some(serial) = state.serial {
        cache.add_string("Serial", serial.to_string());
    }
    if let Some(firmware) = state.firmware {
        cache.add_string(
            "Firmware version",
            format!("{}.{:02}", firmware / 100, firmware % 100),
        );
    }
    if let Some((lat, lon)) = state.gps.session_entry.degrees() {
        cache.add_string("GPS entry", format!("{lat:.6}, {lon:.6}"));
    }
    if let Some((lat, lon)) = state.gps.session_exit.degrees() {
        cache.add_string("GPS exit", format!("{lat:.6}, {lon:.6}"));
    }
    if let (Some(cbar), Some(mm)) = (state.setpoint_low_cbar, state.setpoint_low_depth_mm) {
        cache.add_string(
            "Setpoint low",
            format!("{:.2} bar @ {:.1} m", cbar as f64 / 100.0, mm as f64 / 1000.0),
        );
    }
    if let (Some(cbar), Some(mm)) = (state.setpoint_high_cbar, state.setpoint_high_depth_mm) {
        cache.add_string(
            "Setpoint high",
            format!("{:.2} bar @ {:.1} m", cbar as f64 / 100.0, mm as f64 / 1000.0),
        );
    }
}

fn resolve_datetime(data: &[u8], state: &DiveState) -> Option<DiveDateTime> {
    if let Some(timestamp) = state.start_time.or(state.file_time) {
        let utc = DateTime::<Utc>::from_timestamp(timestamp as i64 + GARMIN_EPOCH_OFFSET, 0)?;
        if let Some(offset) = state.utc_offset {
            let zone = FixedOffset::east_opt(offset as i32)?;
            return Some(DiveDateTime::Zoned(utc.with_timezone(&zone)));
        }
        if let Some(offset) = state.time_offset {
            return Some(DiveDateTime::Local(
                (utc + Duration::seconds(offset)).naive_utc(),
            ));
        }
        return Some(DiveDateTime::Local(utc.naive_utc()));
    }
    fingerprint_datetime(data.get(..FINGERPRINT_LEN)?)
}

/// Parse `YYYY-MM-DD-HH-MM-SS.fit` out of the filename fingerprint.
fn fingerprint_datetime(fingerprint: &[u8]) -> Option<DiveDateTime> {
    let len = fingerprint
        .iter()
        .position(|b| *b == 0)
        .unwrap_or(fingerprint.len());
    let name = std::str::from_utf8(&fingerprint[..len]).ok()?;
    let stem = name.strip_suffix(".fit").or_else(|| name.strip_suffix(".FIT"))?;
    let parsed = NaiveDateTime::parse_from_str(stem, "%Y-%m-%d-%H-%M-%S").ok()?;
    Some(DiveDateTime::Local(parsed))
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use quickcheck_macros::quickcheck;

    use super::*;

    const FINGERPRINT: &[u8; 24] = b"2020-01-02-03-04-05.fit\0";
    const T0: u32 = 1_000_000_000;

    fn definition(local: u8, global: u16, fields: &[(u8, u8, u8)]) -> Vec<u8> {
        let mut out = vec![0x40 | local, 0x00, 0x00];
        out.extend_from_slice(&global.to_le_bytes());
        out.push(fields.len() as u8);
        for (number, size, base) in fields {
            out.extend_from_slice(&[*number, *size, *base]);
        }
        out
    }

    fn fit_file(records: &[u8]) -> Vec<u8> {
        let mut fit = vec![12u8, 0x10];
        fit.extend_from_slice(&0u16.to_le_bytes());
        fit.extend_from_slice(&(records.len() as u32).to_le_bytes());
        fit.extend_from_slice(b".FIT");
        fit.extend_from_slice(records);
        let crc = fit_crc(&fit);
        fit.extend_from_slice(&crc.to_le_bytes());

        let mut out = FINGERPRINT.to_vec();
        out.extend_from_slice(&fit);
        out
    }

    fn session_start(records: &mut Vec<u8>, local: u8, start: u32) {
        records.extend(definition(local, 18, &[(2, 4, 0x86)]));
        records.push(local);
        records.extend_from_slice(&start.to_le_bytes());
    }

    fn collect_samples(data: &[u8]) -> Vec<Sample> {
        let mut parser = FitParser::new();
        parser.set_data(data).unwrap();
        let mut samples = Vec::new();
        parser
            .samples_foreach(&mut |sample| samples.push(sample.clone()))
            .unwrap();
        samples
    }

    #[test]
    fn minimal_file_parses_with_empty_cache() {
        // Header only, zero body, unset CRC.
        let mut data = FINGERPRINT.to_vec();
        data.extend_from_slice(&[
            0x0C, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2E, 0x46, 0x49, 0x54, 0x00, 0x00,
        ]);
        let mut parser = FitParser::new();
        parser.set_data(&data).unwrap();
        assert_eq!(
            parser.field(FieldType::GasMixCount).unwrap(),
            FieldValue::Count(0)
        );
        let mut count = 0usize;
        parser.samples_foreach(&mut |_| count += 1).unwrap();
        assert_eq!(count, 0);
        let expected = NaiveDate::from_ymd_opt(2020, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        assert_eq!(parser.datetime().unwrap(), DiveDateTime::Local(expected));
    }

    #[test]
    fn record_samples_follow_their_time() {
        let mut records = Vec::new();
        session_start(&mut records, 0, T0);
        // Local 0 is redefined in place: now a RECORD with timestamp+depth.
        records.extend(definition(0, 20, &[(253, 4, 0x86), (92, 4, 0x86)]));
        for (time, depth) in [(T0, 0u32), (T0 + 10, 5000)] {
            records.push(0x00);
            records.extend_from_slice(&time.to_le_bytes());
            records.extend_from_slice(&depth.to_le_bytes());
        }

        let samples = collect_samples(&fit_file(&records));
        assert_eq!(
            samples,
            vec![
                Sample::Time(0),
                Sample::Depth(0.0),
                Sample::Time(10),
                Sample::Depth(5.0),
            ]
        );
    }

    #[test]
    fn gas_mixes_flush_into_cache() {
        let mut records = Vec::new();
        records.extend(definition(
            1,
            259,
            &[(254, 2, 0x84), (0, 1, 0x02), (1, 1, 0x02), (2, 1, 0x00)],
        ));
        for (index, helium, oxygen) in [(0u16, 0u8, 32u8), (1, 20, 18)] {
            records.push(0x01);
            records.extend_from_slice(&index.to_le_bytes());
            records.extend_from_slice(&[helium, oxygen, 1]);
        }

        let mut parser = FitParser::new();
        let fit_bytes = fit_file(&records);
        parser.set_data(&fit_bytes).unwrap();
        assert_eq!(
            parser.field(FieldType::GasMixCount).unwrap(),
            FieldValue::Count(2)
        );
        let FieldValue::GasMix(first) = parser.field(FieldType::GasMix(0)).unwrap() else {
            panic!("expected a gas mix");
        };
        assert_eq!(first, GasMix { helium: 0.0, oxygen: 0.32 });
        let FieldValue::GasMix(second) = parser.field(FieldType::GasMix(1)).unwrap() else {
            panic!("expected a gas mix");
        };
        assert_eq!(second, GasMix { helium: 0.20, oxygen: 0.18 });
        approx::assert_relative_eq!(second.nitrogen(), 0.62, epsilon = 1e-9);
        assert!(parser.field(FieldType::GasMix(2)).is_err());
    }

    #[test]
    fn short_header_is_io_error() {
        let mut data = FINGERPRINT.to_vec();
        data.extend_from_slice(&[0x0C, 0x10, 0x00]);
        let mut parser = FitParser::new();
        assert!(matches!(
            parser.set_data(&data),
            Err(DivestreamError::Io(_))
        ));
        // A failed bind leaves the parser in a defined empty state.
        assert!(parser.field(FieldType::DiveTime).is_err());
        assert!(parser.datetime().is_err());
    }

    #[test]
    fn bad_magic_is_io_error() {
        let mut data = FINGERPRINT.to_vec();
        data.extend_from_slice(&[
            0x0C, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2E, 0x46, 0x49, 0x58, 0x00, 0x00,
        ]);
        let mut parser = FitParser::new();
        assert!(matches!(parser.set_data(&data), Err(DivestreamError::Io(_))));
    }

    #[test]
    fn undefined_local_type_is_io_error() {
        let mut records = Vec::new();
        session_start(&mut records, 0, T0);
        records.push(0x05); // data record for a slot never defined
        let mut parser = FitParser::new();
        assert!(matches!(
            parser.set_data(&fit_file(&records)),
            Err(DivestreamError::Io(_))
        ));
    }

    #[test]
    fn sentinel_depth_is_skipped() {
        let mut records = Vec::new();
        session_start(&mut records, 0, T0);
        records.extend(definition(0, 20, &[(253, 4, 0x86), (92, 4, 0x86)]));
        records.push(0x00);
        records.extend_from_slice(&T0.to_le_bytes());
        records.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());

        let samples = collect_samples(&fit_file(&records));
        assert_eq!(samples, vec![Sample::Time(0)]);
    }

    #[test]
    fn big_endian_definitions_decode() {
        let mut records = Vec::new();
        session_start(&mut records, 0, T0);
        // Big-endian RECORD definition: arch byte 1, global and fields BE.
        let mut def = vec![0x41, 0x00, 0x01];
        def.extend_from_slice(&20u16.to_be_bytes());
        def.push(2);
        def.extend_from_slice(&[253, 4, 0x86, 92, 4, 0x86]);
        records.extend(def);
        records.push(0x01);
        records.extend_from_slice(&(T0 + 5).to_be_bytes());
        records.extend_from_slice(&12_500u32.to_be_bytes());

        let samples = collect_samples(&fit_file(&records));
        assert_eq!(samples, vec![Sample::Time(5), Sample::Depth(12.5)]);
    }

    #[test]
    fn compressed_timestamps_advance_monotonically() {
        let mut records = Vec::new();
        session_start(&mut records, 0, T0);
        records.extend(definition(0, 20, &[(253, 4, 0x86), (92, 4, 0x86)]));
        records.push(0x00);
        records.extend_from_slice(&T0.to_le_bytes());
        records.extend_from_slice(&1_000u32.to_le_bytes());

        // Compressed record on local 0 carrying only depth; T0 is a
        // multiple of 32, so the 5-bit delta lands 8 seconds after it.
        records.extend(definition(0, 20, &[(92, 4, 0x86)]));
        let delta = ((T0 + 40) & 0x1F) as u8;
        records.push(0x80 | delta);
        records.extend_from_slice(&2_000u32.to_le_bytes());

        let samples = collect_samples(&fit_file(&records));
        assert_eq!(
            samples,
            vec![
                Sample::Time(0),
                Sample::Depth(1.0),
                Sample::Time(8),
                Sample::Depth(2.0),
            ]
        );
    }

    #[test]
    fn crc_mismatch_is_data_format_error() {
        let mut records = Vec::new();
        session_start(&mut records, 0, T0);
        let mut data = fit_file(&records);
        let len = data.len();
        data[len - 1] ^= 0xA5;
        data[len - 2] ^= 0x5A;

        let mut parser = FitParser::new();
        assert!(matches!(
            parser.set_data(&data),
            Err(DivestreamError::DataFormat(_))
        ));
        // The lenient constructor admits the same bytes.
        let mut lenient = FitParser::lenient();
        assert!(lenient.set_data(&data).is_ok());
    }

    #[test]
    fn deco_fields_aggregate_into_one_sample() {
        let mut records = Vec::new();
        session_start(&mut records, 0, T0);
        records.extend(definition(0, 20, &[(253, 4, 0x86), (93, 4, 0x86), (94, 4, 0x86)]));
        records.push(0x00);
        records.extend_from_slice(&(T0 + 60).to_le_bytes());
        records.extend_from_slice(&3_000u32.to_le_bytes()); // ceiling 3 m
        records.extend_from_slice(&120u32.to_le_bytes()); // stop 120 s

        let samples = collect_samples(&fit_file(&records));
        assert_eq!(
            samples,
            vec![
                Sample::Time(60),
                Sample::Deco {
                    kind: DecoKind::DecoStop,
                    time: 120,
                    depth: 3.0,
                },
            ]
        );
    }

    #[test]
    fn gas_switch_event_emits_mix_index() {
        let mut records = Vec::new();
        session_start(&mut records, 0, T0);
        records.extend(definition(
            1,
            259,
            &[(254, 2, 0x84), (0, 1, 0x02), (1, 1, 0x02), (2, 1, 0x00)],
        ));
        records.push(0x01);
        records.extend_from_slice(&0u16.to_le_bytes());
        records.extend_from_slice(&[0, 32, 1]);

        // EVENT: event=57 (gas switch), data=0.
        records.extend(definition(2, 21, &[(0, 1, 0x00), (3, 4, 0x86)]));
        records.push(0x02);
        records.push(57);
        records.extend_from_slice(&0u32.to_le_bytes());

        let samples = collect_samples(&fit_file(&records));
        assert_eq!(samples, vec![Sample::GasMix(0)]);
    }

    #[test]
    fn device_info_becomes_cache_strings() {
        let mut records = Vec::new();
        session_start(&mut records, 0, T0);
        records.extend(definition(
            3,
            23,
            &[(0, 1, 0x02), (3, 4, 0x8C), (4, 2, 0x84), (5, 2, 0x84)],
        ));
        records.push(0x03);
        records.push(0); // device_index 0
        records.extend_from_slice(&3_111_222_333u32.to_le_bytes());
        records.extend_from_slice(&2_859u16.to_le_bytes());
        records.extend_from_slice(&510u16.to_le_bytes());

        let mut parser = FitParser::new();
        let fit_bytes = fit_file(&records);
        parser.set_data(&fit_bytes).unwrap();
        let mut strings = Vec::new();
        for index in 0.. {
            match parser.field(FieldType::String(index)) {
                Ok(FieldValue::String { desc, value }) => strings.push((desc, value)),
                _ => break,
            }
        }
        assert!(strings.contains(&("Serial".into(), "3111222333".into())));
        assert!(strings.contains(&("Firmware version".into(), "5.10".into())));
    }

    #[test]
    fn surface_pressure_comes_from_the_first_record() {
        let mut records = Vec::new();
        session_start(&mut records, 0, T0);
        records.extend(definition(
            0,
            20,
            &[(253, 4, 0x86), (91, 4, 0x86), (92, 4, 0x86)],
        ));
        // At the surface, then at depth; only the first absolute pressure
        // counts as atmospheric.
        for (time, pascal, depth) in [(T0, 101_300u32, 0u32), (T0 + 10, 201_300, 10_000)] {
            records.push(0x00);
            records.extend_from_slice(&time.to_le_bytes());
            records.extend_from_slice(&pascal.to_le_bytes());
            records.extend_from_slice(&depth.to_le_bytes());
        }

        let mut parser = FitParser::new();
        let fit_bytes = fit_file(&records);
        parser.set_data(&fit_bytes).unwrap();
        assert_eq!(
            parser.field(FieldType::Atmospheric).unwrap(),
            FieldValue::Atmospheric(1.013)
        );
    }

    #[test]
    fn water_density_wins_regardless_of_field_order() {
        use crate::fields::{Salinity, WaterKind};

        let expected = FieldValue::Salinity(Salinity {
            kind: WaterKind::Custom,
            density: 1021.5,
        });

        // Canonical order: water_type (4) before water_density (5).
        let mut records = Vec::new();
        session_start(&mut records, 0, T0);
        records.extend(definition(1, 258, &[(4, 1, 0x00), (5, 4, 0x88)]));
        records.push(0x01);
        records.push(3); // custom
        records.extend_from_slice(&1021.5f32.to_le_bytes());
        let mut parser = FitParser::new();
        let fit_bytes = fit_file(&records);
        parser.set_data(&fit_bytes).unwrap();
        assert_eq!(parser.field(FieldType::Salinity).unwrap(), expected);

        // Density declared ahead of the type; the measured value must not
        // be clobbered by the type's table density.
        let mut records = Vec::new();
        session_start(&mut records, 0, T0);
        records.extend(definition(1, 258, &[(5, 4, 0x88), (4, 1, 0x00)]));
        records.push(0x01);
        records.extend_from_slice(&1021.5f32.to_le_bytes());
        records.push(3);
        let mut parser = FitParser::new();
        let fit_bytes = fit_file(&records);
        parser.set_data(&fit_bytes).unwrap();
        assert_eq!(parser.field(FieldType::Salinity).unwrap(), expected);
    }

    #[test]
    fn setpoint_switch_synthesizes_setpoint_sample() {
        let mut records = Vec::new();
        session_start(&mut records, 0, T0);
        // DIVE_SETTINGS installs the low setpoint.
        records.extend(definition(1, 258, &[(23, 1, 0x02)]));
        records.push(0x01);
        records.push(130);
        // EVENT 24: switch to the low setpoint.
        records.extend(definition(2, 21, &[(0, 1, 0x00)]));
        records.push(0x02);
        records.push(24);

        let samples = collect_samples(&fit_file(&records));
        assert_eq!(
            samples,
            vec![
                Sample::Event {
                    kind: 24,
                    name: "Setpoint switched low",
                    severity: Severity::Info,
                },
                Sample::Setpoint(1.3),
            ]
        );
    }

    #[test]
    fn dive_summary_and_deco_model_prime_the_cache() {
        let mut records = Vec::new();
        session_start(&mut records, 0, T0);
        records.extend(definition(
            1,
            268,
            &[(2, 4, 0x86), (3, 4, 0x86), (11, 4, 0x86)],
        ));
        records.push(0x01);
        records.extend_from_slice(&11_500u32.to_le_bytes()); // avg, mm
        records.extend_from_slice(&31_310u32.to_le_bytes()); // max, mm
        records.extend_from_slice(&496_000u32.to_le_bytes()); // bottom, ms

        records.extend(definition(2, 258, &[(1, 1, 0x00), (2, 1, 0x02), (3, 1, 0x02)]));
        records.push(0x02);
        records.extend_from_slice(&[0, 30, 85]);

        let mut parser = FitParser::new();
        let fit_bytes = fit_file(&records);
        parser.set_data(&fit_bytes).unwrap();
        assert_eq!(
            parser.field(FieldType::DiveTime).unwrap(),
            FieldValue::DiveTime(496)
        );
        assert_eq!(
            parser.field(FieldType::AvgDepth).unwrap(),
            FieldValue::Depth(11.5)
        );
        assert_eq!(
            parser.field(FieldType::MaxDepth).unwrap(),
            FieldValue::Depth(31.31)
        );
        assert_eq!(
            parser.field(FieldType::String(0)).unwrap(),
            FieldValue::String {
                desc: "Deco model".into(),
                value: "Buhlmann ZHL-16C 30/85".into(),
            }
        );
    }

    #[test]
    fn tank_pod_registration_and_pressure_updates() {
        const POD: u32 = 0x1234_5678;
        let mut records = Vec::new();
        session_start(&mut records, 0, T0);

        // SENSOR_PROFILE registers the pod with volume and rated pressure.
        records.extend(definition(
            2,
            147,
            &[(0, 4, 0x8C), (3, 1, 0x02), (5, 2, 0x84), (7, 4, 0x86)],
        ));
        records.push(0x02);
        records.extend_from_slice(&POD.to_le_bytes());
        records.push(28);
        records.extend_from_slice(&23_200u16.to_le_bytes());
        records.extend_from_slice(&1_200u32.to_le_bytes());

        // TANK_UPDATE reports a live pressure for it.
        records.extend(definition(3, 319, &[(0, 4, 0x8C), (1, 2, 0x84)]));
        records.push(0x03);
        records.extend_from_slice(&POD.to_le_bytes());
        records.extend_from_slice(&20_500u16.to_le_bytes());

        // TANK_SUMMARY closes out the begin/end pressures.
        records.extend(definition(
            4,
            323,
            &[(0, 4, 0x8C), (1, 2, 0x84), (2, 2, 0x84)],
        ));
        records.push(0x04);
        records.extend_from_slice(&POD.to_le_bytes());
        records.extend_from_slice(&20_700u16.to_le_bytes());
        records.extend_from_slice(&5_000u16.to_le_bytes());

        let data = fit_file(&records);
        let mut parser = FitParser::new();
        parser.set_data(&data).unwrap();
        assert_eq!(
            parser.field(FieldType::TankCount).unwrap(),
            FieldValue::Count(1)
        );
        let FieldValue::Tank(tank) = parser.field(FieldType::Tank(0)).unwrap() else {
            panic!("expected a tank");
        };
        assert_eq!(tank.sensor, POD);
        assert_eq!(tank.volume, Some(12.0));
        assert_eq!(tank.rated_pressure, Some(232.0));
        assert_eq!(tank.begin_pressure, Some(207.0));
        assert_eq!(tank.end_pressure, Some(50.0));

        let samples = collect_samples(&data);
        assert!(samples.contains(&Sample::Pressure { tank: 0, bar: 205.0 }));
    }

    #[quickcheck]
    fn time_samples_never_decrease(deltas: Vec<u16>) -> bool {
        let mut records = Vec::new();
        session_start(&mut records, 0, T0);
        records.extend(definition(0, 20, &[(253, 4, 0x86), (92, 4, 0x86)]));
        let mut time = T0;
        for delta in &deltas {
            // Deltas may move backwards to exercise the refusal path.
            time = time.wrapping_add(*delta as u32).wrapping_sub(100);
            records.push(0x00);
            records.extend_from_slice(&time.to_le_bytes());
            records.extend_from_slice(&1_000u32.to_le_bytes());
        }

        let samples = collect_samples(&fit_file(&records));
        let times: Vec<u32> = samples
            .iter()
            .filter_map(|sample| match sample {
                Sample::Time(t) => Some(*t),
                _ => None,
            })
            .collect();
        times.windows(2).all(|pair| pair[0] <= pair[1])
    }
}
