//! The static side of the FIT profile: base types with their invalid-value
//! sentinels, and the table of known global messages with per-field decode
//! handlers.
//!
//! FIT definition records declare fields as `(field_number, size, base_type)`
//! triples; the base type fixes the width and the sentinel that marks a field
//! as absent.  Field numbers 253 (timestamp), 254 (message index) and 250
//! (part index) have a fixed meaning in every message and are dispatched
//! before this table is consulted.

use phf::phf_map;
use tracing::debug;

use super::parser::DecodeCx;
use crate::fields::{DiveMode, FieldType, FieldValue, Salinity, Tank, WaterKind};
use crate::parser::{DecoKind, Sample, Severity};
use crate::{Result, bytes};

/// Offset from the Garmin epoch (1989-12-31T00:00:00Z) to the Unix epoch.
pub(crate) const GARMIN_EPOCH_OFFSET: i64 = 631_065_600;

/// Sensor type code of a wireless tank pressure transmitter.
pub(crate) const SENSOR_TYPE_TANK_POD: u8 = 28;

/// A FIT base type: fixed width plus an all-bits sentinel meaning "field not
/// present in this record".
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum BaseKind {
    Enum,
    Sint8,
    Uint8,
    Sint16,
    Uint16,
    Sint32,
    Uint32,
    String,
    Float32,
    Float64,
    Uint8z,
    Uint16z,
    Uint32z,
    Byte,
    Sint64,
    Uint64,
    Uint64z,
}

impl BaseKind {
    /// Resolve the base-type byte of a definition record.  The low five bits
    /// carry the type number; the top bit only flags multi-byte width.
    pub(crate) fn from_code(code: u8) -> Option<BaseKind> {
        use BaseKind::*;
        match code & 0x1F {
            0 => Some(Enum),
            1 => Some(Sint8),
            2 => Some(Uint8),
            3 => Some(Sint16),
            4 => Some(Uint16),
            5 => Some(Sint32),
            6 => Some(Uint32),
            7 => Some(String),
            8 => Some(Float32),
            9 => Some(Float64),
            10 => Some(Uint8z),
            11 => Some(Uint16z),
            12 => Some(Uint32z),
            13 => Some(Byte),
            14 => Some(Sint64),
            15 => Some(Uint64),
            16 => Some(Uint64z),
            _ => None,
        }
    }

    pub(crate) fn size(self) -> usize {
        use BaseKind::*;
        match self {
            Enum | Sint8 | Uint8 | Uint8z | Byte | String => 1,
            Sint16 | Uint16 | Uint16z => 2,
            Sint32 | Uint32 | Uint32z | Float32 => 4,
            Sint64 | Uint64 | Uint64z | Float64 => 8,
        }
    }

    /// The raw bit pattern that marks this field as not set.
    pub(crate) fn invalid(self) -> u64 {
        use BaseKind::*;
        match self {
            Enum | Uint8 | Byte => 0xFF,
            Sint8 => 0x7F,
            Sint16 => 0x7FFF,
            Uint16 => 0xFFFF,
            Sint32 => 0x7FFF_FFFF,
            Uint32 | Float32 => 0xFFFF_FFFF,
            Sint64 => 0x7FFF_FFFF_FFFF_FFFF,
            Uint64 | Float64 => 0xFFFF_FFFF_FFFF_FFFF,
            // Zero-is-invalid types and strings.
            Uint8z | Uint16z | Uint32z | Uint64z | String => 0,
        }
    }
}

/// One decoded field value, already honoring the record's endianness.
#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) enum Value<'v> {
    Uint(u64),
    Sint(i64),
    Float(f64),
    Str(&'v str),
    /// An array field; handlers that expect scalars ignore these.
    Bytes(&'v [u8]),
}

impl<'v> Value<'v> {
    pub(crate) fn uint(&self) -> Option<u64> {
        match self {
            Value::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub(crate) fn sint(&self) -> Option<i64> {
        match self {
            Value::Sint(v) => Some(*v),
            _ => None,
        }
    }

    pub(crate) fn float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub(crate) fn str(&self) -> Option<&'v str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }
}

/// Decode one field's raw bytes.  Returns `None` when the bytes carry the
/// base type's invalid sentinel, in which case the field is skipped silently.
pub(crate) fn decode_value<'v>(
    base: BaseKind,
    data: &'v [u8],
    big_endian: bool,
) -> Option<Value<'v>> {
    use BaseKind::*;

    if base == String {
        let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
        if end == 0 {
            return None;
        }
        return std::str::from_utf8(&data[..end]).ok().map(Value::Str);
    }
    if data.len() > base.size() {
        // Array-typed field; no scalar sentinel applies.
        return Some(Value::Bytes(data));
    }

    let raw = bytes::uint(data, big_endian);
    if raw == base.invalid() {
        return None;
    }
    match base {
        Sint8 | Sint16 | Sint32 | Sint64 => {
            let bits = 8 * base.size() as u32;
            Some(Value::Sint(((raw << (64 - bits)) as i64) >> (64 - bits)))
        }
        Float32 => Some(Value::Float(f32::from_bits(raw as u32) as f64)),
        Float64 => Some(Value::Float(f64::from_bits(raw))),
        _ => Some(Value::Uint(raw)),
    }
}

/// Per-field decode hook; updates the cache, per-dive state, or the pending
/// record buffer.
pub(crate) type Handler = fn(&mut DecodeCx<'_, '_>, &Value<'_>) -> Result<()>;

pub(crate) struct FieldDesc {
    pub number: u8,
    pub name: &'static str,
    pub base: BaseKind,
    pub handler: Handler,
}

pub(crate) struct MessageDesc {
    pub name: &'static str,
    pub fields: &'static [FieldDesc],
}

impl MessageDesc {
    pub(crate) fn field(&self, number: u8) -> Option<&'static FieldDesc> {
        self.fields.iter().find(|field| field.number == number)
    }
}

/// Recognized fields the decoder does not interpret.  Being in the table
/// keeps them out of the unknown-field diagnostics.
fn recognized(_cx: &mut DecodeCx<'_, '_>, _value: &Value<'_>) -> Result<()> {
    Ok(())
}

// file_id

fn file_product(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.state.product.get_or_insert(v as u32);
    }
    Ok(())
}

fn file_serial(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.state.serial.get_or_insert(v as u32);
    }
    Ok(())
}

fn file_time_created(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.state.file_time = Some(v as u32);
    }
    Ok(())
}

static FILE: MessageDesc = MessageDesc {
    name: "file_id",
    fields: &[
        FieldDesc { number: 0, name: "type", base: BaseKind::Enum, handler: recognized },
        FieldDesc { number: 1, name: "manufacturer", base: BaseKind::Uint16, handler: recognized },
        FieldDesc { number: 2, name: "product", base: BaseKind::Uint16, handler: file_product },
        FieldDesc { number: 3, name: "serial_number", base: BaseKind::Uint32z, handler: file_serial },
        FieldDesc { number: 4, name: "time_created", base: BaseKind::Uint32, handler: file_time_created },
        FieldDesc { number: 5, name: "number", base: BaseKind::Uint16, handler: recognized },
        FieldDesc { number: 7, name: "other_time", base: BaseKind::Uint32, handler: recognized },
    ],
};

// device_settings

fn settings_utc_offset(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        // Reported in units of 3600 s.
        cx.state.utc_offset = Some((v as u32 as i32 as i64) * 3600);
    }
    Ok(())
}

fn settings_time_offset(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.state.time_offset = Some(v as u32 as i32 as i64);
    }
    Ok(())
}

static DEVICE_SETTINGS: MessageDesc = MessageDesc {
    name: "device_settings",
    fields: &[
        FieldDesc { number: 1, name: "utc_offset", base: BaseKind::Uint32, handler: settings_utc_offset },
        FieldDesc { number: 2, name: "time_offset", base: BaseKind::Uint32, handler: settings_time_offset },
    ],
};

// sport

fn sport_sub_sport(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    let Some(v) = value.uint() else { return Ok(()) };
    cx.state.sub_sport = Some(v as u8);
    let mode = match v {
        53 | 54 => DiveMode::OpenCircuit,
        55 => DiveMode::Gauge,
        56 | 57 => DiveMode::Freedive,
        63 => DiveMode::ClosedCircuit,
        _ => DiveMode::OpenCircuit,
    };
    cx.cache.set_divemode(mode);
    Ok(())
}

static SPORT: MessageDesc = MessageDesc {
    name: "sport",
    fields: &[
        FieldDesc { number: 0, name: "sport", base: BaseKind::Enum, handler: recognized },
        FieldDesc { number: 1, name: "sub_sport", base: BaseKind::Enum, handler: sport_sub_sport },
        FieldDesc { number: 3, name: "name", base: BaseKind::String, handler: recognized },
    ],
};

// session

fn session_start_time(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        // The first session start becomes the dive start.
        cx.state.start_time.get_or_insert(v as u32);
    }
    Ok(())
}

macro_rules! gps_handler {
    ($fn_name:ident, $point:ident, $axis:ident) => {
        fn $fn_name(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
            if let Some(v) = value.sint() {
                cx.state.gps.$point.$axis = Some(v as i32);
            }
            Ok(())
        }
    };
}

gps_handler!(session_entry_lat, session_entry, lat);
gps_handler!(session_entry_lon, session_entry, lon);
gps_handler!(session_ne_lat, session_ne, lat);
gps_handler!(session_ne_lon, session_ne, lon);
gps_handler!(session_sw_lat, session_sw, lat);
gps_handler!(session_sw_lon, session_sw, lon);
gps_handler!(session_exit_lat, session_exit, lat);
gps_handler!(session_exit_lon, session_exit, lon);
gps_handler!(lap_entry_lat, lap_entry, lat);
gps_handler!(lap_entry_lon, lap_entry, lon);
gps_handler!(lap_exit_lat, lap_exit, lat);
gps_handler!(lap_exit_lon, lap_exit, lon);

static SESSION: MessageDesc = MessageDesc {
    name: "session",
    fields: &[
        FieldDesc { number: 2, name: "start_time", base: BaseKind::Uint32, handler: session_start_time },
        FieldDesc { number: 3, name: "start_position_lat", base: BaseKind::Sint32, handler: session_entry_lat },
        FieldDesc { number: 4, name: "start_position_long", base: BaseKind::Sint32, handler: session_entry_lon },
        FieldDesc { number: 29, name: "nec_lat", base: BaseKind::Sint32, handler: session_ne_lat },
        FieldDesc { number: 30, name: "nec_long", base: BaseKind::Sint32, handler: session_ne_lon },
        FieldDesc { number: 31, name: "swc_lat", base: BaseKind::Sint32, handler: session_sw_lat },
        FieldDesc { number: 32, name: "swc_long", base: BaseKind::Sint32, handler: session_sw_lon },
        FieldDesc { number: 38, name: "exit_position_lat", base: BaseKind::Sint32, handler: session_exit_lat },
        FieldDesc { number: 39, name: "exit_position_long", base: BaseKind::Sint32, handler: session_exit_lon },
    ],
};

static LAP: MessageDesc = MessageDesc {
    name: "lap",
    fields: &[
        FieldDesc { number: 3, name: "start_position_lat", base: BaseKind::Sint32, handler: lap_entry_lat },
        FieldDesc { number: 4, name: "start_position_long", base: BaseKind::Sint32, handler: lap_entry_lon },
        FieldDesc { number: 5, name: "end_position_lat", base: BaseKind::Sint32, handler: lap_exit_lat },
        FieldDesc { number: 6, name: "end_position_long", base: BaseKind::Sint32, handler: lap_exit_lon },
    ],
};

// record

fn record_position_lat(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.sint() {
        cx.state.gps.record.lat.get_or_insert(v as i32);
    }
    Ok(())
}

fn record_position_lon(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.sint() {
        cx.state.gps.record.lon.get_or_insert(v as i32);
    }
    Ok(())
}

fn record_heart_rate(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.emit(&Sample::Heartbeat(v as u32));
    }
    Ok(())
}

fn record_temperature(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.sint() {
        cx.emit(&Sample::Temperature(v as f64));
    }
    Ok(())
}

fn record_abs_pressure(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        // The first sample is taken at the surface.
        if cx.cache.get(FieldType::Atmospheric).is_err() {
            cx.cache.set_atmospheric(v as f64 / 100_000.0);
        }
    }
    Ok(())
}

fn record_depth(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.emit(&Sample::Depth(v as f64 / 1000.0));
    }
    Ok(())
}

fn record_next_stop_depth(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.pending.deco_mut().depth = Some(v as f64 / 1000.0);
    }
    Ok(())
}

fn record_next_stop_time(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.pending.deco_mut().time = Some(v as u32);
    }
    Ok(())
}

fn record_tts(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.emit(&Sample::Tts(v as u32));
    }
    Ok(())
}

fn record_ndl(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.emit(&Sample::Deco {
            kind: DecoKind::Ndl,
            time: v as u32,
            depth: 0.0,
        });
    }
    Ok(())
}

fn record_cns(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.emit(&Sample::Cns(v as f64 / 100.0));
    }
    Ok(())
}

fn record_air_time(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.emit(&Sample::Rbt(v as u32 / 60));
    }
    Ok(())
}

static RECORD: MessageDesc = MessageDesc {
    name: "record",
    fields: &[
        FieldDesc { number: 0, name: "position_lat", base: BaseKind::Sint32, handler: record_position_lat },
        FieldDesc { number: 1, name: "position_long", base: BaseKind::Sint32, handler: record_position_lon },
        FieldDesc { number: 2, name: "altitude", base: BaseKind::Uint16, handler: recognized },
        FieldDesc { number: 3, name: "heart_rate", base: BaseKind::Uint8, handler: record_heart_rate },
        FieldDesc { number: 5, name: "distance", base: BaseKind::Uint32, handler: recognized },
        FieldDesc { number: 13, name: "temperature", base: BaseKind::Sint8, handler: record_temperature },
        FieldDesc { number: 91, name: "absolute_pressure", base: BaseKind::Uint32, handler: record_abs_pressure },
        FieldDesc { number: 92, name: "depth", base: BaseKind::Uint32, handler: record_depth },
        FieldDesc { number: 93, name: "next_stop_depth", base: BaseKind::Uint32, handler: record_next_stop_depth },
        FieldDesc { number: 94, name: "next_stop_time", base: BaseKind::Uint32, handler: record_next_stop_time },
        FieldDesc { number: 95, name: "time_to_surface", base: BaseKind::Uint32, handler: record_tts },
        FieldDesc { number: 96, name: "ndl_time", base: BaseKind::Uint32, handler: record_ndl },
        FieldDesc { number: 97, name: "cns_load", base: BaseKind::Uint8, handler: record_cns },
        FieldDesc { number: 98, name: "n2_load", base: BaseKind::Uint16, handler: recognized },
        FieldDesc { number: 123, name: "air_time_remaining", base: BaseKind::Uint32, handler: record_air_time },
        FieldDesc { number: 124, name: "pressure_sac", base: BaseKind::Uint16, handler: recognized },
        FieldDesc { number: 125, name: "volume_sac", base: BaseKind::Uint16, handler: recognized },
        FieldDesc { number: 126, name: "rmv", base: BaseKind::Uint16, handler: recognized },
        FieldDesc { number: 127, name: "ascent_rate", base: BaseKind::Sint32, handler: recognized },
    ],
};

// event

fn event_event(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.pending.event_mut().event = Some(v as u8);
    }
    Ok(())
}

fn event_type(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.pending.event_mut().event_type = Some(v as u8);
    }
    Ok(())
}

fn event_data(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.pending.event_mut().data = Some(v as u32);
    }
    Ok(())
}

fn event_group(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.pending.event_mut().group = Some(v as u8);
    }
    Ok(())
}

fn event_tank_reserve(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if value.uint().is_some() {
        cx.emit(&Sample::Event {
            kind: 71,
            name: "Tank pressure reserve",
            severity: Severity::Warning,
        });
    }
    Ok(())
}

fn event_tank_critical(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if value.uint().is_some() {
        cx.emit(&Sample::Event {
            kind: 72,
            name: "Tank pressure critical",
            severity: Severity::Alarm,
        });
    }
    Ok(())
}

fn event_tank_lost(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if value.uint().is_some() {
        cx.emit(&Sample::Event {
            kind: 73,
            name: "Tank pod lost",
            severity: Severity::Alarm,
        });
    }
    Ok(())
}

static EVENT: MessageDesc = MessageDesc {
    name: "event",
    fields: &[
        FieldDesc { number: 0, name: "event", base: BaseKind::Enum, handler: event_event },
        FieldDesc { number: 1, name: "event_type", base: BaseKind::Enum, handler: event_type },
        FieldDesc { number: 3, name: "data", base: BaseKind::Uint32, handler: event_data },
        FieldDesc { number: 4, name: "event_group", base: BaseKind::Uint8, handler: event_group },
        FieldDesc { number: 15, name: "device_index", base: BaseKind::Uint8, handler: recognized },
        FieldDesc { number: 21, name: "tank_pressure_reserve", base: BaseKind::Uint32z, handler: event_tank_reserve },
        FieldDesc { number: 22, name: "tank_pressure_critical", base: BaseKind::Uint32z, handler: event_tank_critical },
        FieldDesc { number: 23, name: "tank_lost", base: BaseKind::Uint32z, handler: event_tank_lost },
    ],
};

// device_info

fn devinfo_index(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.pending.device_info_mut().index = Some(v as u8);
    }
    Ok(())
}

fn devinfo_serial(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.pending.device_info_mut().serial = Some(v as u32);
    }
    Ok(())
}

fn devinfo_product(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.pending.device_info_mut().product = Some(v as u32);
    }
    Ok(())
}

fn devinfo_firmware(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.pending.device_info_mut().firmware = Some(v as u32);
    }
    Ok(())
}

static DEVICE_INFO: MessageDesc = MessageDesc {
    name: "device_info",
    fields: &[
        FieldDesc { number: 0, name: "device_index", base: BaseKind::Uint8, handler: devinfo_index },
        FieldDesc { number: 3, name: "serial_number", base: BaseKind::Uint32z, handler: devinfo_serial },
        FieldDesc { number: 4, name: "product", base: BaseKind::Uint16, handler: devinfo_product },
        FieldDesc { number: 5, name: "software_version", base: BaseKind::Uint16, handler: devinfo_firmware },
    ],
};

// dive_gas

fn gas_helium(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.pending.gasmix_mut().helium = Some(v as u8);
    }
    Ok(())
}

fn gas_oxygen(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.pending.gasmix_mut().oxygen = Some(v as u8);
    }
    Ok(())
}

fn gas_status(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.pending.gasmix_mut().status = Some(v as u8);
    }
    Ok(())
}

static DIVE_GAS: MessageDesc = MessageDesc {
    name: "dive_gas",
    fields: &[
        FieldDesc { number: 0, name: "helium_content", base: BaseKind::Uint8, handler: gas_helium },
        FieldDesc { number: 1, name: "oxygen_content", base: BaseKind::Uint8, handler: gas_oxygen },
        FieldDesc { number: 2, name: "status", base: BaseKind::Enum, handler: gas_status },
    ],
};

// dive_summary

fn summary_avg_depth(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.cache.set_avgdepth(v as f64 / 1000.0);
    }
    Ok(())
}

fn summary_max_depth(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.cache.set_maxdepth(v as f64 / 1000.0);
    }
    Ok(())
}

fn summary_dive_number(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        if !cx.state.dive_number_set {
            cx.cache.add_string("Dive number", v.to_string());
            cx.state.dive_number_set = true;
        }
    }
    Ok(())
}

fn summary_bottom_time(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        // Milliseconds on the wire.
        cx.cache.set_divetime((v / 1000) as u32);
    }
    Ok(())
}

static DIVE_SUMMARY: MessageDesc = MessageDesc {
    name: "dive_summary",
    fields: &[
        FieldDesc { number: 0, name: "reference_mesg", base: BaseKind::Uint16, handler: recognized },
        FieldDesc { number: 1, name: "reference_index", base: BaseKind::Uint16, handler: recognized },
        FieldDesc { number: 2, name: "avg_depth", base: BaseKind::Uint32, handler: summary_avg_depth },
        FieldDesc { number: 3, name: "max_depth", base: BaseKind::Uint32, handler: summary_max_depth },
        FieldDesc { number: 4, name: "surface_interval", base: BaseKind::Uint32, handler: recognized },
        FieldDesc { number: 5, name: "start_cns", base: BaseKind::Uint8, handler: recognized },
        FieldDesc { number: 6, name: "end_cns", base: BaseKind::Uint8, handler: recognized },
        FieldDesc { number: 7, name: "start_n2", base: BaseKind::Uint16, handler: recognized },
        FieldDesc { number: 8, name: "end_n2", base: BaseKind::Uint16, handler: recognized },
        FieldDesc { number: 9, name: "o2_toxicity", base: BaseKind::Uint16, handler: recognized },
        FieldDesc { number: 10, name: "dive_number", base: BaseKind::Uint32, handler: summary_dive_number },
        FieldDesc { number: 11, name: "bottom_time", base: BaseKind::Uint32, handler: summary_bottom_time },
        FieldDesc { number: 12, name: "avg_pressure_sac", base: BaseKind::Uint16, handler: recognized },
        FieldDesc { number: 13, name: "avg_volume_sac", base: BaseKind::Uint16, handler: recognized },
        FieldDesc { number: 14, name: "avg_rmv", base: BaseKind::Uint16, handler: recognized },
    ],
};

// dive_settings

fn dsettings_model(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.pending.deco_model_mut().model = Some(v as u8);
    }
    Ok(())
}

fn dsettings_gf_low(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.pending.deco_model_mut().gf_low = Some(v as u8);
    }
    Ok(())
}

fn dsettings_gf_high(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.pending.deco_model_mut().gf_high = Some(v as u8);
    }
    Ok(())
}

fn dsettings_water_type(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    let Some(v) = value.uint() else { return Ok(()) };
    let (kind, table_density) = match v {
        0 => (WaterKind::Fresh, 1000.0),
        1 => (WaterKind::Salt, 1025.0),
        // EN 13319 reference density.
        2 => (WaterKind::Salt, 1019.7),
        _ => (WaterKind::Custom, 1000.0),
    };
    // Field order within the record is whatever the definition declared; a
    // measured density must win over the table value either way around.
    let density = cx.state.water_density.unwrap_or(table_density);
    cx.cache.set_salinity(Salinity { kind, density });
    Ok(())
}

fn dsettings_water_density(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(density) = value.float() {
        cx.state.water_density = Some(density);
        let kind = match cx.cache.get(FieldType::Salinity) {
            Ok(FieldValue::Salinity(s)) => s.kind,
            _ => WaterKind::Custom,
        };
        cx.cache.set_salinity(Salinity { kind, density });
    }
    Ok(())
}

fn dsettings_setpoint_low(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.state.setpoint_low_cbar = Some(v as u8);
    }
    Ok(())
}

fn dsettings_setpoint_low_depth(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.state.setpoint_low_depth_mm = Some(v as u32);
    }
    Ok(())
}

fn dsettings_setpoint_high(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.state.setpoint_high_cbar = Some(v as u8);
    }
    Ok(())
}

fn dsettings_setpoint_high_depth(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.state.setpoint_high_depth_mm = Some(v as u32);
    }
    Ok(())
}

static DIVE_SETTINGS: MessageDesc = MessageDesc {
    name: "dive_settings",
    fields: &[
        FieldDesc { number: 0, name: "name", base: BaseKind::String, handler: recognized },
        FieldDesc { number: 1, name: "model", base: BaseKind::Enum, handler: dsettings_model },
        FieldDesc { number: 2, name: "gf_low", base: BaseKind::Uint8, handler: dsettings_gf_low },
        FieldDesc { number: 3, name: "gf_high", base: BaseKind::Uint8, handler: dsettings_gf_high },
        FieldDesc { number: 4, name: "water_type", base: BaseKind::Enum, handler: dsettings_water_type },
        FieldDesc { number: 5, name: "water_density", base: BaseKind::Float32, handler: dsettings_water_density },
        FieldDesc { number: 6, name: "po2_warn", base: BaseKind::Uint8, handler: recognized },
        FieldDesc { number: 7, name: "po2_critical", base: BaseKind::Uint8, handler: recognized },
        FieldDesc { number: 8, name: "po2_deco", base: BaseKind::Uint8, handler: recognized },
        FieldDesc { number: 9, name: "safety_stop_enabled", base: BaseKind::Enum, handler: recognized },
        FieldDesc { number: 10, name: "bottom_depth", base: BaseKind::Float32, handler: recognized },
        FieldDesc { number: 11, name: "bottom_time", base: BaseKind::Uint32, handler: recognized },
        FieldDesc { number: 17, name: "repeat_dive_interval", base: BaseKind::Uint16, handler: recognized },
        FieldDesc { number: 18, name: "safety_stop_time", base: BaseKind::Uint16, handler: recognized },
        FieldDesc { number: 21, name: "travel_gas", base: BaseKind::Uint8, handler: recognized },
        FieldDesc { number: 22, name: "ccr_low_setpoint_switch_mode", base: BaseKind::Enum, handler: recognized },
        FieldDesc { number: 23, name: "ccr_low_setpoint", base: BaseKind::Uint8, handler: dsettings_setpoint_low },
        FieldDesc { number: 24, name: "ccr_low_setpoint_depth", base: BaseKind::Uint32, handler: dsettings_setpoint_low_depth },
        FieldDesc { number: 25, name: "ccr_high_setpoint_switch_mode", base: BaseKind::Enum, handler: recognized },
        FieldDesc { number: 26, name: "ccr_high_setpoint", base: BaseKind::Uint8, handler: dsettings_setpoint_high },
        FieldDesc { number: 27, name: "ccr_high_setpoint_depth", base: BaseKind::Uint32, handler: dsettings_setpoint_high_depth },
        FieldDesc { number: 29, name: "gas_consumption_display", base: BaseKind::Enum, handler: recognized },
        FieldDesc { number: 35, name: "dive_sounds", base: BaseKind::Enum, handler: recognized },
        FieldDesc { number: 36, name: "last_stop_multiple", base: BaseKind::Uint8, handler: recognized },
        FieldDesc { number: 37, name: "no_fly_time_mode", base: BaseKind::Enum, handler: recognized },
    ],
};

// sensor_profile

fn sensor_channel_id(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.state.scratch_sensor.id = v as u32;
        cx.pending.sensor_profile = true;
    }
    Ok(())
}

fn sensor_name(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(name) = value.str() {
        cx.state.scratch_sensor.name = Some(name.to_owned());
        cx.pending.sensor_profile = true;
    }
    Ok(())
}

fn sensor_enabled(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.state.scratch_sensor.enabled = v != 0;
        cx.pending.sensor_profile = true;
    }
    Ok(())
}

fn sensor_type(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.state.scratch_sensor.sensor_type = Some(v as u8);
        cx.pending.sensor_profile = true;
    }
    Ok(())
}

fn sensor_rated_pressure(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.state.scratch_sensor.rated_pressure = Some(v as f64 / 100.0);
        cx.pending.sensor_profile = true;
    }
    Ok(())
}

fn sensor_volume(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.state.scratch_sensor.volume = Some(v as f64 / 100.0);
        cx.pending.sensor_profile = true;
    }
    Ok(())
}

static SENSOR_PROFILE: MessageDesc = MessageDesc {
    name: "sensor_profile",
    fields: &[
        FieldDesc { number: 0, name: "ant_channel_id", base: BaseKind::Uint32z, handler: sensor_channel_id },
        FieldDesc { number: 1, name: "name", base: BaseKind::String, handler: sensor_name },
        FieldDesc { number: 2, name: "enabled", base: BaseKind::Enum, handler: sensor_enabled },
        FieldDesc { number: 3, name: "sensor_type", base: BaseKind::Uint8, handler: sensor_type },
        FieldDesc { number: 4, name: "pressure_units", base: BaseKind::Enum, handler: recognized },
        FieldDesc { number: 5, name: "rated_pressure", base: BaseKind::Uint16, handler: sensor_rated_pressure },
        FieldDesc { number: 6, name: "reserve_pressure", base: BaseKind::Uint16, handler: recognized },
        FieldDesc { number: 7, name: "volume", base: BaseKind::Uint32, handler: sensor_volume },
        FieldDesc { number: 8, name: "used_for_gas_rate", base: BaseKind::Enum, handler: recognized },
    ],
};

// tank_update

fn tank_update_sensor(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.pending.tank_update_mut().sensor = Some(v as u32);
    }
    Ok(())
}

fn tank_update_pressure(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let Some(v) = value.uint() {
        cx.pending.tank_update_mut().pressure_cbar = Some(v as u32);
    }
    Ok(())
}

static TANK_UPDATE: MessageDesc = MessageDesc {
    name: "tank_update",
    fields: &[
        FieldDesc { number: 0, name: "sensor", base: BaseKind::Uint32z, handler: tank_update_sensor },
        FieldDesc { number: 1, name: "pressure", base: BaseKind::Uint16, handler: tank_update_pressure },
    ],
};

// tank_summary

fn tank_summary_sensor(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    let Some(v) = value.uint() else { return Ok(()) };
    cx.state.active_tank = cx.cache.tank_by_sensor(v as u32);
    if cx.state.active_tank.is_none() {
        // A summary for a pod that never registered a profile; track it so
        // the begin/end pressures still land somewhere retrievable.
        cx.state.active_tank = Some(cx.cache.add_tank(Tank {
            sensor: v as u32,
            ..Tank::default()
        }));
    }
    Ok(())
}

fn tank_summary_start(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let (Some(v), Some(index)) = (value.uint(), cx.state.active_tank) {
        if let Some(tank) = cx.cache.tank_mut(index) {
            tank.begin_pressure = Some(v as f64 / 100.0);
        }
    }
    Ok(())
}

fn tank_summary_end(cx: &mut DecodeCx<'_, '_>, value: &Value<'_>) -> Result<()> {
    if let (Some(v), Some(index)) = (value.uint(), cx.state.active_tank) {
        if let Some(tank) = cx.cache.tank_mut(index) {
            tank.end_pressure = Some(v as f64 / 100.0);
        }
    }
    Ok(())
}

static TANK_SUMMARY: MessageDesc = MessageDesc {
    name: "tank_summary",
    fields: &[
        FieldDesc { number: 0, name: "sensor", base: BaseKind::Uint32z, handler: tank_summary_sensor },
        FieldDesc { number: 1, name: "start_pressure", base: BaseKind::Uint16, handler: tank_summary_start },
        FieldDesc { number: 2, name: "end_pressure", base: BaseKind::Uint16, handler: tank_summary_end },
        FieldDesc { number: 3, name: "volume_used", base: BaseKind::Uint32, handler: recognized },
    ],
};

/// Global message number → descriptor.  Unknown numbers fall through to a
/// per-parser placeholder whose fields are logged but not interpreted.
pub(crate) static MESSAGES: phf::Map<u16, &'static MessageDesc> = phf_map! {
    0u16 => &FILE,
    2u16 => &DEVICE_SETTINGS,
    12u16 => &SPORT,
    18u16 => &SESSION,
    19u16 => &LAP,
    20u16 => &RECORD,
    21u16 => &EVENT,
    23u16 => &DEVICE_INFO,
    147u16 => &SENSOR_PROFILE,
    258u16 => &DIVE_SETTINGS,
    259u16 => &DIVE_GAS,
    268u16 => &DIVE_SUMMARY,
    319u16 => &TANK_UPDATE,
    323u16 => &TANK_SUMMARY,
};

/// Fixed event-code table consulted when an aggregated EVENT record is
/// flushed.  Codes 24 and 25 are the Descent's setpoint switches and also
/// synthesize a `Setpoint` sample; code 57 is a gas switch carrying the gas
/// index in `data`.
pub(crate) const EVENT_GAS_SWITCH: u8 = 57;
pub(crate) const EVENT_SETPOINT_LOW: u8 = 24;
pub(crate) const EVENT_SETPOINT_HIGH: u8 = 25;

pub(crate) static EVENT_TABLE: [(&str, Severity); 33] = [
    ("Timer", Severity::Info),                   // 0
    ("Unknown", Severity::Info),                 // 1
    ("Unknown", Severity::Info),                 // 2
    ("Workout", Severity::Info),                 // 3
    ("Workout step", Severity::Info),            // 4
    ("Power down", Severity::Info),              // 5
    ("Power up", Severity::Info),                // 6
    ("Off course", Severity::Warning),           // 7
    ("Session", Severity::Info),                 // 8
    ("Lap", Severity::Info),                     // 9
    ("Course point", Severity::Info),            // 10
    ("Battery", Severity::Warning),              // 11
    ("Virtual partner pace", Severity::Info),    // 12
    ("HR high alert", Severity::Warning),        // 13
    ("HR low alert", Severity::Warning),         // 14
    ("Speed high alert", Severity::Warning),     // 15
    ("Speed low alert", Severity::Warning),      // 16
    ("Cadence high alert", Severity::Warning),   // 17
    ("Cadence low alert", Severity::Warning),    // 18
    ("Power high alert", Severity::Warning),     // 19
    ("Power low alert", Severity::Warning),      // 20
    ("Recovery HR", Severity::Info),             // 21
    ("Battery low", Severity::Warning),          // 22
    ("Time duration alert", Severity::Warning),  // 23
    ("Setpoint switched low", Severity::Info),   // 24
    ("Setpoint switched high", Severity::Info),  // 25
    ("Activity", Severity::Info),                // 26
    ("Fitness equipment", Severity::Info),       // 27
    ("Length", Severity::Info),                  // 28
    ("Unknown", Severity::Info),                 // 29
    ("Unknown", Severity::Info),                 // 30
    ("Unknown", Severity::Info),                 // 31
    ("User marker", Severity::Info),             // 32
];

pub(crate) fn log_unknown_field(message: &str, number: u8, value: &Value<'_>) {
    debug!("unhandled {message} field {number}: {value:?}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_type_codes_resolve_with_endian_bit() {
        assert_eq!(BaseKind::from_code(0x84), Some(BaseKind::Uint16));
        assert_eq!(BaseKind::from_code(0x04), Some(BaseKind::Uint16));
        assert_eq!(BaseKind::from_code(0x07), Some(BaseKind::String));
        assert_eq!(BaseKind::from_code(0x1F), None);
    }

    #[test]
    fn sentinel_skips_field() {
        assert_eq!(decode_value(BaseKind::Uint8, &[0xFF], false), None);
        assert_eq!(decode_value(BaseKind::Uint16, &[0xFF, 0xFF], false), None);
        assert_eq!(
            decode_value(BaseKind::Sint32, &[0xFF, 0xFF, 0xFF, 0x7F], false),
            None
        );
        assert_eq!(decode_value(BaseKind::Uint32z, &[0, 0, 0, 0], false), None);
        assert_eq!(decode_value(BaseKind::String, &[0, b'x'], false), None);
    }

    #[test]
    fn scalar_decode_honors_endianness() {
        assert_eq!(
            decode_value(BaseKind::Uint16, &[0x34, 0x12], false),
            Some(Value::Uint(0x1234))
        );
        assert_eq!(
            decode_value(BaseKind::Uint16, &[0x12, 0x34], true),
            Some(Value::Uint(0x1234))
        );
        assert_eq!(
            decode_value(BaseKind::Sint8, &[0xFE], false),
            Some(Value::Sint(-2))
        );
    }

    #[test]
    fn string_decode_trims_terminator() {
        assert_eq!(
            decode_value(BaseKind::String, b"10%/85%\0\0", false),
            Some(Value::Str("10%/85%"))
        );
    }

    #[test]
    fn known_messages_resolve() {
        assert_eq!(MESSAGES.get(&20u16).unwrap().name, "record");
        assert_eq!(MESSAGES.get(&259u16).unwrap().name, "dive_gas");
        assert!(MESSAGES.get(&9999u16).is_none());
        let record = MESSAGES.get(&20u16).unwrap();
        assert_eq!(record.field(92).unwrap().name, "depth");
        assert!(record.field(200).is_none());
    }
}
