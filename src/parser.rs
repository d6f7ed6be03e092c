//! The parser capability: one dive's bytes in, normalized fields and samples
//! out.
//!
//! A parser is created per dive.  `set_data` binds the dive's bytes and walks
//! them once silently to prime the [`FieldCache`]; `samples_foreach` replays
//! the decode, this time pushing [`Sample`] values at the caller's callback.

use chrono::{DateTime, FixedOffset, NaiveDateTime};

use crate::Result;
use crate::fields::{FieldType, FieldValue};

/// The wall-clock start of a dive.
///
/// Most formats store a naive local timestamp; only some encode the UTC
/// offset alongside it.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum DiveDateTime {
    /// Local wall-clock time, zone unknown.
    Local(NaiveDateTime),
    /// Time with a known UTC offset.
    Zoned(DateTime<FixedOffset>),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DecoKind {
    /// Remaining no-decompression limit.
    Ndl,
    DecoStop,
    SafetyStop,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Alarm,
}

/// One decoded sample, delivered in time order to the caller's callback.
///
/// Within one `samples_foreach` run, a `Time` sample precedes every other
/// sample belonging to that instant, and time values never decrease.
#[derive(Clone, PartialEq, Debug)]
pub enum Sample {
    /// Seconds since the start of the dive.
    Time(u32),
    /// Depth in meters.
    Depth(f64),
    /// Water temperature in °C.
    Temperature(f64),
    /// Cylinder pressure in bar, for the tank at `tank`.
    Pressure { tank: usize, bar: f64 },
    /// The diver switched to the gas mix at this cache index.
    GasMix(usize),
    /// Decompression state: remaining NDL, a required stop, or a safety
    /// stop, with the stop time in seconds and ceiling depth in meters.
    Deco { kind: DecoKind, time: u32, depth: f64 },
    /// Oxygen partial pressure in bar.
    Ppo2(f64),
    /// Rebreather setpoint in bar.
    Setpoint(f64),
    /// CNS oxygen toxicity as a fraction of the clock, `0.0..=1.0`.
    Cns(f64),
    /// Heart rate in beats per minute.
    Heartbeat(u32),
    /// Time to surface in seconds, including all required stops.
    Tts(u32),
    /// Remaining bottom time in minutes.
    Rbt(u32),
    /// A discrete device event.
    Event {
        kind: u16,
        name: &'static str,
        severity: Severity,
    },
}

/// Callback receiving decoded samples.
pub type SampleCallback<'a> = &'a mut dyn FnMut(&Sample);

/// Uniform decode contract over the per-vendor log formats.
///
/// The dive bytes are borrowed for the life of the parser; `set_data` may be
/// called again to reset the parser onto a different dive.
pub trait Parser<'d> {
    /// Bind one dive's bytes and prime the field cache.
    ///
    /// On error the parser is left in a defined empty state: every field
    /// reads as unsupported until a later `set_data` succeeds.
    fn set_data(&mut self, data: &'d [u8]) -> Result<()>;

    /// The dive's wall-clock start time.
    fn datetime(&self) -> Result<DiveDateTime>;

    /// Retrieve a cached summary field.
    fn field(&self, field: FieldType) -> Result<FieldValue>;

    /// Replay the decode, delivering samples in time order.
    fn samples_foreach(&mut self, callback: SampleCallback<'_>) -> Result<()>;
}
