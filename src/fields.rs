//! The parsed-summary field cache shared by every parser backend.
//!
//! A parser's first pass over a dive fills this cache; `get_field` style
//! retrieval then reads from it without touching the raw bytes again.  Every
//! scalar is `Option`-gated: a field a format never produced reads back as
//! [`DivestreamError::Unsupported`], which is how callers probe what a given
//! dive actually recorded.

use strum::Display;

use crate::{DivestreamError, Result};

/// Upper bound on gas mixes a single dive may carry.
pub const MAX_GASES: usize = 16;

/// A breathing gas, stored as volume fractions in `0.0..=1.0`.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct GasMix {
    pub helium: f64,
    pub oxygen: f64,
}

impl GasMix {
    /// The balance of the mix.
    pub fn nitrogen(&self) -> f64 {
        1.0 - self.oxygen - self.helium
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[strum(serialize_all = "lowercase")]
pub enum WaterKind {
    Fresh,
    Salt,
    Custom,
}

/// Water type and density (kg/m³) used for depth conversion on the device.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Salinity {
    pub kind: WaterKind,
    pub density: f64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum DiveMode {
    #[strum(serialize = "open-circuit")]
    OpenCircuit,
    #[strum(serialize = "closed-circuit rebreather")]
    ClosedCircuit,
    #[strum(serialize = "gauge")]
    Gauge,
    #[strum(serialize = "freedive")]
    Freedive,
}

/// A cylinder attached to the dive, typically via a wireless pressure pod.
#[derive(Clone, Copy, PartialEq, Debug, Default)]
pub struct Tank {
    /// Transmitter identity (ANT channel id or similar), 0 if none.
    pub sensor: u32,
    /// Water volume in liters.
    pub volume: Option<f64>,
    /// Rated working pressure in bar.
    pub rated_pressure: Option<f64>,
    pub begin_pressure: Option<f64>,
    pub end_pressure: Option<f64>,
}

/// The closed set of retrievable summary fields.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FieldType {
    /// Dive duration in seconds.
    DiveTime,
    /// Maximum depth in meters.
    MaxDepth,
    /// Average depth in meters.
    AvgDepth,
    /// Surface pressure in bar.
    Atmospheric,
    GasMixCount,
    TankCount,
    GasMix(usize),
    Tank(usize),
    Salinity,
    DiveMode,
    /// Free-form `(description, value)` string pair by insertion index.
    String(usize),
}

/// A retrieved field value.
#[derive(Clone, PartialEq, Debug)]
pub enum FieldValue {
    DiveTime(u32),
    Depth(f64),
    Atmospheric(f64),
    Count(usize),
    GasMix(GasMix),
    Tank(Tank),
    Salinity(Salinity),
    DiveMode(DiveMode),
    String { desc: String, value: String },
}

/// Keyed store of everything a parser's priming pass extracted.
#[derive(Clone, Debug, Default)]
pub struct FieldCache {
    divetime: Option<u32>,
    maxdepth: Option<f64>,
    avgdepth: Option<f64>,
    atmospheric: Option<f64>,
    salinity: Option<Salinity>,
    divemode: Option<DiveMode>,
    gasmixes: Vec<Option<GasMix>>,
    ngasmixes: usize,
    tanks: Vec<Tank>,
    strings: Vec<(String, String)>,
}

impl FieldCache {
    pub fn new() -> Self {
        FieldCache::default()
    }

    /// Drop everything; the cache reads as fully uninitialized afterwards.
    pub(crate) fn clear(&mut self) {
        *self = FieldCache::default();
    }

    /// Retrieve a field.  Fields the parse never set, and indexed fields at
    /// or beyond their count, yield `Unsupported`.
    pub fn get(&self, field: FieldType) -> Result<FieldValue> {
        match field {
            FieldType::DiveTime => self.divetime.map(FieldValue::DiveTime),
            FieldType::MaxDepth => self.maxdepth.map(FieldValue::Depth),
            FieldType::AvgDepth => self.avgdepth.map(FieldValue::Depth),
            FieldType::Atmospheric => self.atmospheric.map(FieldValue::Atmospheric),
            FieldType::Salinity => self.salinity.map(FieldValue::Salinity),
            FieldType::DiveMode => self.divemode.map(FieldValue::DiveMode),
            FieldType::GasMixCount => Some(FieldValue::Count(self.ngasmixes)),
            FieldType::TankCount => Some(FieldValue::Count(self.tanks.len())),
            FieldType::GasMix(index) => {
                if index >= self.ngasmixes {
                    None
                } else {
                    self.gasmixes.get(index).copied().flatten().map(FieldValue::GasMix)
                }
            }
            FieldType::Tank(index) => self.tanks.get(index).copied().map(FieldValue::Tank),
            FieldType::String(index) => {
                self.strings.get(index).map(|(desc, value)| FieldValue::String {
                    desc: desc.clone(),
                    value: value.clone(),
                })
            }
        }
        .ok_or(DivestreamError::Unsupported)
    }

    pub(crate) fn set_divetime(&mut self, seconds: u32) {
        self.divetime = Some(seconds);
    }

    pub(crate) fn set_maxdepth(&mut self, meters: f64) {
        self.maxdepth = Some(meters);
    }

    pub(crate) fn set_avgdepth(&mut self, meters: f64) {
        self.avgdepth = Some(meters);
    }

    pub(crate) fn set_atmospheric(&mut self, bar: f64) {
        self.atmospheric = Some(bar);
    }

    pub(crate) fn set_salinity(&mut self, salinity: Salinity) {
        self.salinity = Some(salinity);
    }

    pub(crate) fn set_divemode(&mut self, mode: DiveMode) {
        self.divemode = Some(mode);
    }

    /// Install a gas mix at `index`, raising the mix count to cover it.
    pub(crate) fn assign_gasmix(&mut self, index: usize, mix: GasMix) -> Result<()> {
        if index >= MAX_GASES {
            return Err(DivestreamError::InvalidArgs("gas mix index out of range"));
        }
        if self.gasmixes.len() <= index {
            self.gasmixes.resize(index + 1, None);
        }
        self.gasmixes[index] = Some(mix);
        self.ngasmixes = self.ngasmixes.max(index + 1);
        Ok(())
    }

    pub(crate) fn gasmix_count(&self) -> usize {
        self.ngasmixes
    }

    pub(crate) fn add_tank(&mut self, tank: Tank) -> usize {
        self.tanks.push(tank);
        self.tanks.len() - 1
    }

    pub(crate) fn tank_mut(&mut self, index: usize) -> Option<&mut Tank> {
        self.tanks.get_mut(index)
    }

    /// Position of the tank bound to a pressure transmitter.
    pub(crate) fn tank_by_sensor(&self, sensor: u32) -> Option<usize> {
        self.tanks.iter().position(|tank| tank.sensor == sensor)
    }

    /// Append an owned `(description, value)` string pair.
    pub(crate) fn add_string(&mut self, desc: &str, value: impl Into<String>) {
        self.strings.push((desc.to_owned(), value.into()));
    }
}
