//! Shearwater Predator/Petrel support: the device hands over one whole
//! memory dump, which is split into dives after the fact.
//!
//! The log is a stream of 32-byte records.  A dive opens with an
//! `FF FF FF FF` block carrying the start time, gas and mode, is followed by
//! one sample record every ten seconds, and closes with an `FF FF FF FE`
//! block carrying the duration and maximum depth.  Petrel logs additionally
//! terminate with an `FF FF FF FD` end-of-log block; Predator logs simply
//! stop, possibly mid-dive after a battery pull.  Depths are logged in
//! tenths of the configured display unit, with an imperial flag in the
//! opening block.

use chrono::DateTime;
use tracing::debug;

use crate::bytes;
use crate::fields::{DiveMode, FieldCache, FieldType, FieldValue, GasMix};
use crate::parser::{DecoKind, DiveDateTime, Parser, Sample, SampleCallback};
use crate::{DivestreamError, Result};

pub const FINGERPRINT_LEN: usize = 4;

const RECORD_LEN: usize = 32;
const SAMPLE_INTERVAL: u32 = 10;
const FEET_TO_METERS: f64 = 0.3048;

const MARKER_OPEN: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];
const MARKER_CLOSE: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFE];
const MARKER_FINAL: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFD];

const NDL_NONE: u8 = 0xFF;

/// Split a memory dump into per-dive byte ranges, newest first, matching
/// the enumeration order of the device contract.
pub fn split_dump(dump: &[u8]) -> Result<Vec<Vec<u8>>> {
    if dump.len() % RECORD_LEN != 0 {
        return Err(DivestreamError::data(format!(
            "dump length {} is not a whole number of records",
            dump.len()
        )));
    }

    let mut dives = Vec::new();
    let mut start = None;
    let mut offset = 0;
    while offset < dump.len() {
        let record = &dump[offset..offset + RECORD_LEN];
        if record[..4] == MARKER_FINAL {
            break;
        } else if record[..4] == MARKER_OPEN {
            if start.is_some() {
                debug!("opening block inside a dive at offset {offset}; resyncing");
            }
            start = Some(offset);
        } else if record[..4] == MARKER_CLOSE {
            if let Some(begin) = start.take() {
                dives.push(dump[begin..offset + RECORD_LEN].to_vec());
            } else {
                debug!("closing block with no open dive at offset {offset}");
            }
        }
        offset += RECORD_LEN;
    }
    // A Predator log that lost power mid-dive has no closing block; keep
    // what was recorded.
    if let Some(begin) = start {
        dives.push(dump[begin..offset.min(dump.len())].to_vec());
    }

    dives.reverse();
    Ok(dives)
}

/// The fingerprint of one split dive: its start-time bytes.
pub fn dive_fingerprint(dive: &[u8]) -> Option<&[u8]> {
    if dive.len() >= 8 && dive[..4] == MARKER_OPEN {
        Some(&dive[4..8])
    } else {
        None
    }
}

struct Opening {
    timestamp: u32,
    oxygen: u8,
    helium: u8,
    mode: u8,
    imperial: bool,
    surface_mbar: u16,
}

fn parse_opening(record: &[u8]) -> Opening {
    Opening {
        timestamp: bytes::u32_be(&record[4..8]),
        oxygen: record[8],
        helium: record[9],
        mode: record[10],
        imperial: record[11] & 0x01 != 0,
        surface_mbar: bytes::u16_be(&record[12..14]),
    }
}

/// Parser for one dive split out of a Predator/Petrel dump.
pub struct ShearwaterParser<'d> {
    data: Option<&'d [u8]>,
    cache: FieldCache,
    datetime: Option<DiveDateTime>,
    imperial: bool,
    closed_circuit: bool,
}

impl ShearwaterParser<'_> {
    pub fn new() -> Self {
        ShearwaterParser {
            data: None,
            cache: FieldCache::new(),
            datetime: None,
            imperial: false,
            closed_circuit: false,
        }
    }

    fn depth_meters(&self, tenths: u16) -> f64 {
        let value = tenths as f64 / 10.0;
        if self.imperial { value * FEET_TO_METERS } else { value }
    }
}

impl Default for ShearwaterParser<'_> {
    fn default() -> Self {
        ShearwaterParser::new()
    }
}

impl<'d> Parser<'d> for ShearwaterParser<'d> {
    fn set_data(&mut self, data: &'d [u8]) -> Result<()> {
        self.data = None;
        self.datetime = None;
        self.imperial = false;
        self.closed_circuit = false;
        self.cache.clear();

        if data.len() < RECORD_LEN || data.len() % RECORD_LEN != 0 {
            return Err(DivestreamError::data("dive is not a whole record stream"));
        }
        if data[..4] != MARKER_OPEN {
            return Err(DivestreamError::data("dive does not start with an opening block"));
        }

        let opening = parse_opening(&data[..RECORD_LEN]);
        let mut cache = FieldCache::new();
        cache.assign_gasmix(
            0,
            GasMix {
                helium: opening.helium as f64 / 100.0,
                oxygen: opening.oxygen as f64 / 100.0,
            },
        )?;
        let mode = match opening.mode {
            1 => DiveMode::ClosedCircuit,
            2 => DiveMode::Gauge,
            3 => DiveMode::Freedive,
            _ => DiveMode::OpenCircuit,
        };
        cache.set_divemode(mode);
        if opening.surface_mbar > 0 {
            cache.set_atmospheric(opening.surface_mbar as f64 / 1000.0);
        }
        self.imperial = opening.imperial;
        self.closed_circuit = mode == DiveMode::ClosedCircuit;
        self.datetime = DateTime::from_timestamp(opening.timestamp as i64, 0)
            .map(|utc| DiveDateTime::Local(utc.naive_utc()));

        // The closing block is the last record when present.
        let tail = &data[data.len() - RECORD_LEN..];
        if tail[..4] == MARKER_CLOSE {
            cache.set_divetime(bytes::u32_be(&tail[4..8]));
            let tenths = bytes::u16_be(&tail[8..10]);
            let depth = if self.imperial {
                tenths as f64 / 10.0 * FEET_TO_METERS
            } else {
                tenths as f64 / 10.0
            };
            cache.set_maxdepth(depth);
        } else {
            debug!("dive has no closing block; summary fields unavailable");
        }

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

        let mut time = 0u32;
        for record in data.chunks_exact(RECORD_LEN).skip(1) {
            if record[..4] == MARKER_CLOSE
                || record[..4] == MARKER_OPEN
                || record[..4] == MARKER_FINAL
            {
                continue;
            }

            time += SAMPLE_INTERVAL;
            callback(&Sample::Time(time));
            callback(&Sample::Depth(self.depth_meters(bytes::u16_be(&record[0..2]))));
            callback(&Sample::Temperature(record[2] as i8 as f64));

            let ndl = record[3];
            let ceiling = record[6];
            if ceiling > 0 {
                callback(&Sample::Deco {
                    kind: DecoKind::DecoStop,
                    time: 0,
                    depth: self.depth_meters(ceiling as u16 * 10),
                });
            } else if ndl != NDL_NONE {
                callback(&Sample::Deco {
                    kind: DecoKind::Ndl,
                    time: ndl as u32 * 60,
                    depth: 0.0,
                });
            }

            let tts = bytes::u16_be(&record[4..6]);
            if tts > 0 {
                callback(&Sample::Tts(tts as u32 * 60));
            }
            let setpoint = record[7];
            if self.closed_circuit && setpoint > 0 {
                callback(&Sample::Setpoint(setpoint as f64 / 100.0));
            }
            let ppo2 = record[8];
            if self.closed_circuit && ppo2 > 0 {
                callback(&Sample::Ppo2(ppo2 as f64 / 100.0));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(prefix: &[u8]) -> Vec<u8> {
        let mut out = prefix.to_vec();
        out.resize(RECORD_LEN, 0);
        out
    }

    fn opening(timestamp: u32, o2: u8, he: u8, mode: u8, imperial: bool) -> Vec<u8> {
        let mut out = MARKER_OPEN.to_vec();
        out.extend_from_slice(&timestamp.to_be_bytes());
        out.extend_from_slice(&[o2, he, mode, imperial as u8]);
        out.extend_from_slice(&1013u16.to_be_bytes()); // surface pressure, mbar
        record(&out)
    }

    fn closing(duration_s: u32, max_depth_tenths: u16) -> Vec<u8> {
        let mut out = MARKER_CLOSE.to_vec();
        out.extend_from_slice(&duration_s.to_be_bytes());
        out.extend_from_slice(&max_depth_tenths.to_be_bytes());
        record(&out)
    }

    fn sample(depth_tenths: u16, temp: i8, ndl: u8, tts: u16, ceiling: u8, sp: u8) -> Vec<u8> {
        let mut out = depth_tenths.to_be_bytes().to_vec();
        out.push(temp as u8);
        out.push(ndl);
        out.extend_from_slice(&tts.to_be_bytes());
        out.push(ceiling);
        out.push(sp);
        record(&out)
    }

    fn metric_dive() -> Vec<u8> {
        let mut dive = opening(1_600_000_000, 21, 0, 0, false);
        dive.extend(sample(155, 12, 99, 0, 0, 0));
        dive.extend(sample(310, 11, 45, 2, 0, 0));
        dive.extend(closing(620, 312));
        dive
    }

    #[test]
    fn split_returns_dives_newest_first() {
        let mut dump = metric_dive();
        let mut newer = opening(1_700_000_000, 32, 0, 0, false);
        newer.extend(closing(60, 100));
        dump.extend(newer.clone());
        dump.extend(record(&MARKER_FINAL));
        // Petrel end-of-log: anything after the final block is ignored.
        dump.extend(sample(9_999, 0, 0, 0, 0, 0));

        let dives = split_dump(&dump).unwrap();
        assert_eq!(dives.len(), 2);
        assert_eq!(dives[0], newer);
        assert_eq!(
            dive_fingerprint(&dives[0]).unwrap(),
            &1_700_000_000u32.to_be_bytes()
        );
    }

    #[test]
    fn predator_dump_without_closing_block_keeps_the_tail() {
        let mut dump = opening(1_600_000_000, 21, 0, 0, false);
        dump.extend(sample(100, 10, 99, 0, 0, 0));
        let dives = split_dump(&dump).unwrap();
        assert_eq!(dives.len(), 1);
        // Summary fields are unavailable, but the samples still decode.
        let mut parser = ShearwaterParser::new();
        parser.set_data(&dives[0]).unwrap();
        assert!(parser.field(FieldType::DiveTime).is_err());
        let mut depths = Vec::new();
        parser
            .samples_foreach(&mut |s| {
                if let Sample::Depth(d) = s {
                    depths.push(*d);
                }
            })
            .unwrap();
        assert_eq!(depths, vec![10.0]);
    }

    #[test]
    fn ragged_dump_is_data_format_error() {
        assert!(matches!(
            split_dump(&[0u8; RECORD_LEN + 1]),
            Err(DivestreamError::DataFormat(_))
        ));
    }

    #[test]
    fn summary_fields_decode_from_the_blocks() {
        let dive = metric_dive();
        let mut parser = ShearwaterParser::new();
        parser.set_data(&dive).unwrap();
        assert_eq!(
            parser.field(FieldType::DiveTime).unwrap(),
            FieldValue::DiveTime(620)
        );
        assert_eq!(
            parser.field(FieldType::MaxDepth).unwrap(),
            FieldValue::Depth(31.2)
        );
        assert_eq!(
            parser.field(FieldType::Atmospheric).unwrap(),
            FieldValue::Atmospheric(1.013)
        );
        let FieldValue::GasMix(mix) = parser.field(FieldType::GasMix(0)).unwrap() else {
            panic!("expected a gas mix");
        };
        assert_eq!(mix.oxygen, 0.21);
        assert!(matches!(parser.datetime(), Ok(DiveDateTime::Local(_))));
    }

    #[test]
    fn samples_carry_deco_state() {
        let dive = metric_dive();
        let mut parser = ShearwaterParser::new();
        parser.set_data(&dive).unwrap();
        let mut samples = Vec::new();
        parser
            .samples_foreach(&mut |s| samples.push(s.clone()))
            .unwrap();
        assert_eq!(
            samples,
            vec![
                Sample::Time(10),
                Sample::Depth(15.5),
                Sample::Temperature(12.0),
                Sample::Deco { kind: DecoKind::Ndl, time: 99 * 60, depth: 0.0 },
                Sample::Time(20),
                Sample::Depth(31.0),
                Sample::Temperature(11.0),
                Sample::Deco { kind: DecoKind::Ndl, time: 45 * 60, depth: 0.0 },
                Sample::Tts(120),
            ]
        );
    }

    #[test]
    fn imperial_depths_convert_to_meters() {
        let mut dive = opening(1_600_000_000, 18, 45, 1, true);
        let mut deep = sample(1_000, 8, NDL_NONE, 0, 20, 130);
        deep[8] = 110; // measured ppO2, cbar
        dive.extend(deep);
        dive.extend(closing(300, 1_000));
        let mut parser = ShearwaterParser::new();
        parser.set_data(&dive).unwrap();

        assert_eq!(
            parser.field(FieldType::MaxDepth).unwrap(),
            FieldValue::Depth(100.0 * FEET_TO_METERS)
        );
        let mut samples = Vec::new();
        parser
            .samples_foreach(&mut |s| samples.push(s.clone()))
            .unwrap();
        assert!(samples.contains(&Sample::Depth(100.0 * FEET_TO_METERS)));
        assert!(samples.contains(&Sample::Deco {
            kind: DecoKind::DecoStop,
            time: 0,
            depth: 20.0 * FEET_TO_METERS,
        }));
        // Setpoint and ppO2 are reported because the opening block flagged
        // CC mode.
        assert!(samples.contains(&Sample::Setpoint(1.3)));
        assert!(samples.contains(&Sample::Ppo2(1.1)));
    }
}
