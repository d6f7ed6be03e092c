//! Garmin Descent ingress over USB mass storage (or an MTP mount).
//!
//! The watch exposes finished dives as `Garmin/Activity/*.fit` files named
//! `YYYY-MM-DD-HH-MM-SS.fit`.  The zero-padded 24-byte filename doubles as
//! the dive fingerprint, and reverse lexicographic order over the names is
//! newest-first chronological order.  Each dive delivered to the callback is
//! the fingerprint followed by the file's bytes, which is exactly the input
//! shape [`super::FitParser`] expects.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::debug;
use walkdir::WalkDir;

use super::parser::FINGERPRINT_LEN;
use crate::device::{Cancel, Device, DeviceBase, DiveCallback};
use crate::event::EventSink;
use crate::{DivestreamError, Result};

pub struct GarminDevice {
    base: DeviceBase,
    activity_dir: PathBuf,
}

impl GarminDevice {
    /// Open a device at its mount root.  Fails with `NoDevice` when the
    /// mount does not look like a Garmin watch.
    pub fn open(root: impl Into<PathBuf>, sink: Option<EventSink>) -> Result<Self> {
        let activity_dir = root.into().join("Garmin").join("Activity");
        if !activity_dir.is_dir() {
            return Err(DivestreamError::NoDevice);
        }
        Ok(GarminDevice {
            base: DeviceBase::new(FINGERPRINT_LEN, sink),
            activity_dir,
        })
    }

    /// Activity filenames, newest first.
    fn activity_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in WalkDir::new(&self.activity_dir).max_depth(1) {
            let entry = entry.map_err(|err| DivestreamError::io(err.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.to_ascii_lowercase().ends_with(".fit") {
                names.push(name);
            }
        }
        // Reverse string comparison on the date-shaped names.
        names.sort_by(|a, b| b.cmp(a));
        Ok(names)
    }

    fn fingerprint_for(name: &str) -> Vec<u8> {
        let mut fingerprint = name.as_bytes().to_vec();
        fingerprint.truncate(FINGERPRINT_LEN);
        fingerprint.resize(FINGERPRINT_LEN, 0);
        fingerprint
    }
}

impl Device for GarminDevice {
    fn set_fingerprint(&mut self, fingerprint: &[u8]) -> Result<()> {
        self.base.set_fingerprint(fingerprint)
    }

    fn dump(&mut self, _out: &mut Vec<u8>) -> Result<()> {
        // There is no single memory image behind a filesystem ingress.
        self.base.ensure_open()?;
        Err(DivestreamError::Unsupported)
    }

    fn foreach(&mut self, callback: DiveCallback<'_>) -> Result<()> {
        self.base.ensure_open()?;
        let names = self.activity_names()?;
        let maximum = names.len() as u32;
        self.base.emit_progress(0, maximum);

        for (index, name) in names.iter().enumerate() {
            self.base.check_cancelled()?;
            let fingerprint = Self::fingerprint_for(name);
            if self.base.fingerprint_matches(&fingerprint) {
                debug!("fingerprint match at {name}; stopping enumeration");
                break;
            }

            let path = self.activity_dir.join(name);
            let contents = std::fs::read(&path)?;
            let mut dive = fingerprint.clone();
            dive.extend_from_slice(&contents);

            let keep_going = callback(&dive, &fingerprint);
            self.base.emit_progress(index as u32 + 1, maximum);
            if !keep_going {
                break;
            }
        }
        Ok(())
    }

    fn timesync(&mut self, _time: DateTime<Utc>) -> Result<()> {
        self.base.ensure_open()?;
        Err(DivestreamError::Unsupported)
    }

    fn close(&mut self) -> Result<()> {
        self.base.close()
    }

    fn cancel_handle(&self) -> Cancel {
        self.base.cancel_handle()
    }
}
