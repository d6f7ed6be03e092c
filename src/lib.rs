//! A library for downloading and decoding dive computer logs.
//!
//! Dive computers speak wildly different wire protocols and store their logs
//! in manufacturer-specific binary or text formats.  This crate puts a uniform
//! capability contract over that family: a [`device::Device`] drives an
//! already-connected transport, enumerates dives newest-first with
//! fingerprint-based incremental sync, and hands each dive's raw bytes to the
//! caller; a [`parser::Parser`] then decodes one dive into normalized summary
//! fields and a stream of per-sample values (depth, temperature, gas mix,
//! deco state, tank pressure, events).
//!
//! The most intricate backend is the Garmin Descent family, whose FIT logs
//! are a self-describing binary format with dynamically installed record
//! layouts; see the [`garmin`] module.  The remaining backends illustrate the
//! protocol families the framework has to absorb: line-oriented ASCII
//! ([`oceans`]), checksummed binary packets ([`mclean`], [`deepblu`],
//! [`scubapro`]), and whole-memory dumps split into dives after the fact
//! ([`shearwater`]).
//!
//! The crate performs no I/O of its own beyond the filesystem ingress used by
//! the Garmin backend: callers supply a [`transport::Transport`]
//! implementation for whatever serial, USB-HID, or BLE plumbing their
//! platform provides.
//!
//! ```no_run
//! use divestream::garmin::{FitParser, GarminDevice};
//! use divestream::{Device, FieldType, Parser};
//!
//! # fn main() -> divestream::Result<()> {
//! let mut device = GarminDevice::open("/media/DESCENT", None)?;
//! let mut dives: Vec<Vec<u8>> = Vec::new();
//! device.foreach(&mut |dive, _fingerprint| {
//!     dives.push(dive.to_vec());
//!     true
//! })?;
//!
//! for dive in &dives {
//!     let mut parser = FitParser::new();
//!     parser.set_data(dive)?;
//!     if let Ok(depth) = parser.field(FieldType::MaxDepth) {
//!         println!("max depth: {depth:?}");
//!     }
//!     parser.samples_foreach(&mut |sample| println!("{sample:?}"))?;
//! }
//! # Ok(())
//! # }
//! ```

mod bytes;
pub mod deepblu;
pub mod device;
pub mod event;
pub mod fields;
pub mod garmin;
pub mod mclean;
pub mod oceans;
pub mod parser;
pub mod scubapro;
pub mod shearwater;
pub mod testonly;
pub mod transport;

use thiserror::Error;

pub use crate::device::{Cancel, Device, DiveCallback};
pub use crate::event::{Event, EventSink};
pub use crate::fields::{
    DiveMode, FieldCache, FieldType, FieldValue, GasMix, Salinity, Tank, WaterKind,
};
pub use crate::parser::{DecoKind, DiveDateTime, Parser, Sample, Severity};

/// An error from a device or parser operation.
///
/// The set is closed and shared by every backend; errors propagate up the
/// call stack unchanged so that a caller can always tell a transport failure
/// from a protocol violation from malformed dive data.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DivestreamError {
    /// The operation or field is not implemented for this backend.
    #[error("operation or field not supported by this backend")]
    Unsupported,
    #[error("invalid argument: {0}")]
    InvalidArgs(&'static str),
    #[error("no device present")]
    NoDevice,
    #[error("device access denied")]
    NoAccess,
    /// Transport failure or malformed incoming bytes.
    #[error("I/O error: {0}")]
    Io(String),
    #[error("transport timeout")]
    Timeout,
    /// Checksum mismatch, unexpected opcode, or framing violation.
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("operation cancelled")]
    Cancelled,
    /// Transport-level negative acknowledgement.
    #[error("device rejected the request")]
    Nack,
    #[error("malformed dive data: {0}")]
    DataFormat(String),
}

impl DivestreamError {
    pub(crate) fn io(message: impl Into<String>) -> Self {
        DivestreamError::Io(message.into())
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        DivestreamError::Protocol(message.into())
    }

    pub(crate) fn data(message: impl Into<String>) -> Self {
        DivestreamError::DataFormat(message.into())
    }
}

impl From<std::io::Error> for DivestreamError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                DivestreamError::Timeout
            }
            std::io::ErrorKind::NotFound => DivestreamError::NoDevice,
            std::io::ErrorKind::PermissionDenied => DivestreamError::NoAccess,
            _ => DivestreamError::Io(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DivestreamError>;
