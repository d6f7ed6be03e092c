//! The device capability: drive a transport, enumerate dives newest-first.
//!
//! Every backend embeds a [`DeviceBase`] carrying the pieces the contract
//! shares across vendors: the fingerprint used for incremental sync, the
//! cancellation flag, the event sink, and the open/closed lifecycle bit.
//! The transport itself lives on the backend struct since its concrete
//! capability (byte stream, packet stream, filesystem) varies per vendor.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};

use crate::event::{Event, EventSink};
use crate::{DivestreamError, Result};

/// Per-dive callback for [`Device::foreach`].
///
/// Receives `(dive_bytes, fingerprint_bytes)`, both borrowed for the duration
/// of the call.  Returning `false` halts enumeration.
pub type DiveCallback<'a> = &'a mut dyn FnMut(&[u8], &[u8]) -> bool;

/// A cloneable cancellation handle.
///
/// Setting it does not interrupt an in-flight transport read; the flag is
/// observed at transport boundaries and between dives, so latency is bounded
/// by the transport timeout.
#[derive(Clone, Debug, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    pub fn new() -> Self {
        Cancel::default()
    }

    /// Request cancellation of the operation in progress.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Uniform download contract over the per-vendor wire protocols.
pub trait Device {
    /// Store the incremental-sync anchor.  An empty slice clears it; any
    /// other length must match the backend's fingerprint width.
    fn set_fingerprint(&mut self, fingerprint: &[u8]) -> Result<()>;

    /// Read the device's full memory into `out`, emitting progress events.
    fn dump(&mut self, out: &mut Vec<u8>) -> Result<()>;

    /// Enumerate dives newest-first.  Stops early when the callback returns
    /// `false`, when a dive's fingerprint matches the stored anchor (that
    /// dive and everything older is skipped), or on cancellation.
    fn foreach(&mut self, callback: DiveCallback<'_>) -> Result<()>;

    /// Set the device clock.
    fn timesync(&mut self, time: DateTime<Utc>) -> Result<()>;

    /// Release the transport.  Valid exactly once; all operations on a
    /// closed device fail with `InvalidArgs`.
    fn close(&mut self) -> Result<()>;

    /// A handle for cancelling the operation in progress.
    fn cancel_handle(&self) -> Cancel;
}

/// State shared by every backend.
pub(crate) struct DeviceBase {
    fingerprint: Vec<u8>,
    fingerprint_width: usize,
    cancel: Cancel,
    sink: Option<EventSink>,
    open: bool,
}

impl std::fmt::Debug for DeviceBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBase")
            .field("fingerprint", &self.fingerprint)
            .field("open", &self.open)
            .finish_non_exhaustive()
    }
}

impl DeviceBase {
    pub(crate) fn new(fingerprint_width: usize, sink: Option<EventSink>) -> Self {
        DeviceBase {
            fingerprint: Vec::new(),
            fingerprint_width,
            cancel: Cancel::new(),
            sink,
            open: true,
        }
    }

    pub(crate) fn set_fingerprint(&mut self, fingerprint: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if !fingerprint.is_empty() && fingerprint.len() != self.fingerprint_width {
            return Err(DivestreamError::InvalidArgs("fingerprint width mismatch"));
        }
        self.fingerprint.clear();
        self.fingerprint.extend_from_slice(fingerprint);
        Ok(())
    }

    /// True when `candidate` matches the stored anchor, i.e. enumeration
    /// should stop before delivering the dive that carries it.
    pub(crate) fn fingerprint_matches(&self, candidate: &[u8]) -> bool {
        !self.fingerprint.is_empty() && self.fingerprint == candidate
    }

    pub(crate) fn cancel_handle(&self) -> Cancel {
        self.cancel.clone()
    }

    /// Convert a pending cancellation request into an error.
    pub(crate) fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(DivestreamError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub(crate) fn emit(&mut self, event: &Event<'_>) {
        if let Some(sink) = self.sink.as_mut() {
            sink(event);
        }
    }

    pub(crate) fn emit_progress(&mut self, current: u32, maximum: u32) {
        self.emit(&Event::Progress { current, maximum });
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(DivestreamError::InvalidArgs("device is closed"))
        }
    }

    /// Flip to the terminal state.  Errors if already closed.
    pub(crate) fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.open = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_width_enforced() {
        let mut base = DeviceBase::new(4, None);
        assert!(base.set_fingerprint(&[1, 2, 3]).is_err());
        assert!(base.set_fingerprint(&[1, 2, 3, 4]).is_ok());
        assert!(base.fingerprint_matches(&[1, 2, 3, 4]));
        assert!(!base.fingerprint_matches(&[1, 2, 3, 5]));
        // Clearing is always allowed, and a cleared anchor matches nothing.
        assert!(base.set_fingerprint(&[]).is_ok());
        assert!(!base.fingerprint_matches(&[]));
    }

    #[test]
    fn cancel_is_sticky_and_shared() {
        let base = DeviceBase::new(4, None);
        let handle = base.cancel_handle();
        assert!(base.check_cancelled().is_ok());
        handle.cancel();
        assert!(matches!(
            base.check_cancelled(),
            Err(DivestreamError::Cancelled)
        ));
    }

    #[test]
    fn close_is_terminal() {
        let mut base = DeviceBase::new(4, None);
        assert!(base.close().is_ok());
        assert!(base.close().is_err());
        assert!(base.set_fingerprint(&[1, 2, 3, 4]).is_err());
    }
}
