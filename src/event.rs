//! Typed progress and status events emitted while a device is being driven.
//!
//! A sink is installed when a device is opened; every emission is synchronous
//! and fire-and-forget.  The payload is only valid for the duration of the
//! call.

use chrono::{DateTime, Utc};

/// An event delivered to the caller's sink during a device operation.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Event<'a> {
    /// Download progress.  `maximum` is a dive count or byte budget; it may
    /// grow across emissions when the budget is only discovered during the
    /// transfer.
    Progress { current: u32, maximum: u32 },
    /// Identity of the connected device, reported once per session when the
    /// backend learns it.
    Devinfo {
        model: u32,
        firmware: u32,
        serial: u32,
    },
    /// A clock correlation point: the host time at which the device reported
    /// `devtime` (device-native seconds).
    Clock {
        systime: DateTime<Utc>,
        devtime: u32,
    },
    /// Backend-specific bytes surfaced for diagnostics.
    Vendor(&'a [u8]),
}

/// The caller-supplied event sink.  Stored for the lifetime of a device
/// handle; never retains the payload after the call returns.
pub type EventSink = Box<dyn FnMut(&Event<'_>)>;
