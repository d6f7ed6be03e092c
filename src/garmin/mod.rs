//! Garmin Descent support: USB-storage ingress plus the FIT log decoder.

mod device;
mod parser;
mod profile;

pub use device::GarminDevice;
pub use parser::{FINGERPRINT_LEN, FitParser};
