//! Test fixtures.

mod device;
mod responder;

pub use device::{DeviceOptions, DeviceTransport, Faults, IssuedCredential, SimulatedDevice};
pub use responder::NoiseResponder;
