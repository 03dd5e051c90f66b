//! Fuzz target for device-supplied protobuf messages
//!
//! Device properties arrive before any authentication, so their decoding
//! sees attacker-controlled bytes.

#![no_main]

use libfuzzer_sys::fuzz_target;
use prost::Message as _;
use thp_core::messages::{DeviceProperties, Failure};
use thp_core::session::Envelope;

fuzz_target!(|data: &[u8]| {
    let _ = DeviceProperties::decode(data);

    if let Ok(envelope) = Envelope::decode(data) {
        let _ = Failure::decode(envelope.payload.as_slice());
    }
});
