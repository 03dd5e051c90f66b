//! Fuzz test for channel configuration parsing
//!
//! Tests that arbitrary TOML input doesn't cause panics when parsed as a
//! channel configuration.

#![no_main]

use libfuzzer_sys::fuzz_target;
use thp_core::ChannelConfig;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        // durations are float seconds; negative or huge values must be rejected
        if let Ok(config) = toml::from_str::<ChannelConfig>(s) {
            let _ = config.validate();
            let _ = config.backoff();
        }
    }
});
