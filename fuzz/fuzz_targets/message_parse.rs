//! Fuzz target for message reassembly
//!
//! Feeds arbitrary bytes as 64-byte chunks through the reassembler.

#![no_main]

use libfuzzer_sys::fuzz_target;
use thp_core::{Message, Reassembler};

fuzz_target!(|data: &[u8]| {
    let mut chunks = data.chunks(64);
    let Some(first) = chunks.next() else {
        return;
    };
    if let Ok(mut reassembler) = Reassembler::start(first) {
        for chunk in chunks {
            if reassembler.is_complete() || reassembler.push(chunk).is_err() {
                break;
            }
        }
        if let Ok(message) = reassembler.finish() {
            // a message that parsed must serialize again
            let _ = message.chunks(64);
        }
    }

    if data.len() >= 3 {
        let _ = Message::parse(data[0], u16::from_be_bytes([data[1], data[2]]), &data[3..]);
    }
});
