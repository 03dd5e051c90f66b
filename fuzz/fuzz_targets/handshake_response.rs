//! Fuzz target for the second Noise handshake message
//!
//! The device controls this message entirely; reading it must fail
//! cleanly rather than panic.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use thp_crypto::noise::HandshakeState;
use thp_crypto::x25519::PrivateKey;

#[derive(Debug, Arbitrary)]
struct HandshakeInput {
    prologue: Vec<u8>,
    static_key: [u8; 32],
    response: Vec<u8>,
}

fuzz_target!(|input: HandshakeInput| {
    let mut handshake =
        HandshakeState::initiator(&input.prologue, PrivateKey::from_bytes(input.static_key));
    if handshake.write_init(&[0]).is_err() {
        return;
    }
    if handshake.read_response(&input.response).is_ok() {
        let _ = handshake.remote_keys();
    }
});
