//! # THP Crypto
//!
//! Cryptographic primitives for the Trezor Host Protocol.
//!
//! This crate provides:
//! - `Noise_XX_25519_AESGCM_SHA256` handshake (initiator, plus the
//!   symmetric-state building blocks for a responder)
//! - `AES-256-GCM` cipher state with Noise counter nonces
//! - CPace host keys for code-entry pairing
//! - Static key masking used to match stored credentials
//! - Secure random number generation
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Exchange | X25519 | 128-bit |
//! | AEAD | AES-256-GCM | 256-bit key |
//! | Hash | SHA-256 | 128-bit collision |
//! | KDF | HKDF-SHA256 | 128-bit |
//! | PAKE | CPace (X25519, Elligator2, SHA-512) | 128-bit |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod constant_time;
pub mod cpace;
pub mod error;
pub mod hash;
pub mod noise;
pub mod random;
pub mod x25519;

pub use error::CryptoError;

/// X25519 public key size
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// X25519 secret key size
pub const X25519_SECRET_KEY_SIZE: usize = 32;

/// SHA-256 output size
pub const SHA256_OUTPUT_SIZE: usize = 32;

/// Scalar that masks a device static key for one handshake:
/// `SHA-256(static_pubkey || ephemeral_pubkey)`.
#[must_use]
pub fn static_key_mask(static_pubkey: &[u8; 32], ephemeral_pubkey: &[u8; 32]) -> [u8; 32] {
    hash::sha256_parts(&[static_pubkey, ephemeral_pubkey])
}

/// Masked form of a device static public key as revealed in handshake
/// message 2: `X25519(mask, static_pubkey)`.
#[must_use]
pub fn mask_static_pubkey(static_pubkey: &[u8; 32], ephemeral_pubkey: &[u8; 32]) -> [u8; 32] {
    let mask = static_key_mask(static_pubkey, ephemeral_pubkey);
    x25519::multiply(&mask, static_pubkey)
}
