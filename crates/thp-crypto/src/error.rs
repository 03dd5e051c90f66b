//! Errors of the THP cryptographic layer.

use thiserror::Error;

/// Failure of a handshake, cipher or key operation.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AES-GCM refused to seal the message
    #[error("AES-GCM encryption failed")]
    EncryptionFailed,

    /// Tag did not verify: wrong key, wrong nonce or tampered ciphertext
    #[error("AES-GCM tag mismatch")]
    DecryptionFailed,

    /// Key material of the wrong size
    #[error("key must be {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Required size
        expected: usize,
        /// Size supplied
        actual: usize,
    },

    /// Noise message malformed, truncated or out of order
    #[error("Noise handshake: {0}")]
    Handshake(String),

    /// HKDF output length rejected
    #[error("HKDF expansion failed")]
    KeyDerivationFailed,

    /// Elligator2 could not map the CPace generator input
    #[error("CPace generator input is not mappable")]
    NotMappable,

    /// OS randomness unavailable
    #[error("system randomness unavailable")]
    RandomFailed,

    /// 64-bit cipher nonce exhausted
    #[error("cipher nonce exhausted")]
    NonceOverflow,

    /// Peer key yields an all-zero shared secret
    #[error("low-order X25519 public key")]
    InvalidPublicKey,
}
