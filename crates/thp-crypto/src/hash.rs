//! SHA-256 hashing and HKDF key derivation.
//!
//! Provides:
//! - One-shot and multi-part SHA-256
//! - The two-output HKDF used by the Noise `MixKey` / `Split` operations

use crate::CryptoError;
use hkdf::Hkdf;
use sha2::{Digest as _, Sha256};

/// SHA-256 hash output (32 bytes).
pub type Digest = [u8; 32];

/// Compute SHA-256 of input data.
#[must_use]
pub fn sha256(data: &[u8]) -> Digest {
    Sha256::digest(data).into()
}

/// Compute SHA-256 over the concatenation of `parts` without allocating.
#[must_use]
pub fn sha256_parts(parts: &[&[u8]]) -> Digest {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Noise `HKDF(chaining_key, input_key_material, 2)`.
///
/// Noise defines its HKDF with HMAC-SHA256 directly; with an empty `info`
/// this is exactly RFC 5869 extract-then-expand with the chaining key as
/// salt, producing two 32-byte outputs.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivationFailed`] if expansion fails.
pub fn hkdf2(chaining_key: &[u8; 32], ikm: &[u8]) -> Result<(Digest, Digest), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(chaining_key), ikm);
    let mut okm = [0u8; 64];
    hk.expand(&[], &mut okm)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;

    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&okm[..32]);
    second.copy_from_slice(&okm[32..]);
    Ok((first, second))
}
