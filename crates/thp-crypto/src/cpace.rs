//! CPace password-authenticated key exchange (host side).
//!
//! Code-entry pairing binds the six-digit code shown on the device to a
//! Diffie-Hellman exchange:
//!
//! ```text
//! pregenerator = SHA-512(lv("CPace255") || lv(code) || zpad || lv(handshake_hash) || lv(""))[..32]
//! generator    = Elligator2(pregenerator)
//! public_key   = X25519(private_key, generator)
//! shared       = X25519(private_key, peer_public_key)
//! tag          = SHA-256(shared)
//! ```
//!
//! The code is encoded as six big-endian bytes of its integer value.
//!
//! ## Implementation
//!
//! The Elligator2 forward map comes from the `curve25519-elligator2` crate.
//! The forward map accepts any 32-byte input.

use crate::x25519::{self, PrivateKey};
use crate::{CryptoError, hash};
use curve25519_elligator2::MontgomeryPoint;
use curve25519_elligator2::elligator2::Randomized;
use sha2::{Digest as _, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Domain separation identifier, length-prefixed.
const DSI: &[u8] = b"\x08CPace255";

/// Zero padding filling the first SHA-512 block.
const ZPAD_LEN: usize = 113;

/// Encoded length of a pairing code.
pub const CODE_LEN: usize = 6;

/// Encode a numeric pairing code as six big-endian bytes.
#[must_use]
pub fn encode_code(code: u32) -> [u8; CODE_LEN] {
    let bytes = u64::from(code).to_be_bytes();
    let mut out = [0u8; CODE_LEN];
    out.copy_from_slice(&bytes[8 - CODE_LEN..]);
    out
}

/// Compute the CPace generator for `code` bound to `handshake_hash`.
///
/// # Errors
///
/// Returns [`CryptoError::NotMappable`] if the map to the curve fails.
pub fn generator(code: u32, handshake_hash: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
    let mut hasher = Sha512::new();
    hasher.update(DSI);
    hasher.update([CODE_LEN as u8]);
    hasher.update(encode_code(code));
    hasher.update([0u8; ZPAD_LEN]);
    hasher.update([handshake_hash.len() as u8]);
    hasher.update(handshake_hash);
    hasher.update([0u8]);
    let digest = hasher.finalize();

    let mut pregenerator = [0u8; 32];
    pregenerator.copy_from_slice(&digest[..32]);

    let point: Option<MontgomeryPoint> =
        MontgomeryPoint::from_representative::<Randomized>(&pregenerator);
    pregenerator.zeroize();
    point.map(|p| p.to_bytes()).ok_or(CryptoError::NotMappable)
}

/// Host CPace keypair for one pairing attempt.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct CpaceKeys {
    private_key: [u8; 32],
    #[zeroize(skip)]
    public_key: [u8; 32],
}

impl CpaceKeys {
    /// Generate a fresh keypair over the generator for `code`.
    ///
    /// # Errors
    ///
    /// Fails if randomness is unavailable or the generator cannot be mapped.
    pub fn generate(code: u32, handshake_hash: &[u8; 32]) -> Result<Self, CryptoError> {
        let generator = generator(code, handshake_hash)?;
        let private_key = PrivateKey::random()?.to_bytes();
        let public_key = x25519::multiply(&private_key, &generator);
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Public key to send to the peer.
    #[must_use]
    pub fn public_key(&self) -> [u8; 32] {
        self.public_key
    }

    /// Shared secret with the peer's CPace public key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] for a degenerate result.
    pub fn shared_secret(&self, peer_public_key: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
        let shared = x25519::multiply(&self.private_key, peer_public_key);
        if shared == [0u8; 32] {
            return Err(CryptoError::InvalidPublicKey);
        }
        Ok(shared)
    }
}

/// Tag proving knowledge of the CPace shared secret.
#[must_use]
pub fn tag(shared_secret: &[u8; 32]) -> [u8; 32] {
    hash::sha256(shared_secret)
}
