//! X25519 keys for the Noise handshake (RFC 7748).
//!
//! The host keeps one static key per credential and a fresh ephemeral key per
//! handshake. Private keys and shared secrets are zeroized on drop, and an
//! exchange with a low-order peer point is refused.
//!
//! [`multiply`] is the raw X25519 function. The device static key masking
//! and CPace both multiply by a hash output rather than a stored key.

use crate::{CryptoError, X25519_PUBLIC_KEY_SIZE, random};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Static or ephemeral private key.
#[derive(Clone, ZeroizeOnDrop, Zeroize)]
pub struct PrivateKey(x25519_dalek::StaticSecret);

/// Public key as sent in handshake messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey(x25519_dalek::PublicKey);

/// Diffie-Hellman output, mixed into the Noise chaining key.
#[derive(ZeroizeOnDrop, Zeroize)]
pub struct SharedSecret(x25519_dalek::SharedSecret);

impl PrivateKey {
    /// Fresh key from the OS CSPRNG.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if no randomness is available.
    pub fn random() -> Result<Self, CryptoError> {
        let mut bytes: [u8; 32] = random::random_array()?;
        let key = Self::from_bytes(bytes);
        bytes.zeroize();
        Ok(key)
    }

    /// Matching public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.0))
    }

    /// DH with `peer`, or `None` for a low-order point.
    #[must_use]
    pub fn exchange(&self, peer: &PublicKey) -> Option<SharedSecret> {
        let shared = self.0.diffie_hellman(&peer.0);
        shared.was_contributory().then_some(SharedSecret(shared))
    }

    /// Raw key bytes, as stored in a credential.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Key from stored bytes. Clamping happens on use.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::StaticSecret::from(bytes))
    }
}

impl PublicKey {
    /// Wire bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        *self.0.as_bytes()
    }

    /// Key from wire bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::PublicKey::from(bytes))
    }

    /// Key from a handshake field that must be exactly 32 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] otherwise.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 32] = slice.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: X25519_PUBLIC_KEY_SIZE,
            actual: slice.len(),
        })?;
        Ok(Self::from_bytes(bytes))
    }

    /// Borrowed wire bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl SharedSecret {
    /// Secret bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

/// X25519(`scalar`, `u`) with the scalar clamped.
#[must_use]
pub fn multiply(scalar: &[u8; 32], u: &[u8; 32]) -> [u8; 32] {
    x25519_dalek::x25519(*scalar, *u)
}
