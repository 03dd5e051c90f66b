//! `AES-256-GCM` cipher state.
//!
//! A [`CipherState`] is the Noise object of the same name: an optional
//! 256-bit key plus a 64-bit counter nonce. The 96-bit AES-GCM nonce is
//! four zero bytes followed by the counter in big-endian order, as the
//! Noise `AESGCM` cipher function prescribes.
//!
//! Without a key, encryption and decryption pass data through unchanged;
//! the handshake relies on this for its first message.

use crate::CryptoError;
use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Authentication tag size (16 bytes / 128 bits).
pub const TAG_SIZE: usize = 16;

/// AEAD key size (32 bytes / 256 bits).
pub const KEY_SIZE: usize = 32;

/// Noise cipher state: key and counter nonce.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct CipherState {
    key: Option<[u8; KEY_SIZE]>,
    nonce: u64,
}

impl CipherState {
    /// Create a cipher state with a key and a zero nonce.
    #[must_use]
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self {
            key: Some(key),
            nonce: 0,
        }
    }

    /// Create a keyless cipher state.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Replace the key and reset the nonce.
    pub fn initialize_key(&mut self, key: [u8; KEY_SIZE]) {
        self.key = Some(key);
        self.nonce = 0;
    }

    /// Whether a key has been set.
    #[must_use]
    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// Current counter value.
    #[must_use]
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    fn nonce_bytes(&self) -> [u8; 12] {
        let mut bytes = [0u8; 12];
        bytes[4..].copy_from_slice(&self.nonce.to_be_bytes());
        bytes
    }

    fn advance(&mut self) -> Result<(), CryptoError> {
        // 2^64 - 1 is reserved by Noise
        if self.nonce == u64::MAX - 1 {
            return Err(CryptoError::NonceOverflow);
        }
        self.nonce += 1;
        Ok(())
    }

    /// Encrypt `plaintext`, authenticating `ad`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] on cipher failure or
    /// [`CryptoError::NonceOverflow`] once the counter is exhausted.
    pub fn encrypt_with_ad(&mut self, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let Some(key) = self.key else {
            return Ok(plaintext.to_vec());
        };

        let cipher = Aes256Gcm::new(&key.into());
        let nonce = self.nonce_bytes();
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: ad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;
        self.advance()?;
        Ok(ciphertext)
    }

    /// Decrypt `ciphertext` (ciphertext || tag), verifying `ad`.
    ///
    /// The nonce only advances on success.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] if authentication fails.
    pub fn decrypt_with_ad(&mut self, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let Some(key) = self.key else {
            return Ok(ciphertext.to_vec());
        };

        if ciphertext.len() < TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        let cipher = Aes256Gcm::new(&key.into());
        let nonce = self.nonce_bytes();
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: ad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;
        self.advance()?;
        Ok(plaintext)
    }
}
