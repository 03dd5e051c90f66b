//! `Noise_XX_25519_AESGCM_SHA256` handshake.
//!
//! THP runs the XX pattern with the host as initiator:
//!
//! ```text
//! -> e                 (payload: unlock flag)
//! <- e, ee, s, es      (device static key arrives masked)
//! -> s, se             (payload: optional pairing credential)
//! ```
//!
//! The handshake is implemented directly on [`SymmetricState`] instead of
//! through a generic Noise library because the host must inspect the
//! device's ephemeral and masked static keys after the second message and
//! may swap its own static key before the third, depending on which stored
//! credential matches. [`SymmetricState`] is public so a responder can be
//! assembled from the same building blocks.

use crate::aead::{CipherState, TAG_SIZE};
use crate::hash::{self, Digest};
use crate::x25519::{PrivateKey, PublicKey};
use crate::{CryptoError, X25519_PUBLIC_KEY_SIZE};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Full Noise protocol name.
pub const PROTOCOL_NAME: &[u8] = b"Noise_XX_25519_AESGCM_SHA256";

/// Length of the encrypted static key carried in messages 2 and 3.
pub const ENCRYPTED_STATIC_SIZE: usize = X25519_PUBLIC_KEY_SIZE + TAG_SIZE;

/// Noise symmetric state: chaining key, handshake hash and cipher state.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricState {
    ck: [u8; 32],
    h: [u8; 32],
    cipher: CipherState,
}

impl SymmetricState {
    /// `InitializeSymmetric(protocol_name)`.
    #[must_use]
    pub fn new(protocol_name: &[u8]) -> Self {
        let mut h = [0u8; 32];
        if protocol_name.len() <= h.len() {
            h[..protocol_name.len()].copy_from_slice(protocol_name);
        } else {
            h = hash::sha256(protocol_name);
        }
        Self {
            ck: h,
            h,
            cipher: CipherState::empty(),
        }
    }

    /// `MixHash(data)`.
    pub fn mix_hash(&mut self, data: &[u8]) {
        self.h = hash::sha256_parts(&[&self.h, data]);
    }

    /// `MixKey(input_key_material)`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyDerivationFailed`] if HKDF fails.
    pub fn mix_key(&mut self, ikm: &[u8]) -> Result<(), CryptoError> {
        let (ck, mut temp_k) = hash::hkdf2(&self.ck, ikm)?;
        self.ck = ck;
        self.cipher.initialize_key(temp_k);
        temp_k.zeroize();
        Ok(())
    }

    /// `EncryptAndHash(plaintext)`.
    ///
    /// # Errors
    ///
    /// Propagates cipher failures.
    pub fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = self.cipher.encrypt_with_ad(&self.h, plaintext)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    /// `DecryptAndHash(ciphertext)`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] if authentication fails.
    pub fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let plaintext = self.cipher.decrypt_with_ad(&self.h, ciphertext)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    /// `Split()`: derive the initiator-to-responder and responder-to-initiator
    /// transport ciphers.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyDerivationFailed`] if HKDF fails.
    pub fn split(&self) -> Result<(CipherState, CipherState), CryptoError> {
        let (mut k1, mut k2) = hash::hkdf2(&self.ck, &[])?;
        let pair = (CipherState::new(k1), CipherState::new(k2));
        k1.zeroize();
        k2.zeroize();
        Ok(pair)
    }

    /// Current handshake hash `h`.
    #[must_use]
    pub fn handshake_hash(&self) -> Digest {
        self.h
    }
}

/// Which message the initiator handles next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    WriteInit,
    ReadResponse,
    WriteCompletion,
}

/// Keys the device revealed in handshake message 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteKeys {
    /// Device ephemeral public key (plaintext in message 2)
    pub ephemeral: [u8; 32],
    /// Device static public key, masked with a per-handshake scalar
    pub static_masked: [u8; 32],
}

/// Initiator side of the XX handshake.
pub struct HandshakeState {
    symmetric: SymmetricState,
    s: PrivateKey,
    e: Option<PrivateKey>,
    remote: Option<RemoteKeys>,
    step: Step,
}

impl HandshakeState {
    /// Start a handshake as initiator, mixing `prologue` into the hash.
    #[must_use]
    pub fn initiator(prologue: &[u8], static_key: PrivateKey) -> Self {
        let mut symmetric = SymmetricState::new(PROTOCOL_NAME);
        symmetric.mix_hash(prologue);
        Self {
            symmetric,
            s: static_key,
            e: None,
            remote: None,
            step: Step::WriteInit,
        }
    }

    fn expect_step(&self, step: Step) -> Result<(), CryptoError> {
        if self.step != step {
            return Err(CryptoError::Handshake(format!(
                "expected {:?}, at {:?}",
                step, self.step
            )));
        }
        Ok(())
    }

    /// Write message 1 (`-> e`) with `payload` in the clear.
    ///
    /// # Errors
    ///
    /// Fails if called out of order or if randomness is unavailable.
    pub fn write_init(&mut self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.expect_step(Step::WriteInit)?;

        let e = PrivateKey::random()?;
        let e_pub = e.public_key().to_bytes();
        self.symmetric.mix_hash(&e_pub);
        self.e = Some(e);

        let mut message = e_pub.to_vec();
        message.extend_from_slice(&self.symmetric.encrypt_and_hash(payload)?);
        self.step = Step::ReadResponse;
        Ok(message)
    }

    /// Read message 2 (`<- e, ee, s, es`) and return its decrypted payload.
    ///
    /// # Errors
    ///
    /// Fails if the message is truncated, authentication fails or a DH
    /// result is degenerate.
    pub fn read_response(&mut self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.expect_step(Step::ReadResponse)?;

        let min_len = X25519_PUBLIC_KEY_SIZE + ENCRYPTED_STATIC_SIZE + TAG_SIZE;
        if message.len() < min_len {
            return Err(CryptoError::Handshake(format!(
                "response too short: {} < {}",
                message.len(),
                min_len
            )));
        }
        let (re, rest) = message.split_at(X25519_PUBLIC_KEY_SIZE);
        let (encrypted_static, payload) = rest.split_at(ENCRYPTED_STATIC_SIZE);

        let re = PublicKey::from_slice(re)?;
        self.symmetric.mix_hash(re.as_bytes());

        let e = self
            .e
            .as_ref()
            .ok_or_else(|| CryptoError::Handshake("missing ephemeral key".into()))?;
        let ee = e.exchange(&re).ok_or(CryptoError::InvalidPublicKey)?;
        self.symmetric.mix_key(ee.as_bytes())?;

        let rs = PublicKey::from_slice(&self.symmetric.decrypt_and_hash(encrypted_static)?)?;
        let es = e.exchange(&rs).ok_or(CryptoError::InvalidPublicKey)?;
        self.symmetric.mix_key(es.as_bytes())?;

        let plaintext = self.symmetric.decrypt_and_hash(payload)?;
        self.remote = Some(RemoteKeys {
            ephemeral: re.to_bytes(),
            static_masked: rs.to_bytes(),
        });
        self.step = Step::WriteCompletion;
        Ok(plaintext)
    }

    /// Device keys learned from message 2, once it has been read.
    #[must_use]
    pub fn remote_keys(&self) -> Option<RemoteKeys> {
        self.remote
    }

    /// Replace the local static key.
    ///
    /// The static key is first used by message 3, which consumes the
    /// handshake, so any replacement before that takes effect.
    pub fn set_static_key(&mut self, key: PrivateKey) {
        self.s = key;
    }

    /// Write message 3 (`-> s, se`) and finish the handshake.
    ///
    /// # Errors
    ///
    /// Fails if called out of order or a DH result is degenerate.
    pub fn write_completion(
        mut self,
        payload: &[u8],
    ) -> Result<(Vec<u8>, TransportState), CryptoError> {
        self.expect_step(Step::WriteCompletion)?;

        let remote = self
            .remote
            .ok_or_else(|| CryptoError::Handshake("missing remote keys".into()))?;

        let mut message = self
            .symmetric
            .encrypt_and_hash(self.s.public_key().as_bytes())?;

        let se = self
            .s
            .exchange(&PublicKey::from_bytes(remote.ephemeral))
            .ok_or(CryptoError::InvalidPublicKey)?;
        self.symmetric.mix_key(se.as_bytes())?;

        message.extend_from_slice(&self.symmetric.encrypt_and_hash(payload)?);

        let (send, recv) = self.symmetric.split()?;
        let transport = TransportState {
            send,
            recv,
            handshake_hash: self.symmetric.handshake_hash(),
        };
        Ok((message, transport))
    }
}

/// Post-handshake transport ciphers.
pub struct TransportState {
    send: CipherState,
    recv: CipherState,
    handshake_hash: Digest,
}

impl TransportState {
    /// Assemble a transport state from split cipher states.
    ///
    /// For the initiator `send` is the first `Split()` output; a responder
    /// passes them swapped.
    #[must_use]
    pub fn new(send: CipherState, recv: CipherState, handshake_hash: Digest) -> Self {
        Self {
            send,
            recv,
            handshake_hash,
        }
    }

    /// Encrypt an outgoing transport message (empty associated data).
    ///
    /// # Errors
    ///
    /// Propagates cipher failures.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.send.encrypt_with_ad(&[], plaintext)
    }

    /// Decrypt an incoming transport message.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] if authentication fails.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.recv.decrypt_with_ad(&[], ciphertext)
    }

    /// Final handshake hash, used as channel binding during pairing.
    #[must_use]
    pub fn handshake_hash(&self) -> Digest {
        self.handshake_hash
    }
}
