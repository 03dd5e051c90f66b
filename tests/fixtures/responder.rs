//! Device side of the Noise XX handshake.
//!
//! Built from the public [`SymmetricState`] the host handshake uses, with
//! the device static key revealed masked the way THP devices do.

use thp_crypto::hash::Digest;
use thp_crypto::noise::{ENCRYPTED_STATIC_SIZE, PROTOCOL_NAME, SymmetricState, TransportState};
use thp_crypto::x25519::{self, PrivateKey};
use thp_crypto::{CryptoError, X25519_PUBLIC_KEY_SIZE, mask_static_pubkey, static_key_mask};

/// Responder state between handshake messages 1 and 3.
pub struct NoiseResponder {
    symmetric: SymmetricState,
    static_key: PrivateKey,
    ephemeral: PrivateKey,
    host_ephemeral: [u8; 32],
}

impl NoiseResponder {
    /// Start a handshake over `prologue`.
    ///
    /// # Errors
    ///
    /// Fails if randomness is unavailable.
    pub fn new(prologue: &[u8], static_key: PrivateKey) -> Result<Self, CryptoError> {
        let mut symmetric = SymmetricState::new(PROTOCOL_NAME);
        symmetric.mix_hash(prologue);
        Ok(Self {
            symmetric,
            static_key,
            ephemeral: PrivateKey::random()?,
            host_ephemeral: [0u8; 32],
        })
    }

    /// Read message 1 and return its payload (the unlock flag).
    ///
    /// # Errors
    ///
    /// Fails for a truncated message.
    pub fn read_init(&mut self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if message.len() < X25519_PUBLIC_KEY_SIZE {
            return Err(CryptoError::Handshake("init message too short".into()));
        }
        let (host_ephemeral, payload) = message.split_at(X25519_PUBLIC_KEY_SIZE);
        self.host_ephemeral.copy_from_slice(host_ephemeral);
        self.symmetric.mix_hash(&self.host_ephemeral);
        self.symmetric.decrypt_and_hash(payload)
    }

    /// Write message 2 with an empty payload.
    ///
    /// # Errors
    ///
    /// Propagates key derivation failures.
    pub fn write_response(&mut self) -> Result<Vec<u8>, CryptoError> {
        let e_pub = self.ephemeral.public_key().to_bytes();
        self.symmetric.mix_hash(&e_pub);
        let mut out = e_pub.to_vec();

        let ee = x25519::multiply(&self.ephemeral.to_bytes(), &self.host_ephemeral);
        self.symmetric.mix_key(&ee)?;

        let static_pub = self.static_key.public_key().to_bytes();
        let masked = mask_static_pubkey(&static_pub, &e_pub);
        out.extend(self.symmetric.encrypt_and_hash(&masked)?);

        let mask = static_key_mask(&static_pub, &e_pub);
        let es = x25519::multiply(
            &mask,
            &x25519::multiply(&self.static_key.to_bytes(), &self.host_ephemeral),
        );
        self.symmetric.mix_key(&es)?;
        out.extend(self.symmetric.encrypt_and_hash(&[])?);
        Ok(out)
    }

    /// Read message 3, returning its payload, the host static key and the
    /// device's transport state.
    ///
    /// # Errors
    ///
    /// Fails for a truncated message or an authentication failure.
    pub fn read_completion(
        mut self,
        message: &[u8],
    ) -> Result<(Vec<u8>, [u8; 32], TransportState), CryptoError> {
        if message.len() < ENCRYPTED_STATIC_SIZE {
            return Err(CryptoError::Handshake("completion message too short".into()));
        }
        let (encrypted_static, payload) = message.split_at(ENCRYPTED_STATIC_SIZE);
        let host_static: [u8; 32] = self
            .symmetric
            .decrypt_and_hash(encrypted_static)?
            .try_into()
            .map_err(|_| CryptoError::InvalidPublicKey)?;

        let se = x25519::multiply(&self.ephemeral.to_bytes(), &host_static);
        self.symmetric.mix_key(&se)?;
        let plaintext = self.symmetric.decrypt_and_hash(payload)?;

        let (initiator_to_responder, responder_to_initiator) = self.symmetric.split()?;
        let handshake_hash: Digest = self.symmetric.handshake_hash();
        let transport =
            TransportState::new(responder_to_initiator, initiator_to_responder, handshake_hash);
        Ok((plaintext, host_static, transport))
    }
}
