//! Pairing credentials and credential matching.
//!
//! The device never reveals its static key in the clear: handshake message 2
//! carries `mask * trezor_static`, where `mask = SHA-256(trezor_static ||
//! ephemeral)`. A stored credential matches a handshake if re-masking its
//! device key with the same ephemeral key reproduces the masked key.

use serde::{Deserialize, Serialize};
use std::fmt;
use thp_crypto::constant_time::ct_eq;
use thp_crypto::x25519::{PrivateKey, PublicKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub use thp_crypto::noise::RemoteKeys as TrezorPublicKeys;

/// Credential issued by a device after pairing.
///
/// Serializes with hex-encoded fields, so a credential file looks like
///
/// ```json
/// {"trezor_pubkey": "8d4e...", "host_privkey": "70a1...", "credential": "0a20..."}
/// ```
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Credential {
    /// Device static public key
    #[serde(with = "hex::serde")]
    pub trezor_pubkey: Vec<u8>,
    /// Host static private key the credential is bound to
    #[serde(with = "hex::serde")]
    pub host_privkey: [u8; 32],
    /// Opaque credential blob
    #[serde(with = "hex::serde")]
    pub credential: Vec<u8>,
}

impl Credential {
    /// Create a credential.
    pub fn new(
        trezor_pubkey: impl Into<Vec<u8>>,
        host_privkey: [u8; 32],
        credential: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            trezor_pubkey: trezor_pubkey.into(),
            host_privkey,
            credential: credential.into(),
        }
    }

    /// Host static private key.
    #[must_use]
    pub fn host_private_key(&self) -> PrivateKey {
        PrivateKey::from_bytes(self.host_privkey)
    }

    /// Host static public key.
    #[must_use]
    pub fn host_static_pubkey(&self) -> PublicKey {
        self.host_private_key().public_key()
    }

    /// Whether this credential belongs to the device behind `keys`.
    ///
    /// Credentials with a malformed device key never match.
    #[must_use]
    pub fn matches(&self, keys: &TrezorPublicKeys) -> bool {
        let Ok(trezor_pubkey) = <[u8; 32]>::try_from(self.trezor_pubkey.as_slice()) else {
            return false;
        };
        let masked = thp_crypto::mask_static_pubkey(&trezor_pubkey, &keys.ephemeral);
        ct_eq(&masked, &keys.static_masked)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("trezor_pubkey", &hex::encode(&self.trezor_pubkey))
            .field("host_privkey", &"[REDACTED]")
            .field("credential", &hex::encode(&self.credential))
            .finish()
    }
}

/// First credential in `credentials` matching `keys`.
pub fn find_credential<'a, I>(credentials: I, keys: &TrezorPublicKeys) -> Option<&'a Credential>
where
    I: IntoIterator<Item = &'a Credential>,
{
    credentials.into_iter().find(|credential| credential.matches(keys))
}
