//! Pairing methods.
//!
//! Every method proves to both sides that the user saw the same channel:
//! all tags and codes are bound to the handshake hash. A check that fails
//! on the host aborts pairing.

use super::PairingController;
use crate::error::Error;
use crate::messages::{
    CodeEntryChallenge, CodeEntryCommitment, CodeEntryCpaceHostTag, CodeEntryCpaceTrezor,
    CodeEntrySecret, EndResponse, NfcTagHost, NfcTagTrezor, PairingMethodId,
    PairingPreparationsFinished, QrCodeSecret, QrCodeTag,
};
use thp_crypto::cpace::{self, CpaceKeys};
use thp_crypto::hash::{sha256, sha256_parts};
use thp_crypto::random::random_array;
use thp_transport::Transport;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Methods this host implements, in preference order.
pub const IMPLEMENTED_METHODS: [PairingMethodId; 4] = [
    PairingMethodId::SkipPairing,
    PairingMethodId::CodeEntry,
    PairingMethodId::QrCode,
    PairingMethodId::Nfc,
];

/// Number of decimal digits in a code entry code
pub const CODE_ENTRY_DIGITS: u32 = 6;

const CODE_ENTRY_MODULUS: u64 = 10u64.pow(CODE_ENTRY_DIGITS);

/// Size of the code entry challenge
pub const CHALLENGE_LEN: usize = 16;

/// Size of a QR code
pub const QR_CODE_LEN: usize = 16;

/// Size of the NFC host secret
pub const NFC_SECRET_LEN: usize = 16;

fn method_tag(method: PairingMethodId) -> [u8; 1] {
    [method as i32 as u8]
}

/// Six digit code shown by the device during code entry pairing:
/// `SHA-256(2 || handshake_hash || secret || challenge)` as a big-endian
/// integer, modulo 10^6.
#[must_use]
pub fn code_entry_code(handshake_hash: &[u8; 32], secret: &[u8], challenge: &[u8]) -> u32 {
    let digest = sha256_parts(&[
        &method_tag(PairingMethodId::CodeEntry),
        handshake_hash,
        secret,
        challenge,
    ]);
    let code = digest
        .iter()
        .fold(0u64, |acc, &byte| (acc * 256 + u64::from(byte)) % CODE_ENTRY_MODULUS);
    // always below 10^6
    code as u32
}

/// QR code the device derives from its secret.
#[must_use]
pub fn qr_code(handshake_hash: &[u8; 32], secret: &[u8]) -> [u8; QR_CODE_LEN] {
    let digest = sha256_parts(&[&method_tag(PairingMethodId::QrCode), handshake_hash, secret]);
    let mut code = [0u8; QR_CODE_LEN];
    code.copy_from_slice(&digest[..QR_CODE_LEN]);
    code
}

/// Host proof of having scanned `code`.
#[must_use]
pub fn qr_code_tag(handshake_hash: &[u8; 32], code: &[u8]) -> [u8; 32] {
    sha256_parts(&[handshake_hash, code])
}

/// NFC tag over `value`, used in both directions.
#[must_use]
pub fn nfc_tag(handshake_hash: &[u8; 32], value: &[u8]) -> [u8; 32] {
    sha256_parts(&[&method_tag(PairingMethodId::Nfc), handshake_hash, value])
}

fn required(field: Option<Vec<u8>>, name: &str) -> Result<Vec<u8>, Error> {
    field.ok_or_else(|| Error::protocol(format!("missing {name}")))
}

/// A pairing method in progress.
pub enum PairingMethod {
    /// Device trusts the host without user interaction
    Skip,
    /// Code entry, waiting for the code shown on the device
    CodeEntry(CodeEntry),
    /// QR code, waiting for the scanned code
    QrCode(QrCode),
    /// NFC, waiting for the device tag
    Nfc(Nfc),
}

impl PairingMethod {
    /// Select `method` on the device and run its setup.
    ///
    /// Skip pairing completes and finishes pairing immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StateMismatch`] unless pairing was requested, and
    /// [`Error::Protocol`] if the device does not offer the method.
    pub fn setup<T: Transport>(
        method: PairingMethodId,
        controller: &mut PairingController<'_, T>,
    ) -> Result<Self, Error> {
        match method {
            PairingMethodId::SkipPairing => {
                let _: EndResponse = controller.select_method(method)?;
                controller.set_paired()?;
                controller.finish_with(false)?;
                Ok(Self::Skip)
            }
            PairingMethodId::CodeEntry => CodeEntry::setup(controller).map(Self::CodeEntry),
            PairingMethodId::QrCode => QrCode::setup(controller).map(Self::QrCode),
            PairingMethodId::Nfc => Nfc::setup(controller).map(Self::Nfc),
        }
    }

    /// Identifier of this method.
    #[must_use]
    pub fn id(&self) -> PairingMethodId {
        match self {
            Self::Skip => PairingMethodId::SkipPairing,
            Self::CodeEntry(_) => PairingMethodId::CodeEntry,
            Self::QrCode(_) => PairingMethodId::QrCode,
            Self::Nfc(_) => PairingMethodId::Nfc,
        }
    }
}

/// Code entry pairing: the user types the code shown on the device, and a
/// CPace exchange over that code authenticates both sides.
#[derive(Debug)]
pub struct CodeEntry {
    commitment: Vec<u8>,
    challenge: [u8; CHALLENGE_LEN],
    trezor_cpace_pubkey: [u8; 32],
}

impl CodeEntry {
    /// Select code entry, collect the commitment and send the challenge.
    ///
    /// # Errors
    ///
    /// Propagates selection and device errors.
    pub fn setup<T: Transport>(controller: &mut PairingController<'_, T>) -> Result<Self, Error> {
        let commitment: CodeEntryCommitment =
            controller.select_method(PairingMethodId::CodeEntry)?;
        let commitment = required(commitment.commitment, "code entry commitment")?;

        let challenge: [u8; CHALLENGE_LEN] = random_array()?;
        let cpace_trezor: CodeEntryCpaceTrezor = controller.call(&CodeEntryChallenge {
            challenge: Some(challenge.to_vec()),
        })?;
        let trezor_cpace_pubkey = required(
            cpace_trezor.cpace_trezor_public_key,
            "device CPace public key",
        )?;
        let trezor_cpace_pubkey = <[u8; 32]>::try_from(trezor_cpace_pubkey.as_slice())
            .map_err(|_| Error::protocol("device CPace public key must be 32 bytes"))?;

        Ok(Self {
            commitment,
            challenge,
            trezor_cpace_pubkey,
        })
    }

    /// Authenticate with the code the user read from the device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for a code outside `0..1_000_000` and,
    /// after aborting, if the revealed secret does not match the commitment
    /// or the code.
    pub fn send_code<T: Transport>(
        &self,
        controller: &mut PairingController<'_, T>,
        code: u32,
    ) -> Result<(), Error> {
        if u64::from(code) >= CODE_ENTRY_MODULUS {
            return Err(Error::protocol(format!(
                "code must have at most {CODE_ENTRY_DIGITS} digits"
            )));
        }
        let handshake_hash = controller.handshake_hash()?;
        let keys = CpaceKeys::generate(code, &handshake_hash)?;
        let shared_secret = keys.shared_secret(&self.trezor_cpace_pubkey)?;

        let secret: CodeEntrySecret = controller.call(&CodeEntryCpaceHostTag {
            cpace_host_public_key: Some(keys.public_key().to_vec()),
            tag: Some(cpace::tag(&shared_secret).to_vec()),
        })?;
        let secret = required(secret.secret, "code entry secret")?;

        controller.abort_if_not_equal(&self.commitment, &sha256(&secret), "code entry commitment")?;
        let expected = code_entry_code(&handshake_hash, &secret, &self.challenge);
        controller.abort_if_not_equal(
            format!("{expected:06}").as_bytes(),
            format!("{code:06}").as_bytes(),
            "code entry code",
        )?;
        controller.set_paired()
    }
}

/// QR code pairing: the host scans a code derived from a device secret.
#[derive(Debug)]
pub struct QrCode;

impl QrCode {
    /// Select QR code pairing and wait for the device to show the code.
    ///
    /// # Errors
    ///
    /// Propagates selection and device errors.
    pub fn setup<T: Transport>(controller: &mut PairingController<'_, T>) -> Result<Self, Error> {
        let _: PairingPreparationsFinished = controller.select_method(PairingMethodId::QrCode)?;
        Ok(Self)
    }

    /// Authenticate with the scanned code.
    ///
    /// # Errors
    ///
    /// After aborting, returns [`Error::Protocol`] if the revealed secret
    /// does not produce `code`.
    pub fn send_qr_code<T: Transport>(
        &self,
        controller: &mut PairingController<'_, T>,
        code: &[u8],
    ) -> Result<(), Error> {
        let handshake_hash = controller.handshake_hash()?;
        let secret: QrCodeSecret = controller.call(&QrCodeTag {
            tag: Some(qr_code_tag(&handshake_hash, code).to_vec()),
        })?;
        let secret = required(secret.secret, "QR code secret")?;

        let expected = qr_code(&handshake_hash, &secret);
        controller.abort_if_not_equal(&expected, code, "QR code")?;
        controller.set_paired()
    }
}

/// NFC pairing: the host secret travels to the device over NFC, the device
/// tag travels back.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Nfc {
    host_secret: [u8; NFC_SECRET_LEN],
}

impl Nfc {
    /// Generate the host secret and select NFC pairing.
    ///
    /// # Errors
    ///
    /// Propagates selection and device errors.
    pub fn setup<T: Transport>(controller: &mut PairingController<'_, T>) -> Result<Self, Error> {
        let host_secret = random_array()?;
        let _: PairingPreparationsFinished = controller.select_method(PairingMethodId::Nfc)?;
        Ok(Self { host_secret })
    }

    /// Secret to hand to the device over NFC.
    #[must_use]
    pub fn host_secret(&self) -> &[u8; NFC_SECRET_LEN] {
        &self.host_secret
    }

    /// Authenticate with the tag read from the device.
    ///
    /// # Errors
    ///
    /// After aborting, returns [`Error::Protocol`] if the device's reply
    /// does not prove knowledge of the host secret.
    pub fn send_nfc_tag<T: Transport>(
        &self,
        controller: &mut PairingController<'_, T>,
        tag_trezor: &[u8],
    ) -> Result<(), Error> {
        let handshake_hash = controller.handshake_hash()?;
        let reply: NfcTagTrezor = controller.call(&NfcTagHost {
            tag: Some(nfc_tag(&handshake_hash, tag_trezor).to_vec()),
        })?;
        let device_tag = required(reply.tag, "device NFC tag")?;

        let expected = nfc_tag(&handshake_hash, &self.host_secret);
        controller.abort_if_not_equal(&expected, &device_tag, "NFC tag")?;
        controller.set_paired()
    }
}
