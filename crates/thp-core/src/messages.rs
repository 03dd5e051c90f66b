//! Protobuf messages exchanged during the handshake and pairing.
//!
//! Application messages travel inside encrypted transport payloads tagged
//! with a 16-bit message type; [`ThpMessage`] ties each struct to its type.

/// Pairing method identifiers as advertised in [`DeviceProperties`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum PairingMethodId {
    /// Trust the host without user interaction
    SkipPairing = 1,
    /// User types a six digit code shown on the device
    CodeEntry = 2,
    /// Host scans a QR code shown on the device
    QrCode = 3,
    /// Host reads an NFC tag from the device
    Nfc = 4,
}

/// Device description sent as the allocation prologue.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DeviceProperties {
    /// Internal model name, e.g. `T3W1`
    #[prost(string, optional, tag = "1")]
    pub internal_model: Option<String>,
    /// Model variant (color, packaging)
    #[prost(uint32, optional, tag = "2")]
    pub model_variant: Option<u32>,
    /// THP major version
    #[prost(uint32, optional, tag = "3")]
    pub protocol_version_major: Option<u32>,
    /// THP minor version
    #[prost(uint32, optional, tag = "4")]
    pub protocol_version_minor: Option<u32>,
    /// Advertised pairing methods
    #[prost(enumeration = "PairingMethodId", repeated, packed = "false", tag = "5")]
    pub pairing_methods: Vec<i32>,
}

/// Payload of handshake message 3.
#[derive(Clone, PartialEq, prost::Message)]
pub struct HandshakeCompletionReqNoisePayload {
    /// Credential issued by the device in an earlier pairing
    #[prost(bytes = "vec", optional, tag = "1")]
    pub host_pairing_credential: Option<Vec<u8>>,
}

/// Application-level failure.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Failure {
    /// Failure code
    #[prost(int32, optional, tag = "1")]
    pub code: Option<i32>,
    /// Human-readable message
    #[prost(string, optional, tag = "2")]
    pub message: Option<String>,
}

/// Device waits for the user to press a button.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ButtonRequest {
    /// Button request code
    #[prost(int32, optional, tag = "1")]
    pub code: Option<i32>,
    /// Number of pages shown
    #[prost(uint32, optional, tag = "2")]
    pub pages: Option<u32>,
    /// Layout name
    #[prost(string, optional, tag = "4")]
    pub name: Option<String>,
}

/// Host acknowledges a [`ButtonRequest`].
#[derive(Clone, PartialEq, prost::Message)]
pub struct ButtonAck {}

/// Ask the device to start pairing.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PairingRequest {
    /// Name of the host machine
    #[prost(string, optional, tag = "1")]
    pub host_name: Option<String>,
    /// Name of the requesting application
    #[prost(string, optional, tag = "2")]
    pub app_name: Option<String>,
}

/// The user approved the pairing request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PairingRequestApproved {}

/// Choose a pairing method.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SelectMethod {
    /// Selected method
    #[prost(enumeration = "PairingMethodId", optional, tag = "1")]
    pub selected_pairing_method: Option<i32>,
}

/// Device is ready for the selected out-of-band method.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PairingPreparationsFinished {}

/// Commitment to the code entry secret.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CodeEntryCommitment {
    /// SHA-256 of the secret
    #[prost(bytes = "vec", optional, tag = "1")]
    pub commitment: Option<Vec<u8>>,
}

/// Host challenge for code entry.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CodeEntryChallenge {
    /// Random challenge
    #[prost(bytes = "vec", optional, tag = "1")]
    pub challenge: Option<Vec<u8>>,
}

/// Device CPace public key.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CodeEntryCpaceTrezor {
    /// CPace public key
    #[prost(bytes = "vec", optional, tag = "1")]
    pub cpace_trezor_public_key: Option<Vec<u8>>,
}

/// Host CPace public key and tag.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CodeEntryCpaceHostTag {
    /// CPace public key
    #[prost(bytes = "vec", optional, tag = "1")]
    pub cpace_host_public_key: Option<Vec<u8>>,
    /// Hash of the CPace shared secret
    #[prost(bytes = "vec", optional, tag = "2")]
    pub tag: Option<Vec<u8>>,
}

/// Code entry secret revealed by the device.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CodeEntrySecret {
    /// Secret matching the commitment
    #[prost(bytes = "vec", optional, tag = "1")]
    pub secret: Option<Vec<u8>>,
}

/// Host tag for QR code pairing.
#[derive(Clone, PartialEq, prost::Message)]
pub struct QrCodeTag {
    /// Tag over the handshake hash and the scanned code
    #[prost(bytes = "vec", optional, tag = "1")]
    pub tag: Option<Vec<u8>>,
}

/// QR code secret revealed by the device.
#[derive(Clone, PartialEq, prost::Message)]
pub struct QrCodeSecret {
    /// Secret the QR code was derived from
    #[prost(bytes = "vec", optional, tag = "1")]
    pub secret: Option<Vec<u8>>,
}

/// Host tag for NFC pairing.
#[derive(Clone, PartialEq, prost::Message)]
pub struct NfcTagHost {
    /// Tag over the handshake hash and the device tag
    #[prost(bytes = "vec", optional, tag = "1")]
    pub tag: Option<Vec<u8>>,
}

/// Device tag for NFC pairing.
#[derive(Clone, PartialEq, prost::Message)]
pub struct NfcTagTrezor {
    /// Tag over the handshake hash and the host secret
    #[prost(bytes = "vec", optional, tag = "1")]
    pub tag: Option<Vec<u8>>,
}

/// Request a credential for later reconnection.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CredentialRequest {
    /// Host static public key the credential is bound to
    #[prost(bytes = "vec", optional, tag = "1")]
    pub host_static_pubkey: Option<Vec<u8>>,
    /// Ask for an autoconnect credential
    #[prost(bool, optional, tag = "2")]
    pub autoconnect: Option<bool>,
    /// Existing credential, when renewing
    #[prost(bytes = "vec", optional, tag = "3")]
    pub credential: Option<Vec<u8>>,
}

/// Credential issued by the device.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CredentialResponse {
    /// Device static public key
    #[prost(bytes = "vec", optional, tag = "1")]
    pub trezor_static_pubkey: Option<Vec<u8>>,
    /// Opaque credential
    #[prost(bytes = "vec", optional, tag = "2")]
    pub credential: Option<Vec<u8>>,
}

/// End the pairing phase.
#[derive(Clone, PartialEq, prost::Message)]
pub struct EndRequest {}

/// Pairing phase ended.
#[derive(Clone, PartialEq, prost::Message)]
pub struct EndResponse {}

/// A protobuf message with a THP message type.
pub trait ThpMessage: prost::Message + Default {
    /// Wire message type
    const MESSAGE_TYPE: u16;
    /// Name used in logs and errors
    const NAME: &'static str;
}

macro_rules! thp_messages {
    ($($ty:ident = $id:literal),* $(,)?) => {
        $(
            impl ThpMessage for $ty {
                const MESSAGE_TYPE: u16 = $id;
                const NAME: &'static str = stringify!($ty);
            }
        )*
    };
}

thp_messages! {
    Failure = 3,
    ButtonRequest = 26,
    ButtonAck = 27,
    PairingRequest = 1008,
    PairingRequestApproved = 1009,
    SelectMethod = 1010,
    PairingPreparationsFinished = 1011,
    CredentialRequest = 1016,
    CredentialResponse = 1017,
    EndRequest = 1018,
    EndResponse = 1019,
    CodeEntryCommitment = 1024,
    CodeEntryChallenge = 1025,
    CodeEntryCpaceTrezor = 1026,
    CodeEntryCpaceHostTag = 1027,
    CodeEntrySecret = 1028,
    QrCodeTag = 1032,
    QrCodeSecret = 1033,
    NfcTagHost = 1040,
    NfcTagTrezor = 1041,
}
