//! Error types for the THP channel and pairing layers.

use std::fmt;
use thiserror::Error;
use thp_transport::TransportError;

/// Core protocol errors
#[derive(Debug, Error)]
pub enum Error {
    /// Wire checksum did not verify. A protocol error that only voids the
    /// affected message; the sender retransmits it.
    #[error("checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    Checksum {
        /// Checksum carried by the message
        expected: u32,
        /// Checksum computed over the received bytes
        computed: u32,
    },

    /// Malformed framing or an unexpected response
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Error reported in-band by the device
    #[error("device error: {0}")]
    Thp(ThpErrorCode),

    /// The device is locked and refused the handshake
    #[error("device is locked")]
    DeviceLocked,

    /// No response or acknowledgement within the allowed time
    #[error("timeout: {0}")]
    Timeout(String),

    /// Operation invalid in the current channel or pairing state
    #[error("state mismatch: {0}")]
    StateMismatch(String),

    /// Channel has no handshake or transport cipher
    #[error("channel is closed")]
    ChannelClosed,

    /// Device answered with an application-level `Failure`
    #[error("device failure (code {code:?}): {message}")]
    Failure {
        /// Failure code, if the device sent one
        code: Option<i32>,
        /// Human-readable failure message
        message: String,
    },

    /// Transport failure other than a timeout
    #[error("transport error: {0}")]
    Transport(TransportError),

    /// Cryptographic error
    #[error("crypto error: {0}")]
    Crypto(#[from] thp_crypto::CryptoError),

    /// Protobuf payload could not be decoded
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

impl Error {
    /// Build a [`Error::Protocol`] from anything printable.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Whether this is a protocol-level error (checksum errors included).
    #[must_use]
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Checksum { .. } | Self::Protocol(_))
    }

    /// Whether this is a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(after) => Self::Timeout(format!("no data after {after:?}")),
            other => Self::Transport(other),
        }
    }
}

/// Device error codes carried in `ERROR` packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThpErrorCode {
    /// Device is busy with another channel; retry later
    TransportBusy,
    /// Channel id is not allocated on the device
    UnallocatedChannel,
    /// Device could not decrypt the message
    DecryptionFailed,
    /// Device is locked
    DeviceLocked,
    /// Code this implementation does not know
    Unknown(u8),
}

impl ThpErrorCode {
    /// Wire value of the code.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::TransportBusy => 1,
            Self::UnallocatedChannel => 2,
            Self::DecryptionFailed => 3,
            Self::DeviceLocked => 5,
            Self::Unknown(code) => code,
        }
    }
}

impl From<u8> for ThpErrorCode {
    fn from(code: u8) -> Self {
        match code {
            1 => Self::TransportBusy,
            2 => Self::UnallocatedChannel,
            3 => Self::DecryptionFailed,
            5 => Self::DeviceLocked,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for ThpErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransportBusy => write!(f, "transport busy"),
            Self::UnallocatedChannel => write!(f, "unallocated channel"),
            Self::DecryptionFailed => write!(f, "decryption failed"),
            Self::DeviceLocked => write!(f, "device locked"),
            Self::Unknown(code) => write!(f, "unknown error code {code}"),
        }
    }
}
