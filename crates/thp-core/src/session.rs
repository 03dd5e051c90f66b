//! Application message envelope and sessions.
//!
//! Every encrypted transport payload is
//!
//! ```text
//! ┌────────────┬───────────────────┬─────────────────┐
//! │ session id │ message type (BE) │ protobuf bytes  │
//! │     1      │         2         │       ...       │
//! └────────────┴───────────────────┴─────────────────┘
//! ```
//!
//! Session 0 is reserved for pairing and channel management.

use crate::channel::Channel;
use crate::error::Error;
use crate::messages::{ButtonAck, ButtonRequest, Failure, ThpMessage};
use prost::Message as _;
use thp_transport::Transport;

/// Session id used by the pairing controller
pub const PAIRING_SESSION_ID: u8 = 0;

/// Session id plus message type
pub const ENVELOPE_HEADER_LEN: usize = 3;

/// Decoded transport payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Session the message belongs to
    pub session_id: u8,
    /// Protobuf message type
    pub message_type: u16,
    /// Encoded protobuf message
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Serialize as `session_id || message_type || payload`.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ENVELOPE_HEADER_LEN + self.payload.len());
        buf.push(self.session_id);
        buf.extend_from_slice(&self.message_type.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse a decrypted transport payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the header is truncated.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < ENVELOPE_HEADER_LEN {
            return Err(Error::protocol(format!(
                "transport payload too short: {} bytes",
                bytes.len()
            )));
        }
        Ok(Self {
            session_id: bytes[0],
            message_type: u16::from_be_bytes([bytes[1], bytes[2]]),
            payload: bytes[ENVELOPE_HEADER_LEN..].to_vec(),
        })
    }
}

/// A session multiplexed over an open channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    id: u8,
}

impl Session {
    /// Session with the given id.
    #[must_use]
    pub fn new(id: u8) -> Self {
        Self { id }
    }

    /// The pairing session.
    #[must_use]
    pub fn pairing() -> Self {
        Self::new(PAIRING_SESSION_ID)
    }

    /// Session id.
    #[must_use]
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Send an encoded message of `message_type`.
    ///
    /// # Errors
    ///
    /// Propagates channel errors.
    pub fn write_raw<T: Transport>(
        &self,
        channel: &mut Channel<T>,
        message_type: u16,
        payload: &[u8],
    ) -> Result<(), Error> {
        let envelope = Envelope {
            session_id: self.id,
            message_type,
            payload: payload.to_vec(),
        };
        channel.write_chunk(&envelope.encode())
    }

    /// Receive the next message for this session as `(type, payload)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for a message addressed to another
    /// session, plus channel errors.
    pub fn read_raw<T: Transport>(&self, channel: &mut Channel<T>) -> Result<(u16, Vec<u8>), Error> {
        let timeout = channel.config().response_timeout;
        let envelope = Envelope::decode(&channel.read_chunk(timeout)?)?;
        if envelope.session_id != self.id {
            return Err(Error::protocol(format!(
                "message for session {} on session {}",
                envelope.session_id, self.id
            )));
        }
        Ok((envelope.message_type, envelope.payload))
    }

    /// Send a message.
    ///
    /// # Errors
    ///
    /// Propagates channel errors.
    pub fn write<M: ThpMessage, T: Transport>(
        &self,
        channel: &mut Channel<T>,
        message: &M,
    ) -> Result<(), Error> {
        tracing::debug!("Sending {} on session {}", M::NAME, self.id);
        self.write_raw(channel, M::MESSAGE_TYPE, &message.encode_to_vec())
    }

    /// Receive a message of type `M`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Failure`] if the device sent a `Failure`, and
    /// [`Error::Protocol`] for any other unexpected type.
    pub fn read<M: ThpMessage, T: Transport>(&self, channel: &mut Channel<T>) -> Result<M, Error> {
        let (message_type, payload) = self.read_raw(channel)?;
        decode_expected(message_type, &payload)
    }

    /// Send `request` and return the response, acknowledging any button
    /// requests along the way.
    ///
    /// # Errors
    ///
    /// Fails like [`Session::write`] and [`Session::read`].
    pub fn call<Req, Resp, T>(&self, channel: &mut Channel<T>, request: &Req) -> Result<Resp, Error>
    where
        Req: ThpMessage,
        Resp: ThpMessage,
        T: Transport,
    {
        self.write(channel, request)?;
        loop {
            let (message_type, payload) = self.read_raw(channel)?;
            if message_type == ButtonRequest::MESSAGE_TYPE && Resp::MESSAGE_TYPE != message_type {
                let request = ButtonRequest::decode(payload.as_slice())?;
                tracing::info!(
                    "Confirm on device ({})",
                    request.name.as_deref().unwrap_or("button request")
                );
                self.write(channel, &ButtonAck {})?;
                continue;
            }
            return decode_expected(message_type, &payload);
        }
    }
}

fn decode_expected<M: ThpMessage>(message_type: u16, payload: &[u8]) -> Result<M, Error> {
    if message_type == M::MESSAGE_TYPE {
        tracing::debug!("Received {}", M::NAME);
        return Ok(M::decode(payload)?);
    }
    if message_type == Failure::MESSAGE_TYPE {
        let failure = Failure::decode(payload)?;
        return Err(Error::Failure {
            code: failure.code,
            message: failure.message.unwrap_or_default(),
        });
    }
    Err(Error::protocol(format!(
        "expected {} ({}), got message type {}",
        M::NAME,
        M::MESSAGE_TYPE,
        message_type
    )))
}
