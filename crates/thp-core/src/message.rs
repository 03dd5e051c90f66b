//! Message framing for the THP wire format.
//!
//! A message is serialized as
//!
//! ```text
//! ┌──────┬──────────┬──────────┬────────────┬──────────┐
//! │ ctrl │ cid (BE) │ len (BE) │    data    │ CRC32 BE │
//! │  1   │    2     │    2     │ len - 4    │    4     │
//! └──────┴──────────┴──────────┴────────────┴──────────┘
//! ```
//!
//! where `len` counts the data and the checksum, and the CRC-32 covers every
//! byte before it. The serialized message is cut into fixed-size chunks: the
//! first chunk carries the bytes above as-is, every following chunk starts
//! with `0x80 || cid`. All chunks are zero-padded to the chunk size.

use crate::control_byte::{self, CODEC_V1, CONTINUATION_BIT};
use crate::error::{Error, ThpErrorCode};
use thp_transport::Transport;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Channel id used for broadcast traffic (allocation, ping)
pub const BROADCAST_CHANNEL_ID: u16 = 0xFFFF;

/// Highest channel id a device may allocate
pub const MAX_CHANNEL_ID: u16 = 0xFFEF;

/// Size of the CRC-32 trailer
pub const CHECKSUM_LEN: usize = 4;

/// Control byte plus channel id
pub const HEADER_LEN: usize = 3;

/// Header plus length field, the fixed prefix of every first chunk
pub const INIT_HEADER_LEN: usize = HEADER_LEN + 2;

/// Continuation marker plus channel id
pub const CONT_HEADER_LEN: usize = 3;

/// Largest data field that still fits the 16-bit length
pub const MAX_DATA_LEN: usize = u16::MAX as usize - CHECKSUM_LEN;

/// One THP message: control byte, channel id and data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    ctrl_byte: u8,
    channel_id: u16,
    data: Vec<u8>,
}

impl Message {
    /// Create a message.
    pub fn new(ctrl_byte: u8, channel_id: u16, data: impl Into<Vec<u8>>) -> Self {
        Self {
            ctrl_byte,
            channel_id,
            data: data.into(),
        }
    }

    /// Create a message on the broadcast channel.
    pub fn broadcast(ctrl_byte: u8, data: impl Into<Vec<u8>>) -> Self {
        Self::new(ctrl_byte, BROADCAST_CHANNEL_ID, data)
    }

    /// Parse a message from its control byte, channel id and the bytes that
    /// follow the header (`len || data || crc`, trailing padding allowed).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for a truncated buffer or an impossible
    /// length, [`Error::Checksum`] if the CRC does not verify.
    pub fn parse(ctrl_byte: u8, channel_id: u16, rest: &[u8]) -> Result<Self, Error> {
        if rest.len() < 2 {
            return Err(Error::protocol("message too short for length field"));
        }
        let length = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        if length < CHECKSUM_LEN {
            return Err(Error::protocol(format!("length {length} shorter than checksum")));
        }
        let body = &rest[2..];
        if body.len() < length {
            return Err(Error::protocol(format!(
                "message truncated: {} of {} bytes",
                body.len(),
                length
            )));
        }

        let (data, checksum) = body[..length].split_at(length - CHECKSUM_LEN);
        let expected = u32::from_be_bytes([checksum[0], checksum[1], checksum[2], checksum[3]]);
        let message = Self::new(ctrl_byte, channel_id, data);
        let computed = message.checksum();
        if computed != expected {
            return Err(Error::Checksum { expected, computed });
        }
        Ok(message)
    }

    /// Control byte.
    #[must_use]
    pub fn ctrl_byte(&self) -> u8 {
        self.ctrl_byte
    }

    /// Channel id.
    #[must_use]
    pub fn channel_id(&self) -> u16 {
        self.channel_id
    }

    /// Data field.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consume the message, returning its data.
    #[must_use]
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Control byte and big-endian channel id.
    #[must_use]
    pub fn header(&self) -> [u8; HEADER_LEN] {
        let [hi, lo] = self.channel_id.to_be_bytes();
        [self.ctrl_byte, hi, lo]
    }

    fn length_field(&self) -> Result<u16, Error> {
        u16::try_from(self.data.len() + CHECKSUM_LEN)
            .map_err(|_| Error::protocol(format!("data too long: {} bytes", self.data.len())))
    }

    /// CRC-32 over header, length and data.
    ///
    /// The length field wraps for oversized data; such messages are rejected
    /// by [`Message::to_bytes`] before the value matters.
    #[must_use]
    pub fn checksum(&self) -> u32 {
        let length = (self.data.len() + CHECKSUM_LEN) as u16;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.header());
        hasher.update(&length.to_be_bytes());
        hasher.update(&self.data);
        hasher.finalize()
    }

    /// Serialize as `header || len || data || crc`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the data exceeds [`MAX_DATA_LEN`].
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let length = self.length_field()?;
        let mut buf = Vec::with_capacity(INIT_HEADER_LEN + length as usize);
        buf.extend_from_slice(&self.header());
        buf.extend_from_slice(&length.to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf.extend_from_slice(&self.checksum().to_be_bytes());
        Ok(buf)
    }

    /// Split the serialized message into zero-padded chunks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the message is too long or
    /// `chunk_size` cannot hold the first-chunk header.
    pub fn chunks(&self, chunk_size: usize) -> Result<Vec<Vec<u8>>, Error> {
        if chunk_size < INIT_HEADER_LEN || chunk_size <= CONT_HEADER_LEN {
            return Err(Error::protocol(format!("chunk size {chunk_size} too small")));
        }
        let bytes = self.to_bytes()?;

        let first_len = bytes.len().min(chunk_size);
        let mut first = bytes[..first_len].to_vec();
        first.resize(chunk_size, 0);
        let mut chunks = vec![first];

        let [hi, lo] = self.channel_id.to_be_bytes();
        for piece in bytes[first_len..].chunks(chunk_size - CONT_HEADER_LEN) {
            let mut chunk = Vec::with_capacity(chunk_size);
            chunk.extend_from_slice(&[CONTINUATION_BIT, hi, lo]);
            chunk.extend_from_slice(piece);
            chunk.resize(chunk_size, 0);
            chunks.push(chunk);
        }
        Ok(chunks)
    }

    /// Copy of this message with the sequence bit set to `seq_bit`.
    #[must_use]
    pub fn with_seq_bit(&self, seq_bit: bool) -> Self {
        Self {
            ctrl_byte: control_byte::add_seq_bit(self.ctrl_byte, seq_bit),
            ..self.clone()
        }
    }

    /// Sequence bit, for data messages.
    #[must_use]
    pub fn seq_bit(&self) -> Option<bool> {
        control_byte::get_seq_bit(self.ctrl_byte)
    }

    /// Acknowledged sequence bit, for ACK and data messages.
    #[must_use]
    pub fn ack_bit(&self) -> Option<bool> {
        control_byte::get_ack_bit(self.ctrl_byte)
    }

    /// ACK message.
    #[must_use]
    pub fn is_ack(&self) -> bool {
        control_byte::is_ack(self.ctrl_byte)
    }

    /// Device error message.
    #[must_use]
    pub fn is_error(&self) -> bool {
        control_byte::is_error(self.ctrl_byte)
    }

    /// Encrypted transport message.
    #[must_use]
    pub fn is_encrypted_transport(&self) -> bool {
        control_byte::is_data_type(self.ctrl_byte, control_byte::ENCRYPTED_TRANSPORT)
    }

    /// Handshake message 2.
    #[must_use]
    pub fn is_handshake_init_response(&self) -> bool {
        control_byte::is_data_type(self.ctrl_byte, control_byte::HANDSHAKE_INIT_RES)
    }

    /// Handshake completion response.
    #[must_use]
    pub fn is_handshake_completion_response(&self) -> bool {
        control_byte::is_data_type(self.ctrl_byte, control_byte::HANDSHAKE_COMP_RES)
    }

    /// Channel allocation response.
    #[must_use]
    pub fn is_channel_allocation_response(&self) -> bool {
        self.ctrl_byte == control_byte::CHANNEL_ALLOCATION_RES
    }

    /// Pong.
    #[must_use]
    pub fn is_pong(&self) -> bool {
        self.ctrl_byte == control_byte::PONG
    }

    /// Error code of a device error message.
    #[must_use]
    pub fn error_code(&self) -> Option<ThpErrorCode> {
        if !self.is_error() {
            return None;
        }
        self.data.first().map(|&code| ThpErrorCode::from(code))
    }
}

/// Incremental reassembly of one message from its chunks.
#[derive(Debug)]
pub struct Reassembler {
    ctrl_byte: u8,
    channel_id: u16,
    length: usize,
    buf: Vec<u8>,
}

impl Reassembler {
    /// Start reassembly from a first chunk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for a short chunk, a continuation chunk,
    /// or a protocol v1 report.
    pub fn start(chunk: &[u8]) -> Result<Self, Error> {
        if chunk.len() < INIT_HEADER_LEN {
            return Err(Error::protocol(format!("chunk too short: {} bytes", chunk.len())));
        }
        let ctrl_byte = chunk[0];
        if ctrl_byte == CODEC_V1 {
            return Err(Error::protocol("device speaks protocol v1"));
        }
        if control_byte::is_continuation(ctrl_byte) {
            return Err(Error::protocol("continuation chunk without a message"));
        }
        let channel_id = u16::from_be_bytes([chunk[1], chunk[2]]);
        let length = u16::from_be_bytes([chunk[3], chunk[4]]) as usize;

        let mut buf = Vec::with_capacity(2 + length);
        buf.extend_from_slice(&chunk[3..5]);
        let available = (chunk.len() - INIT_HEADER_LEN).min(length);
        buf.extend_from_slice(&chunk[INIT_HEADER_LEN..INIT_HEADER_LEN + available]);

        Ok(Self {
            ctrl_byte,
            channel_id,
            length,
            buf,
        })
    }

    /// Channel id of the message being reassembled.
    #[must_use]
    pub fn channel_id(&self) -> u16 {
        self.channel_id
    }

    /// All declared bytes have arrived.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.buf.len() >= 2 + self.length
    }

    /// Append a continuation chunk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the chunk is not a continuation of
    /// this message.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), Error> {
        if chunk.len() < CONT_HEADER_LEN || !control_byte::is_continuation(chunk[0]) {
            return Err(Error::protocol("expected continuation chunk"));
        }
        let channel_id = u16::from_be_bytes([chunk[1], chunk[2]]);
        if channel_id != self.channel_id {
            return Err(Error::protocol(format!(
                "continuation for channel {channel_id:#06x}, expected {:#06x}",
                self.channel_id
            )));
        }
        let missing = 2 + self.length - self.buf.len();
        let payload = &chunk[CONT_HEADER_LEN..];
        self.buf.extend_from_slice(&payload[..payload.len().min(missing)]);
        Ok(())
    }

    /// Verify and return the message.
    ///
    /// # Errors
    ///
    /// Fails like [`Message::parse`].
    pub fn finish(self) -> Result<Message, Error> {
        Message::parse(self.ctrl_byte, self.channel_id, &self.buf)
    }
}

/// Write `message` chunk by chunk.
///
/// # Errors
///
/// Propagates framing and transport errors.
pub fn write_message<T: Transport>(transport: &mut T, message: &Message) -> Result<(), Error> {
    let chunks = message.chunks(transport.chunk_size())?;
    trace!(
        "Writing message ctrl=0x{:02x} cid={:#06x} in {} chunk(s)",
        message.ctrl_byte(),
        message.channel_id(),
        chunks.len()
    );
    for chunk in &chunks {
        transport.write_chunk(chunk)?;
    }
    Ok(())
}

/// Read one complete message.
///
/// Stray continuation chunks are skipped, and a new first chunk arriving
/// mid-message restarts reassembly. Messages failing the checksum are
/// dropped and the next one is read, up to `checksum_retries` times; the
/// last checksum error is returned after that. Every chunk read waits at
/// most `timeout`.
///
/// # Errors
///
/// Returns [`Error::Timeout`] if a chunk does not arrive in time,
/// [`Error::Checksum`] once retries are exhausted, [`Error::Protocol`] for
/// protocol v1 responses.
pub fn read_message<T: Transport>(
    transport: &mut T,
    timeout: Option<Duration>,
    checksum_retries: u32,
) -> Result<Message, Error> {
    let mut retries_left = checksum_retries;
    loop {
        match read_unverified(transport, timeout)?.finish() {
            Ok(message) => {
                trace!(
                    "Read message ctrl=0x{:02x} cid={:#06x} len={}",
                    message.ctrl_byte(),
                    message.channel_id(),
                    message.data().len()
                );
                return Ok(message);
            }
            Err(err @ Error::Checksum { .. }) if retries_left > 0 => {
                retries_left -= 1;
                warn!("Dropping message: {}", err);
            }
            Err(err) => return Err(err),
        }
    }
}

fn read_unverified<T: Transport>(
    transport: &mut T,
    timeout: Option<Duration>,
) -> Result<Reassembler, Error> {
    let mut pending: Option<Vec<u8>> = None;
    loop {
        let first = match pending.take() {
            Some(chunk) => chunk,
            None => transport.read_chunk(timeout)?,
        };
        if first.first().is_some_and(|&ctrl| control_byte::is_continuation(ctrl)) {
            trace!("Skipping stray continuation chunk");
            continue;
        }
        let mut reassembler = Reassembler::start(&first)?;

        while !reassembler.is_complete() {
            let chunk = transport.read_chunk(timeout)?;
            match chunk.first() {
                Some(&ctrl) if control_byte::is_continuation(ctrl) => {
                    if let Err(err) = reassembler.push(&chunk) {
                        debug!("Ignoring chunk: {}", err);
                    }
                }
                Some(_) => {
                    debug!("New message started before the previous one completed");
                    pending = Some(chunk);
                    break;
                }
                None => debug!("Ignoring empty chunk"),
            }
        }

        if pending.is_none() {
            return Ok(reassembler);
        }
    }
}
