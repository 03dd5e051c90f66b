//! Control byte semantics.
//!
//! The first byte of every packet selects its kind:
//!
//! ```text
//!  7 6 5 4 3 2 1 0
//! ┌─┬─┬─┬─┬─┬─────┐
//! │0│0│0│S│A│ typ │  data packet (typ 0..=4), S = sequence bit, A = ack bit
//! │0│0│1│0│A│0 0 0│  ACK, A = acknowledged sequence bit
//! │1│ ─ ─ ─ ─ ─ ─ │  continuation chunk
//! └─┴─┴─┴─┴─┴─────┘
//! ```
//!
//! plus a handful of fixed values for broadcast traffic and errors.

use crate::error::Error;

/// Legacy protocol v1 report marker (`?`)
pub const CODEC_V1: u8 = 0x3F;
/// Broadcast channel allocation request
pub const CHANNEL_ALLOCATION_REQ: u8 = 0x40;
/// Broadcast channel allocation response
pub const CHANNEL_ALLOCATION_RES: u8 = 0x41;
/// Device-reported error
pub const ERROR: u8 = 0x42;
/// Broadcast ping
pub const PING: u8 = 0x43;
/// Broadcast pong
pub const PONG: u8 = 0x44;

/// Handshake message 1
pub const HANDSHAKE_INIT_REQ: u8 = 0x00;
/// Handshake message 2
pub const HANDSHAKE_INIT_RES: u8 = 0x01;
/// Handshake message 3
pub const HANDSHAKE_COMP_REQ: u8 = 0x02;
/// Encrypted trust state after the handshake
pub const HANDSHAKE_COMP_RES: u8 = 0x03;
/// Encrypted application data
pub const ENCRYPTED_TRANSPORT: u8 = 0x04;

/// Marks continuation chunks
pub const CONTINUATION_BIT: u8 = 0x80;
/// Clears the sequence and ack bits of a data control byte
pub const DATA_MASK: u8 = 0b1110_0111;
/// Clears the ack bit of an ACK control byte
pub const ACK_MASK: u8 = 0b1111_0111;
/// ACK control byte with the ack bit cleared
pub const ACK_BASE: u8 = 0b0010_0000;
/// Sequence bit of data packets
pub const DATA_SEQ_BIT: u8 = 0b0001_0000;
/// Piggybacked ack bit of data packets
pub const DATA_ACK_SEQ_BIT: u8 = 0b0000_1000;
/// Ack bit of ACK packets
pub const ACK_SEQ_BIT: u8 = 0b0000_1000;

/// Classification of a control byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Continuation chunk of a longer message
    Continuation,
    /// Acknowledgement
    Ack,
    /// Handshake or encrypted transport data
    Data,
    /// Device error
    Error,
    /// Channel allocation request
    ChannelAllocationRequest,
    /// Channel allocation response
    ChannelAllocationResponse,
    /// Ping
    Ping,
    /// Pong
    Pong,
    /// Protocol v1 report
    CodecV1,
    /// Anything else
    Unknown,
}

/// Classify a control byte. Every byte maps to exactly one kind.
#[must_use]
pub fn classify(ctrl: u8) -> PacketKind {
    if is_continuation(ctrl) {
        PacketKind::Continuation
    } else if is_ack(ctrl) {
        PacketKind::Ack
    } else if is_data(ctrl) {
        PacketKind::Data
    } else {
        match ctrl {
            ERROR => PacketKind::Error,
            CHANNEL_ALLOCATION_REQ => PacketKind::ChannelAllocationRequest,
            CHANNEL_ALLOCATION_RES => PacketKind::ChannelAllocationResponse,
            PING => PacketKind::Ping,
            PONG => PacketKind::Pong,
            CODEC_V1 => PacketKind::CodecV1,
            _ => PacketKind::Unknown,
        }
    }
}

/// Continuation chunk marker set.
#[must_use]
pub fn is_continuation(ctrl: u8) -> bool {
    ctrl & CONTINUATION_BIT == CONTINUATION_BIT
}

/// ACK packet.
#[must_use]
pub fn is_ack(ctrl: u8) -> bool {
    ctrl & ACK_MASK == ACK_BASE
}

/// Handshake or encrypted transport packet.
#[must_use]
pub fn is_data(ctrl: u8) -> bool {
    ctrl & DATA_MASK <= ENCRYPTED_TRANSPORT
}

/// Device error packet.
#[must_use]
pub fn is_error(ctrl: u8) -> bool {
    ctrl == ERROR
}

/// Data packet of the given type (sequence and ack bits ignored).
#[must_use]
pub fn is_data_type(ctrl: u8, data_type: u8) -> bool {
    is_data(ctrl) && ctrl & DATA_MASK == data_type
}

/// Sequence bit of a data packet.
///
/// Handshake packets have a fixed sequence bit: `false` for the init pair,
/// `true` for the completion pair. Non-data packets have none.
#[must_use]
pub fn get_seq_bit(ctrl: u8) -> Option<bool> {
    if !is_data(ctrl) {
        return None;
    }
    match ctrl & DATA_MASK {
        HANDSHAKE_INIT_REQ | HANDSHAKE_INIT_RES => Some(false),
        HANDSHAKE_COMP_REQ | HANDSHAKE_COMP_RES => Some(true),
        _ => Some(ctrl & DATA_SEQ_BIT != 0),
    }
}

/// Acknowledged sequence bit: the ack bit of an ACK, or the piggybacked ack
/// bit of a data packet.
#[must_use]
pub fn get_ack_bit(ctrl: u8) -> Option<bool> {
    if is_ack(ctrl) {
        Some(ctrl & ACK_SEQ_BIT != 0)
    } else if is_data(ctrl) {
        Some(ctrl & DATA_ACK_SEQ_BIT != 0)
    } else {
        None
    }
}

/// Set the sequence bit of a data control byte. Other bytes are returned
/// unchanged.
#[must_use]
pub fn add_seq_bit(ctrl: u8, seq_bit: bool) -> u8 {
    if !is_data(ctrl) {
        return ctrl;
    }
    if seq_bit {
        ctrl | DATA_SEQ_BIT
    } else {
        ctrl & !DATA_SEQ_BIT
    }
}

/// ACK control byte acknowledging a packet with control byte `ctrl`.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if `ctrl` carries no sequence bit.
pub fn make_ack_for(ctrl: u8) -> Result<u8, Error> {
    let seq_bit = get_seq_bit(ctrl)
        .ok_or_else(|| Error::protocol(format!("cannot acknowledge control byte 0x{ctrl:02x}")))?;
    Ok(if seq_bit {
        ACK_BASE | ACK_SEQ_BIT
    } else {
        ACK_BASE
    })
}
