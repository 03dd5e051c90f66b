//! # THP Transport
//!
//! Packet transports for the Trezor Host Protocol.
//!
//! This crate provides:
//! - The blocking [`Transport`] contract: fixed-size chunk reads and writes,
//!   nestable open/close scopes and a typed read timeout
//! - A UDP transport for the device emulator
//! - [`SharedTransport`] for driving several channels over one link
//!
//! Transports only move chunks. Retransmission, acknowledgement and
//! backoff live in `thp-core`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod shared;
pub mod transport;
pub mod udp;

pub use shared::SharedTransport;
pub use transport::{
    DEFAULT_CHUNK_SIZE, OpenCount, Transport, TransportError, TransportResult, TransportStats,
};
pub use udp::{DEFAULT_EMULATOR_ADDR, UdpTransport};
