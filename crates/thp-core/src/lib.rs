//! # THP Core
//!
//! Host side of the Trezor Host Protocol channel layer.
//!
//! This crate provides:
//! - Control byte semantics and message framing (CRC-32, chunking,
//!   reassembly)
//! - Reliable delivery: alternating sequence bits, ACKs, retransmission
//!   with busy backoff
//! - Channel allocation and Noise XX handshake orchestration
//! - Credential matching for reconnection without pairing
//! - The pairing controller and the Skip, Code Entry, QR Code and NFC
//!   pairing methods
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Pairing / Session envelope                      │
//! │   (session 0 pairing exchange, typed protobuf calls)            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                          Channel                                 │
//! │   (allocation, Noise handshake, ACK + retransmit, encryption)   │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                          Messages                                │
//! │   (control byte, length, CRC-32, fixed-size chunks)             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                          Transport                               │
//! │   (thp-transport: USB HID / UDP packet link)                    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use thp_core::{Channel, ChannelConfig, OpenOutcome};
//! use thp_transport::UdpTransport;
//!
//! # fn example() -> Result<(), thp_core::Error> {
//! let transport = UdpTransport::new(thp_transport::DEFAULT_EMULATOR_ADDR.parse().unwrap());
//! let mut channel = Channel::allocate(transport, ChannelConfig::default())?;
//! match channel.open(&[], false)? {
//!     OpenOutcome::Opened(pairing_state) => println!("opened: {pairing_state:?}"),
//!     OpenOutcome::DeviceLocked => println!("unlock the device and retry"),
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod channel;
pub mod config;
pub mod control_byte;
pub mod credential;
pub mod error;
pub mod message;
pub mod messages;
pub mod pairing;
pub mod session;

pub use channel::{Channel, ChannelState, OpenOutcome, PairingState};
pub use config::{Backoff, ChannelConfig};
pub use credential::{Credential, TrezorPublicKeys, find_credential};
pub use error::{Error, ThpErrorCode};
pub use message::{BROADCAST_CHANNEL_ID, Message, Reassembler, read_message, write_message};
pub use messages::{DeviceProperties, PairingMethodId, ThpMessage};
pub use pairing::{
    CodeEntry, CodeProvider, ControllerLifecycle, Nfc, PairingController, PairingMethod, QrCode,
    default_pairing_flow, derive_lifecycle,
};
pub use session::{Envelope, Session};

/// THP protocol version implemented (major, minor)
pub const PROTOCOL_VERSION: (u32, u32) = (2, 0);
