//! THP channel: allocation, handshake and reliable encrypted transport.
//!
//! A channel is a numbered conversation with one device over a shared
//! packet link. Every data message carries an alternating sequence bit and
//! must be acknowledged; the sender retransmits with exponential backoff
//! until the ACK arrives or retries run out.
//!
//! Lifecycle:
//!
//! ```text
//! Unallocated ─allocate─▶ Allocated ─open─▶ HandshakePhase ─┬─▶ PairingPhase ──┐
//!                                                            └─▶ CredentialPhase ◀┘
//!                                                                     │
//!                                                              EncryptedTransport
//! ```
//!
//! States only move forward; [`Channel::close`] drops all cryptographic
//! state and returns to `Unallocated`.

use crate::config::ChannelConfig;
use crate::control_byte::{
    CHANNEL_ALLOCATION_REQ, ENCRYPTED_TRANSPORT, HANDSHAKE_COMP_REQ, HANDSHAKE_INIT_REQ, PING,
};
use crate::credential::{Credential, TrezorPublicKeys, find_credential};
use crate::error::{Error, ThpErrorCode};
use crate::message::{MAX_CHANNEL_ID, MAX_DATA_LEN, Message, read_message, write_message};
use crate::messages::{DeviceProperties, HandshakeCompletionReqNoisePayload};
use prost::Message as _;
use std::thread;
use std::time::{Duration, Instant};
use thp_crypto::aead::TAG_SIZE;
use thp_crypto::noise::{HandshakeState, TransportState};
use thp_crypto::random::random_array;
use thp_crypto::x25519::PrivateKey;
use thp_transport::Transport;

/// Size of allocation and ping nonces
pub const NONCE_LEN: usize = 8;

/// Channel lifecycle state, ordered by protocol progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChannelState {
    /// No channel id
    Unallocated,
    /// Channel id assigned, no handshake yet
    Allocated,
    /// Noise handshake in progress
    HandshakePhase,
    /// Handshake done, host not paired
    PairingPhase,
    /// Host paired, credentials may be issued
    CredentialPhase,
    /// Application traffic
    EncryptedTransport,
}

/// Trust the device reported at the end of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PairingState {
    /// Host is unknown to the device
    #[default]
    Unpaired,
    /// Host presented a valid credential
    Paired,
    /// Host presented a valid autoconnect credential
    PairedAutoconnect,
}

impl PairingState {
    /// Decode the trust byte of the handshake completion response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for an unknown value.
    pub fn from_byte(byte: u8) -> Result<Self, Error> {
        match byte {
            0 => Ok(Self::Unpaired),
            1 => Ok(Self::Paired),
            2 => Ok(Self::PairedAutoconnect),
            other => Err(Error::protocol(format!("unknown pairing state {other}"))),
        }
    }

    /// Paired in either form.
    #[must_use]
    pub fn is_paired(self) -> bool {
        self != Self::Unpaired
    }
}

/// Result of [`Channel::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum OpenOutcome {
    /// Handshake completed with the given trust
    Opened(PairingState),
    /// Device is locked. The channel has been closed; allocate a new one and
    /// open it with `force_unlock` to prompt the user.
    DeviceLocked,
}

enum NoiseState {
    Handshake(HandshakeState),
    Transport(TransportState),
}

/// Host side of one THP channel.
///
/// Channels are not thread-safe; each exclusively owns its transport handle.
/// Operations open a transport scope for their own duration, so callers
/// interleaving [`Channel::write_chunk`] and [`Channel::read_chunk`] over a
/// connectionful link should hold an outer scope via
/// [`Channel::transport_mut`].
pub struct Channel<T: Transport> {
    transport: T,
    config: ChannelConfig,
    channel_id: u16,
    prologue: Vec<u8>,
    device_properties: DeviceProperties,
    state: ChannelState,
    pairing_state: PairingState,
    sync_bit_send: bool,
    sync_bit_receive: bool,
    host_static_key: PrivateKey,
    noise: Option<NoiseState>,
}

/// Run `f` inside a transport scope, closing it on every path.
fn with_scope<T, R, F>(transport: &mut T, f: F) -> Result<R, Error>
where
    T: Transport,
    F: FnOnce(&mut T) -> Result<R, Error>,
{
    transport.open()?;
    let result = f(transport);
    match (result, transport.close()) {
        (result, Ok(())) => result,
        (Ok(_), Err(err)) => Err(err.into()),
        (Err(err), Err(close_err)) => {
            tracing::warn!("Failed to close transport: {}", close_err);
            Err(err)
        }
    }
}

impl<T: Transport> Channel<T> {
    /// Allocate a new channel on the device.
    ///
    /// Broadcasts an allocation request with a random nonce and waits for
    /// the response echoing it. Up to `config.allocation_retries` responses
    /// for other nonces are skipped before it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if no matching response arrives or the
    /// response is malformed, [`Error::Timeout`] if the device is silent.
    pub fn allocate(mut transport: T, config: ChannelConfig) -> Result<Self, Error> {
        let nonce: [u8; NONCE_LEN] = random_array()?;
        let request = Message::broadcast(CHANNEL_ALLOCATION_REQ, nonce.to_vec());

        let response = with_scope(&mut transport, |t| {
            write_message(t, &request)?;
            for _ in 0..=config.allocation_retries {
                let message = read_message(t, config.response_timeout, config.checksum_retries)?;
                if message.is_channel_allocation_response()
                    && message.data().len() >= NONCE_LEN + 2
                    && message.data()[..NONCE_LEN] == nonce
                {
                    return Ok(message);
                }
                tracing::debug!(
                    "Ignoring message 0x{:02x} while waiting for channel allocation",
                    message.ctrl_byte()
                );
            }
            Err(Error::protocol("no matching channel allocation response"))
        })?;

        let data = response.data();
        let channel_id = u16::from_be_bytes([data[NONCE_LEN], data[NONCE_LEN + 1]]);
        if channel_id > MAX_CHANNEL_ID {
            return Err(Error::protocol(format!(
                "device allocated reserved channel id {channel_id:#06x}"
            )));
        }
        let prologue = data[NONCE_LEN + 2..].to_vec();
        let device_properties = DeviceProperties::decode(prologue.as_slice())?;

        tracing::info!(
            "Allocated channel {:#06x} on {}",
            channel_id,
            device_properties.internal_model.as_deref().unwrap_or("unknown model")
        );

        Ok(Self {
            transport,
            config,
            channel_id,
            prologue,
            device_properties,
            state: ChannelState::Allocated,
            pairing_state: PairingState::Unpaired,
            sync_bit_send: false,
            sync_bit_receive: false,
            host_static_key: PrivateKey::random()?,
            noise: None,
        })
    }

    /// Drain stale responses from the link.
    ///
    /// Broadcasts a ping with a random nonce and discards everything until
    /// the matching pong arrives. `config.sync_timeout` is split evenly
    /// between the first ping and `config.sync_retries` repeats.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if no matching pong arrives.
    pub fn sync_responses(transport: &mut T, config: &ChannelConfig) -> Result<(), Error> {
        let nonce: [u8; NONCE_LEN] = random_array()?;
        let ping = Message::broadcast(PING, nonce.to_vec());
        let attempt_timeout = config.sync_timeout / (config.sync_retries + 1);

        with_scope(transport, |t| {
            for attempt in 0..=config.sync_retries {
                write_message(t, &ping)?;
                let deadline = Instant::now() + attempt_timeout;
                loop {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    match read_message(t, Some(remaining), 0) {
                        Ok(message) if message.is_pong() && message.data() == nonce => {
                            tracing::debug!("Responses synchronized after {} ping(s)", attempt + 1);
                            return Ok(());
                        }
                        Ok(message) => tracing::debug!(
                            "Discarding stale message 0x{:02x} on {:#06x}",
                            message.ctrl_byte(),
                            message.channel_id()
                        ),
                        Err(Error::Checksum { .. }) => {}
                        Err(Error::Timeout(_)) => break,
                        Err(err) => return Err(err),
                    }
                }
            }
            Err(Error::Timeout(format!(
                "no pong after {} ping(s)",
                config.sync_retries + 1
            )))
        })
    }

    /// Run the Noise XX handshake.
    ///
    /// `credentials` are searched for one issued by this device; if found,
    /// the host static key is replaced by the credential's before message 3
    /// and the credential is presented to the device. `force_unlock` asks a
    /// locked device to prompt for unlocking. Opening an open channel is a
    /// no-op.
    ///
    /// On any failure the channel is closed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StateMismatch`] unless the channel is freshly
    /// allocated, plus any protocol, timeout or crypto error of the
    /// handshake.
    pub fn open(
        &mut self,
        credentials: &[Credential],
        force_unlock: bool,
    ) -> Result<OpenOutcome, Error> {
        if self.is_handshake_done() {
            return Ok(OpenOutcome::Opened(self.pairing_state));
        }
        if self.state != ChannelState::Allocated {
            return Err(Error::StateMismatch(format!(
                "cannot open channel in state {:?}",
                self.state
            )));
        }

        self.noise = Some(NoiseState::Handshake(HandshakeState::initiator(
            &self.prologue,
            self.host_static_key.clone(),
        )));
        self.advance_state(ChannelState::HandshakePhase)?;

        let result = self.scoped(|channel| channel.handshake(credentials, force_unlock));
        match result {
            Ok(pairing_state) => Ok(OpenOutcome::Opened(pairing_state)),
            Err(Error::DeviceLocked) => {
                tracing::info!("Device is locked, closing channel {:#06x}", self.channel_id);
                self.close();
                Ok(OpenOutcome::DeviceLocked)
            }
            Err(err) => {
                tracing::warn!("Handshake on channel {:#06x} failed: {}", self.channel_id, err);
                self.close();
                Err(err)
            }
        }
    }

    fn handshake(
        &mut self,
        credentials: &[Credential],
        force_unlock: bool,
    ) -> Result<PairingState, Error> {
        let init = self.handshake_state()?.write_init(&[u8::from(force_unlock)])?;
        self.send_message(Message::new(HANDSHAKE_INIT_REQ, self.channel_id, init))?;

        // A locked device acknowledges the init request, then refuses it.
        let response = match self.read_data(self.config.response_timeout) {
            Err(Error::Thp(ThpErrorCode::DeviceLocked)) => return Err(Error::DeviceLocked),
            result => result?,
        };
        if !response.is_handshake_init_response() {
            return Err(Error::protocol(format!(
                "expected handshake init response, got 0x{:02x}",
                response.ctrl_byte()
            )));
        }
        self.send_ack(&response)?;
        let payload = self.handshake_state()?.read_response(response.data())?;
        if !payload.is_empty() {
            return Err(Error::protocol("unexpected handshake init response payload"));
        }

        let remote = self
            .handshake_state()?
            .remote_keys()
            .ok_or_else(|| Error::protocol("device keys missing after handshake message 2"))?;
        let completion_payload = self.select_credential(credentials, &remote)?;

        let (completion, transport) = match self.noise.take() {
            Some(NoiseState::Handshake(handshake)) => {
                handshake.write_completion(&completion_payload.encode_to_vec())?
            }
            _ => return Err(Error::ChannelClosed),
        };
        self.noise = Some(NoiseState::Transport(transport));
        self.send_message(Message::new(HANDSHAKE_COMP_REQ, self.channel_id, completion))?;

        let response = self.read_data(self.config.response_timeout)?;
        if !response.is_handshake_completion_response() {
            return Err(Error::protocol(format!(
                "expected handshake completion response, got 0x{:02x}",
                response.ctrl_byte()
            )));
        }
        self.send_ack(&response)?;
        let trust = self.transport_state()?.decrypt(response.data())?;
        let [byte] = trust.as_slice() else {
            return Err(Error::protocol(format!(
                "pairing state has {} bytes, expected 1",
                trust.len()
            )));
        };
        let pairing_state = PairingState::from_byte(*byte)?;

        self.pairing_state = pairing_state;
        self.advance_state(if pairing_state.is_paired() {
            ChannelState::CredentialPhase
        } else {
            ChannelState::PairingPhase
        })?;
        tracing::info!(
            "Channel {:#06x} opened ({:?})",
            self.channel_id,
            pairing_state
        );
        Ok(pairing_state)
    }

    fn select_credential(
        &mut self,
        credentials: &[Credential],
        remote: &TrezorPublicKeys,
    ) -> Result<HandshakeCompletionReqNoisePayload, Error> {
        let Some(credential) = find_credential(credentials, remote) else {
            tracing::debug!("No stored credential for this device");
            return Ok(HandshakeCompletionReqNoisePayload::default());
        };
        tracing::debug!("Presenting stored credential");
        let key = credential.host_private_key();
        self.host_static_key = key.clone();
        self.handshake_state()?.set_static_key(key);
        Ok(HandshakeCompletionReqNoisePayload {
            host_pairing_credential: Some(credential.credential.clone()),
        })
    }

    /// Drop all cryptographic state and mark the channel unallocated.
    pub fn close(&mut self) {
        if self.state != ChannelState::Unallocated {
            tracing::debug!(
                "Channel state transition: {:?} -> {:?}",
                self.state,
                ChannelState::Unallocated
            );
        }
        self.noise = None;
        self.state = ChannelState::Unallocated;
        self.pairing_state = PairingState::Unpaired;
    }

    /// Encrypt `data` and send it as one reliable transport message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] before the handshake completes,
    /// [`Error::Protocol`] if the ciphertext would not fit one message,
    /// otherwise any send error. A rejected write leaves the channel usable.
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<(), Error> {
        let state = self.transport_state()?;
        if data.len() + TAG_SIZE > MAX_DATA_LEN {
            return Err(Error::protocol(format!(
                "plaintext too long: {} bytes, at most {}",
                data.len(),
                MAX_DATA_LEN - TAG_SIZE
            )));
        }
        let ciphertext = state.encrypt(data)?;
        let message = Message::new(ENCRYPTED_TRANSPORT, self.channel_id, ciphertext);
        self.scoped(|channel| channel.send_message(message))
    }

    /// Receive, acknowledge and decrypt the next transport message.
    ///
    /// ACKs and messages for other channels are skipped. A data message of
    /// an unexpected type is logged and decrypted anyway.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] before the handshake completes,
    /// [`Error::Timeout`] if nothing arrives within `timeout`, or a crypto
    /// error if decryption fails.
    pub fn read_chunk(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>, Error> {
        self.transport_state()?;
        self.scoped(|channel| {
            let message = channel.read_data(timeout)?;
            if !message.is_encrypted_transport() {
                tracing::warn!(
                    "Expected encrypted transport message, got 0x{:02x}",
                    message.ctrl_byte()
                );
            }
            channel.send_ack(&message)?;
            Ok(channel.transport_state()?.decrypt(message.data())?)
        })
    }

    fn scoped<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R, Error>) -> Result<R, Error> {
        self.transport.open()?;
        let result = f(self);
        match (result, self.transport.close()) {
            (result, Ok(())) => result,
            (Ok(_), Err(err)) => Err(err.into()),
            (Err(err), Err(close_err)) => {
                tracing::warn!("Failed to close transport: {}", close_err);
                Err(err)
            }
        }
    }

    /// Send with the next sequence bit and wait for its ACK, retransmitting
    /// on timeouts and busy errors with exponential backoff.
    fn send_message(&mut self, message: Message) -> Result<(), Error> {
        let message = message.with_seq_bit(self.sync_bit_send);
        let chunks = message.chunks(self.transport.chunk_size())?;
        self.sync_bit_send = !self.sync_bit_send;

        let mut backoff = self.config.backoff();
        loop {
            for chunk in &chunks {
                self.transport.write_chunk(chunk)?;
            }
            let err = match self.read_ack(&message) {
                Ok(()) => return Ok(()),
                Err(err @ (Error::Timeout(_) | Error::Thp(ThpErrorCode::TransportBusy))) => err,
                Err(err) => return Err(err),
            };
            let Some(delay) = backoff.next_delay() else {
                tracing::warn!("Giving up on message 0x{:02x}: {}", message.ctrl_byte(), err);
                return Err(err);
            };
            tracing::debug!(
                "Retransmitting 0x{:02x} in {:?} ({}, {} retries left)",
                message.ctrl_byte(),
                delay,
                err,
                backoff.retries_left()
            );
            thread::sleep(delay);
        }
    }

    /// Wait for the ACK of `message` within one shared `ack_timeout` budget.
    fn read_ack(&mut self, message: &Message) -> Result<(), Error> {
        let start = Instant::now();
        let expected = message.seq_bit();
        for _ in 0..self.config.max_retransmission_count {
            let remaining = self.config.ack_timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                break;
            }
            let reply = read_message(
                &mut self.transport,
                Some(remaining),
                self.config.checksum_retries,
            )?;
            if reply.channel_id() != self.channel_id {
                continue;
            }
            if let Some(code) = reply.error_code() {
                return Err(Error::Thp(code));
            }
            if !reply.is_ack() || !reply.data().is_empty() {
                tracing::warn!(
                    "Skipping 0x{:02x} while waiting for ACK",
                    reply.ctrl_byte()
                );
                continue;
            }
            if reply.ack_bit() != expected {
                tracing::warn!("Skipping ACK for the other sequence bit");
                continue;
            }
            return Ok(());
        }
        Err(Error::Timeout(format!(
            "no ACK for 0x{:02x} within {:?}",
            message.ctrl_byte(),
            self.config.ack_timeout
        )))
    }

    fn send_ack(&mut self, message: &Message) -> Result<(), Error> {
        let ctrl_byte = crate::control_byte::make_ack_for(message.ctrl_byte())?;
        write_message(
            &mut self.transport,
            &Message::new(ctrl_byte, self.channel_id, Vec::new()),
        )
    }

    /// Read the next message for this channel.
    ///
    /// Repeated data messages (stale sequence bit) are acknowledged again
    /// and dropped. Device errors become [`Error::Thp`].
    fn read(&mut self, timeout: Option<Duration>) -> Result<Message, Error> {
        loop {
            let message = read_message(&mut self.transport, timeout, self.config.checksum_retries)?;
            if message.channel_id() != self.channel_id {
                tracing::trace!("Skipping message for channel {:#06x}", message.channel_id());
                continue;
            }
            if message.is_error() {
                let code = message
                    .error_code()
                    .ok_or_else(|| Error::protocol("error message without code"))?;
                return Err(Error::Thp(code));
            }
            if let Some(seq_bit) = message.seq_bit() {
                if seq_bit != self.sync_bit_receive {
                    tracing::debug!(
                        "Duplicate message 0x{:02x}, acknowledging again",
                        message.ctrl_byte()
                    );
                    self.send_ack(&message)?;
                    continue;
                }
                self.sync_bit_receive = !self.sync_bit_receive;
            }
            return Ok(message);
        }
    }

    /// Like [`Self::read`], skipping stray ACKs.
    fn read_data(&mut self, timeout: Option<Duration>) -> Result<Message, Error> {
        loop {
            let message = self.read(timeout)?;
            if message.is_ack() {
                tracing::debug!("Discarding stray ACK");
                continue;
            }
            return Ok(message);
        }
    }

    fn handshake_state(&mut self) -> Result<&mut HandshakeState, Error> {
        match self.noise.as_mut() {
            Some(NoiseState::Handshake(handshake)) => Ok(handshake),
            Some(NoiseState::Transport(_)) => Err(Error::StateMismatch(
                "handshake already completed".into(),
            )),
            None => Err(Error::ChannelClosed),
        }
    }

    fn transport_state(&mut self) -> Result<&mut TransportState, Error> {
        match self.noise.as_mut() {
            Some(NoiseState::Transport(transport)) => Ok(transport),
            _ => Err(Error::ChannelClosed),
        }
    }

    /// Move the channel forward to `to`. Staying in place is allowed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StateMismatch`] for a backward move.
    pub(crate) fn advance_state(&mut self, to: ChannelState) -> Result<(), Error> {
        if to < self.state {
            return Err(Error::StateMismatch(format!(
                "channel cannot move from {:?} back to {:?}",
                self.state, to
            )));
        }
        if to != self.state {
            tracing::debug!("Channel state transition: {:?} -> {:?}", self.state, to);
            self.state = to;
        }
        Ok(())
    }

    pub(crate) fn set_pairing_state(&mut self, pairing_state: PairingState) {
        self.pairing_state = pairing_state;
    }

    pub(crate) fn host_static_privkey(&self) -> [u8; 32] {
        self.host_static_key.to_bytes()
    }

    /// Device-assigned channel id.
    #[must_use]
    pub fn channel_id(&self) -> u16 {
        self.channel_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Trust reported by the device.
    #[must_use]
    pub fn pairing_state(&self) -> PairingState {
        self.pairing_state
    }

    /// The handshake completed and transport ciphers are available.
    #[must_use]
    pub fn is_handshake_done(&self) -> bool {
        matches!(self.noise, Some(NoiseState::Transport(_)))
    }

    /// Properties the device sent with the allocation.
    #[must_use]
    pub fn device_properties(&self) -> &DeviceProperties {
        &self.device_properties
    }

    /// Raw allocation prologue mixed into the handshake.
    #[must_use]
    pub fn prologue(&self) -> &[u8] {
        &self.prologue
    }

    /// Host static public key used (or to be used) in the handshake.
    #[must_use]
    pub fn host_static_pubkey(&self) -> [u8; 32] {
        self.host_static_key.public_key().to_bytes()
    }

    /// Handshake hash binding pairing messages to this channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] before the handshake completes.
    pub fn handshake_hash(&self) -> Result<[u8; 32], Error> {
        match &self.noise {
            Some(NoiseState::Transport(transport)) => Ok(transport.handshake_hash()),
            _ => Err(Error::ChannelClosed),
        }
    }

    /// Reliability configuration.
    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Underlying transport, e.g. to hold an outer connection scope.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Consume the channel, returning its transport.
    pub fn into_transport(self) -> T {
        self.transport
    }
}
