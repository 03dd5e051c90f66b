//! In-memory THP device.
//!
//! [`SimulatedDevice`] is a cloneable handle to the device state; every
//! [`DeviceTransport`] it hands out feeds host chunks straight into the
//! device, which answers synchronously by queueing response chunks. A read
//! from an empty queue sleeps for its timeout and then reports it.
//!
//! The device follows the host-visible protocol closely enough to catch
//! host bugs:
//! - alternating sequence bits per direction, ACKs, duplicate detection
//!   that re-ACKs and repeats the unacknowledged response
//! - Noise XX responder with a masked static key
//! - pairing responder for skip, code entry (CPace), QR code and NFC
//! - credential issuing and credential-based reconnection

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use prost::Message as _;
use thp_core::control_byte::{
    self, CHANNEL_ALLOCATION_RES, ENCRYPTED_TRANSPORT, ERROR, HANDSHAKE_COMP_REQ,
    HANDSHAKE_COMP_RES, HANDSHAKE_INIT_REQ, HANDSHAKE_INIT_RES, PONG, PacketKind,
};
use thp_core::message::INIT_HEADER_LEN;
use thp_core::messages::{
    ButtonAck, ButtonRequest, CodeEntryChallenge, CodeEntryCommitment, CodeEntryCpaceHostTag,
    CodeEntryCpaceTrezor, CodeEntrySecret, CredentialRequest, CredentialResponse, EndRequest,
    EndResponse, Failure, HandshakeCompletionReqNoisePayload, NfcTagHost, NfcTagTrezor,
    PairingPreparationsFinished, PairingRequest, PairingRequestApproved, QrCodeSecret, QrCodeTag,
    SelectMethod,
};
use thp_core::pairing::{
    CHALLENGE_LEN, NFC_SECRET_LEN, QR_CODE_LEN, code_entry_code, nfc_tag, qr_code, qr_code_tag,
};
use thp_core::{
    DeviceProperties, Envelope, Message, PairingMethodId, Reassembler, ThpErrorCode, ThpMessage,
};
use thp_crypto::cpace::{self, CpaceKeys};
use thp_crypto::hash::sha256;
use thp_crypto::noise::TransportState;
use thp_crypto::random::random_array;
use thp_crypto::x25519::PrivateKey;
use thp_transport::{
    DEFAULT_CHUNK_SIZE, OpenCount, Transport, TransportError, TransportResult, TransportStats,
};

use super::responder::NoiseResponder;

/// Failure code the device uses for out-of-order messages
const FAILURE_UNEXPECTED_MESSAGE: i32 = 1;
/// Failure code the device uses for wrong pairing proofs
const FAILURE_DATA_ERROR: i32 = 3;

/// Static device behavior.
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    /// Internal model reported in the device properties
    pub internal_model: String,
    /// Advertised pairing methods
    pub pairing_methods: Vec<PairingMethodId>,
    /// Device starts locked and rejects handshakes without `force_unlock`
    pub locked: bool,
    /// Reveal pairing secrets even when the host's proof is wrong, so the
    /// host-side checks can be exercised
    pub lenient_proofs: bool,
    /// Precede the answer to a pairing request or application call with a
    /// `ButtonRequest`
    pub button_requests: bool,
    /// Channel id of the first allocation
    pub first_channel_id: u16,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            internal_model: "T3W1".into(),
            pairing_methods: vec![PairingMethodId::SkipPairing],
            locked: false,
            lenient_proofs: false,
            button_requests: false,
            first_channel_id: 0x1234,
        }
    }
}

/// Link faults, each counting down as it is applied.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Swallow this many ACKs the device would send
    pub drop_acks: u32,
    /// Answer this many host data messages with `TRANSPORT_BUSY`
    /// (`u32::MAX` keeps the device busy forever)
    pub busy_replies: u32,
    /// Precede this many device data messages with a corrupted copy
    pub corrupt_responses: u32,
    /// Repeat the previous data message before this many new ones, as if
    /// the host's ACK for it had been lost
    pub repeat_responses: u32,
    /// Precede the next allocation response with this many responses for
    /// another nonce
    pub stale_allocations: u32,
    /// Answer the next ping with a pong for another nonce first
    pub stale_pong: bool,
    /// Lock after the next handshake init, refusing its completion
    pub lock_at_completion: bool,
}

/// Credential issued by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCredential {
    /// Opaque credential blob
    pub blob: Vec<u8>,
    /// Host static key the credential is bound to
    pub host_static_pubkey: [u8; 32],
    /// Whether the credential allows autoconnect
    pub autoconnect: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Handshake,
    Pairing,
    Credential,
    Transport,
}

#[derive(Default)]
struct PairingSim {
    requested: bool,
    code_entry_secret: Option<[u8; 16]>,
    code: Option<u32>,
    cpace: Option<CpaceKeys>,
    qr_secret: Option<[u8; 16]>,
    nfc_secret: Option<[u8; NFC_SECRET_LEN]>,
}

struct SimChannel {
    prologue: Vec<u8>,
    phase: Phase,
    responder: Option<NoiseResponder>,
    transport: Option<TransportState>,
    recv_seq: bool,
    send_seq: bool,
    unacked: Option<Message>,
    last_sent: Option<Message>,
    host_static: [u8; 32],
    pairing: PairingSim,
    pending: Option<Envelope>,
}

impl SimChannel {
    fn new(prologue: Vec<u8>) -> Self {
        Self {
            prologue,
            phase: Phase::Handshake,
            responder: None,
            transport: None,
            recv_seq: false,
            send_seq: false,
            unacked: None,
            last_sent: None,
            host_static: [0u8; 32],
            pairing: PairingSim::default(),
            pending: None,
        }
    }

    fn handshake_hash(&self) -> Option<[u8; 32]> {
        self.transport.as_ref().map(TransportState::handshake_hash)
    }
}

struct DeviceState {
    options: DeviceOptions,
    faults: Faults,
    static_key: PrivateKey,
    locked: bool,
    next_channel_id: u16,
    channels: HashMap<u16, SimChannel>,
    outbound: VecDeque<Vec<u8>>,
    inbound: Option<Reassembler>,
    received: Vec<Message>,
    issued: Vec<IssuedCredential>,
    nfc_host_secret: Option<Vec<u8>>,
    last_channel: Option<u16>,
    chunk_size: usize,
}

/// Handle to a simulated device.
#[derive(Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatedDevice {
    /// Create a device with `options`.
    ///
    /// # Panics
    ///
    /// Panics if randomness is unavailable.
    #[must_use]
    pub fn new(options: DeviceOptions) -> Self {
        let state = DeviceState {
            locked: options.locked,
            next_channel_id: options.first_channel_id,
            options,
            faults: Faults::default(),
            static_key: PrivateKey::random().expect("randomness"),
            channels: HashMap::new(),
            outbound: VecDeque::new(),
            inbound: None,
            received: Vec::new(),
            issued: Vec::new(),
            nfc_host_secret: None,
            last_channel: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Device advertising only `methods`.
    #[must_use]
    pub fn with_methods(methods: &[PairingMethodId]) -> Self {
        Self::new(DeviceOptions {
            pairing_methods: methods.to_vec(),
            ..DeviceOptions::default()
        })
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A new transport connected to this device.
    #[must_use]
    pub fn transport(&self) -> DeviceTransport {
        DeviceTransport {
            device: self.clone(),
            opens: OpenCount::default(),
            stats: TransportStats::new(),
        }
    }

    /// Install link faults.
    pub fn set_faults(&self, faults: Faults) {
        self.lock().faults = faults;
    }

    /// Lock or unlock the device.
    pub fn set_locked(&self, locked: bool) {
        self.lock().locked = locked;
    }

    /// Whether the device is locked.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock().locked
    }

    /// Device static public key.
    #[must_use]
    pub fn static_pubkey(&self) -> [u8; 32] {
        self.lock().static_key.public_key().to_bytes()
    }

    /// Every complete message the host sent, in order.
    #[must_use]
    pub fn received(&self) -> Vec<Message> {
        self.lock().received.clone()
    }

    /// Number of received messages matching `predicate`.
    pub fn count_received(&self, predicate: impl Fn(&Message) -> bool) -> usize {
        self.lock().received.iter().filter(|m| predicate(m)).count()
    }

    /// Credentials issued so far.
    #[must_use]
    pub fn issued_credentials(&self) -> Vec<IssuedCredential> {
        self.lock().issued.clone()
    }

    /// Code shown on the screen during code entry pairing.
    #[must_use]
    pub fn shown_code(&self) -> Option<u32> {
        let state = self.lock();
        state.current().and_then(|channel| channel.pairing.code)
    }

    /// QR code shown on the screen during QR code pairing.
    #[must_use]
    pub fn shown_qr_code(&self) -> Option<[u8; QR_CODE_LEN]> {
        let state = self.lock();
        let channel = state.current()?;
        let secret = channel.pairing.qr_secret?;
        Some(qr_code(&channel.handshake_hash()?, &secret))
    }

    /// Secret the device exposes over NFC.
    #[must_use]
    pub fn nfc_secret(&self) -> Option<[u8; NFC_SECRET_LEN]> {
        self.lock().current().and_then(|channel| channel.pairing.nfc_secret)
    }

    /// Hand the host's NFC secret to the device.
    pub fn deliver_nfc_host_secret(&self, secret: &[u8]) {
        self.lock().nfc_host_secret = Some(secret.to_vec());
    }

    /// Channel ids currently known to the device.
    #[must_use]
    pub fn channel_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.lock().channels.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Queue a raw chunk for the host, bypassing the protocol.
    pub fn inject_chunk(&self, chunk: Vec<u8>) {
        self.lock().outbound.push_back(chunk);
    }

    /// Queue a complete message for the host, bypassing the protocol.
    ///
    /// # Panics
    ///
    /// Panics if the message cannot be chunked.
    pub fn inject_message(&self, message: &Message) {
        let mut state = self.lock();
        let chunks = message.chunks(state.chunk_size).expect("chunkable message");
        state.outbound.extend(chunks);
    }

    /// Chunks queued for the host and not read yet.
    #[must_use]
    pub fn pending_chunks(&self) -> usize {
        self.lock().outbound.len()
    }
}

impl DeviceState {
    fn current(&self) -> Option<&SimChannel> {
        self.last_channel.and_then(|id| self.channels.get(&id))
    }

    fn write_chunk(&mut self, chunk: &[u8]) {
        let Some(&ctrl) = chunk.first() else {
            return;
        };
        if control_byte::is_continuation(ctrl) {
            let Some(reassembler) = self.inbound.as_mut() else {
                return;
            };
            if reassembler.push(chunk).is_err() {
                return;
            }
        } else {
            match Reassembler::start(chunk) {
                Ok(reassembler) => self.inbound = Some(reassembler),
                Err(_) => return,
            }
        }

        if self.inbound.as_ref().is_some_and(Reassembler::is_complete) {
            if let Some(reassembler) = self.inbound.take() {
                if let Ok(message) = reassembler.finish() {
                    self.handle(message);
                }
            }
        }
    }

    fn handle(&mut self, message: Message) {
        self.received.push(message.clone());
        match control_byte::classify(message.ctrl_byte()) {
            PacketKind::ChannelAllocationRequest => self.allocate(message.data()),
            PacketKind::Ping => self.pong(message.data()),
            PacketKind::Ack => {
                if let Some(channel) = self.channels.get_mut(&message.channel_id()) {
                    let acked = channel.unacked.as_ref().and_then(Message::seq_bit);
                    if acked.is_some() && acked == message.ack_bit() {
                        channel.unacked = None;
                    }
                }
            }
            PacketKind::Data => self.handle_data(message),
            _ => {}
        }
    }

    fn allocate(&mut self, nonce: &[u8]) {
        let properties = DeviceProperties {
            internal_model: Some(self.options.internal_model.clone()),
            model_variant: Some(0),
            protocol_version_major: Some(2),
            protocol_version_minor: Some(0),
            pairing_methods: self
                .options
                .pairing_methods
                .iter()
                .map(|&method| method as i32)
                .collect(),
        };
        let prologue = properties.encode_to_vec();

        for _ in 0..std::mem::take(&mut self.faults.stale_allocations) {
            let mut stale = vec![0xEE; nonce.len()];
            stale.extend_from_slice(&0x0BADu16.to_be_bytes());
            stale.extend_from_slice(&prologue);
            self.emit(Message::broadcast(CHANNEL_ALLOCATION_RES, stale));
        }

        let channel_id = self.next_channel_id;
        self.next_channel_id = self.next_channel_id.wrapping_add(1);
        let mut data = nonce.to_vec();
        data.extend_from_slice(&channel_id.to_be_bytes());
        data.extend_from_slice(&prologue);

        self.channels.insert(channel_id, SimChannel::new(prologue));
        self.last_channel = Some(channel_id);
        self.emit(Message::broadcast(CHANNEL_ALLOCATION_RES, data));
    }

    fn pong(&mut self, nonce: &[u8]) {
        if std::mem::take(&mut self.faults.stale_pong) {
            self.emit(Message::broadcast(PONG, vec![0xEE; nonce.len()]));
        }
        self.emit(Message::broadcast(PONG, nonce.to_vec()));
    }

    fn send_error(&mut self, channel_id: u16, code: ThpErrorCode) {
        self.emit(Message::new(ERROR, channel_id, vec![code.as_u8()]));
    }

    fn send_ack(&mut self, message: &Message) {
        if self.faults.drop_acks > 0 {
            self.faults.drop_acks -= 1;
            return;
        }
        if let Ok(ctrl) = control_byte::make_ack_for(message.ctrl_byte()) {
            self.emit(Message::new(ctrl, message.channel_id(), Vec::new()));
        }
    }

    fn send_data(&mut self, channel_id: u16, channel: &mut SimChannel, ctrl: u8, data: Vec<u8>) {
        let message = Message::new(ctrl, channel_id, data).with_seq_bit(channel.send_seq);
        channel.send_seq = !channel.send_seq;
        if self.faults.repeat_responses > 0 {
            if let Some(previous) = channel.last_sent.clone() {
                self.faults.repeat_responses -= 1;
                self.emit(previous);
            }
        }
        channel.unacked = Some(message.clone());
        channel.last_sent = Some(message.clone());
        self.emit_data(message);
    }

    fn emit_data(&mut self, message: Message) {
        if self.faults.corrupt_responses > 0 {
            self.faults.corrupt_responses -= 1;
            if let Ok(mut chunks) = message.chunks(self.chunk_size) {
                chunks[0][INIT_HEADER_LEN] ^= 0xFF;
                self.outbound.extend(chunks);
            }
        }
        self.emit(message);
    }

    fn emit(&mut self, message: Message) {
        if let Ok(chunks) = message.chunks(self.chunk_size) {
            self.outbound.extend(chunks);
        }
    }

    fn handle_data(&mut self, message: Message) {
        let channel_id = message.channel_id();
        let Some(mut channel) = self.channels.remove(&channel_id) else {
            self.send_error(channel_id, ThpErrorCode::UnallocatedChannel);
            return;
        };

        if self.faults.busy_replies > 0 {
            if self.faults.busy_replies != u32::MAX {
                self.faults.busy_replies -= 1;
            }
            self.send_error(channel_id, ThpErrorCode::TransportBusy);
            self.channels.insert(channel_id, channel);
            return;
        }

        let seq = message.seq_bit().unwrap_or(false);
        if seq != channel.recv_seq {
            self.send_ack(&message);
            if let Some(unacked) = channel.unacked.clone() {
                self.emit_data(unacked);
            }
            self.channels.insert(channel_id, channel);
            return;
        }

        let keep = match message.ctrl_byte() & control_byte::DATA_MASK {
            HANDSHAKE_INIT_REQ => self.handshake_init(channel_id, &mut channel, &message),
            HANDSHAKE_COMP_REQ => self.handshake_completion(channel_id, &mut channel, &message),
            ENCRYPTED_TRANSPORT => self.encrypted(channel_id, &mut channel, &message),
            _ => {
                self.send_error(channel_id, ThpErrorCode::Unknown(0x7F));
                true
            }
        };
        if keep {
            self.channels.insert(channel_id, channel);
        }
    }

    fn accept(&mut self, channel: &mut SimChannel, message: &Message) {
        channel.recv_seq = !channel.recv_seq;
        self.send_ack(message);
    }

    fn handshake_init(&mut self, channel_id: u16, channel: &mut SimChannel, message: &Message) -> bool {
        if channel.phase != Phase::Handshake || channel.responder.is_some() {
            self.send_error(channel_id, ThpErrorCode::Unknown(0x7F));
            return true;
        }
        let Ok(mut responder) = NoiseResponder::new(&channel.prologue, self.static_key.clone())
        else {
            return false;
        };
        let Ok(payload) = responder.read_init(message.data()) else {
            self.send_error(channel_id, ThpErrorCode::DecryptionFailed);
            return false;
        };
        let force_unlock = payload.first().is_some_and(|&flag| flag != 0);
        if self.locked {
            if !force_unlock {
                self.accept(channel, message);
                self.send_error(channel_id, ThpErrorCode::DeviceLocked);
                return false;
            }
            // the user unlocks on the prompt
            self.locked = false;
        }

        self.accept(channel, message);
        let Ok(response) = responder.write_response() else {
            return false;
        };
        channel.responder = Some(responder);
        self.send_data(channel_id, channel, HANDSHAKE_INIT_RES, response);
        true
    }

    fn handshake_completion(
        &mut self,
        channel_id: u16,
        channel: &mut SimChannel,
        message: &Message,
    ) -> bool {
        let Some(responder) = channel.responder.take() else {
            self.send_error(channel_id, ThpErrorCode::Unknown(0x7F));
            return true;
        };
        let Ok((payload, host_static, mut transport)) = responder.read_completion(message.data())
        else {
            self.send_error(channel_id, ThpErrorCode::DecryptionFailed);
            return false;
        };
        self.accept(channel, message);
        if std::mem::take(&mut self.faults.lock_at_completion) {
            self.locked = true;
            self.send_error(channel_id, ThpErrorCode::DeviceLocked);
            return false;
        }

        let credential = HandshakeCompletionReqNoisePayload::decode(payload.as_slice())
            .ok()
            .and_then(|payload| payload.host_pairing_credential);
        let issued = credential.and_then(|blob| {
            self.issued
                .iter()
                .find(|issued| issued.blob == blob && issued.host_static_pubkey == host_static)
                .cloned()
        });
        let trust = match issued {
            Some(issued) if issued.autoconnect => 2u8,
            Some(_) => 1,
            None => 0,
        };
        channel.phase = if trust == 0 {
            Phase::Pairing
        } else {
            Phase::Credential
        };
        channel.host_static = host_static;

        let Ok(state) = transport.encrypt(&[trust]) else {
            return false;
        };
        channel.transport = Some(transport);
        self.send_data(channel_id, channel, HANDSHAKE_COMP_RES, state);
        true
    }

    fn encrypted(&mut self, channel_id: u16, channel: &mut SimChannel, message: &Message) -> bool {
        let plaintext = match channel.transport.as_mut().map(|t| t.decrypt(message.data())) {
            Some(Ok(plaintext)) => plaintext,
            Some(Err(_)) => {
                self.send_error(channel_id, ThpErrorCode::DecryptionFailed);
                return true;
            }
            None => {
                self.send_error(channel_id, ThpErrorCode::Unknown(0x7F));
                return true;
            }
        };
        self.accept(channel, message);

        let Ok(request) = Envelope::decode(&plaintext) else {
            return true;
        };
        let reply = if request.session_id == 0 {
            self.pairing_reply(channel, &request)
        } else {
            self.application_reply(channel, request)
        };

        let Some(transport) = channel.transport.as_mut() else {
            return true;
        };
        let Ok(ciphertext) = transport.encrypt(&reply.encode()) else {
            return true;
        };
        self.send_data(channel_id, channel, ENCRYPTED_TRANSPORT, ciphertext);
        true
    }

    fn application_reply(&mut self, channel: &mut SimChannel, request: Envelope) -> Envelope {
        if request.message_type == ButtonAck::MESSAGE_TYPE {
            if let Some(pending) = channel.pending.take() {
                return pending;
            }
        }
        if channel.phase != Phase::Transport {
            return failure(request.session_id, FAILURE_UNEXPECTED_MESSAGE, "Channel not ready");
        }
        // echo service
        let echo = request.clone();
        self.with_button_request(channel, request.session_id, echo)
    }

    fn with_button_request(
        &mut self,
        channel: &mut SimChannel,
        session_id: u8,
        reply: Envelope,
    ) -> Envelope {
        if !self.options.button_requests {
            return reply;
        }
        channel.pending = Some(reply);
        envelope(
            session_id,
            &ButtonRequest {
                code: Some(1),
                pages: None,
                name: Some("confirm".into()),
            },
        )
    }

    fn pairing_reply(&mut self, channel: &mut SimChannel, request: &Envelope) -> Envelope {
        match self.pairing_step(channel, request) {
            Ok(reply) => reply,
            Err(message) => failure(0, FAILURE_UNEXPECTED_MESSAGE, message),
        }
    }

    fn pairing_step(
        &mut self,
        channel: &mut SimChannel,
        request: &Envelope,
    ) -> Result<Envelope, &'static str> {
        let payload = request.payload.as_slice();
        let hh = channel.handshake_hash().ok_or("No handshake")?;
        let lenient = self.options.lenient_proofs;

        match request.message_type {
            PairingRequest::MESSAGE_TYPE => {
                if channel.phase != Phase::Pairing || channel.pairing.requested {
                    return Err("Unexpected pairing request");
                }
                PairingRequest::decode(payload).map_err(|_| "Malformed pairing request")?;
                channel.pairing.requested = true;
                let approved = envelope(0, &PairingRequestApproved {});
                Ok(self.with_button_request(channel, 0, approved))
            }
            ButtonAck::MESSAGE_TYPE => channel.pending.take().ok_or("Unexpected button ack"),
            SelectMethod::MESSAGE_TYPE => {
                if channel.phase != Phase::Pairing || !channel.pairing.requested {
                    return Err("Pairing not requested");
                }
                let select = SelectMethod::decode(payload).map_err(|_| "Malformed select")?;
                let method = select
                    .selected_pairing_method
                    .and_then(|id| PairingMethodId::try_from(id).ok())
                    .ok_or("Unknown pairing method")?;
                if !self.options.pairing_methods.contains(&method) {
                    return Err("Pairing method not offered");
                }
                let random = random_array::<16>().map_err(|_| "No randomness")?;
                match method {
                    PairingMethodId::SkipPairing => {
                        channel.phase = Phase::Transport;
                        Ok(envelope(0, &EndResponse {}))
                    }
                    PairingMethodId::CodeEntry => {
                        channel.pairing.code_entry_secret = Some(random);
                        Ok(envelope(
                            0,
                            &CodeEntryCommitment {
                                commitment: Some(sha256(&random).to_vec()),
                            },
                        ))
                    }
                    PairingMethodId::QrCode => {
                        channel.pairing.qr_secret = Some(random);
                        Ok(envelope(0, &PairingPreparationsFinished {}))
                    }
                    PairingMethodId::Nfc => {
                        channel.pairing.nfc_secret = Some(random);
                        Ok(envelope(0, &PairingPreparationsFinished {}))
                    }
                }
            }
            CodeEntryChallenge::MESSAGE_TYPE => {
                let secret = channel
                    .pairing
                    .code_entry_secret
                    .ok_or("Code entry not selected")?;
                let challenge = CodeEntryChallenge::decode(payload)
                    .ok()
                    .and_then(|c| c.challenge)
                    .filter(|c| c.len() == CHALLENGE_LEN)
                    .ok_or("Malformed challenge")?;
                let code = code_entry_code(&hh, &secret, &challenge);
                let keys = CpaceKeys::generate(code, &hh).map_err(|_| "CPace failed")?;
                let public_key = keys.public_key();
                channel.pairing.code = Some(code);
                channel.pairing.cpace = Some(keys);
                Ok(envelope(
                    0,
                    &CodeEntryCpaceTrezor {
                        cpace_trezor_public_key: Some(public_key.to_vec()),
                    },
                ))
            }
            CodeEntryCpaceHostTag::MESSAGE_TYPE => {
                let keys = channel.pairing.cpace.take().ok_or("No challenge")?;
                let secret = channel
                    .pairing
                    .code_entry_secret
                    .ok_or("Code entry not selected")?;
                let host_tag = CodeEntryCpaceHostTag::decode(payload)
                    .map_err(|_| "Malformed host tag")?;
                let host_public: [u8; 32] = host_tag
                    .cpace_host_public_key
                    .as_deref()
                    .and_then(|key| key.try_into().ok())
                    .ok_or("Malformed host CPace key")?;
                let shared = keys.shared_secret(&host_public).map_err(|_| "CPace failed")?;
                let valid = host_tag.tag.as_deref() == Some(cpace::tag(&shared).as_slice());
                if !valid && !lenient {
                    return Ok(failure(0, FAILURE_DATA_ERROR, "Unexpected code entry tag"));
                }
                if valid {
                    channel.phase = Phase::Credential;
                }
                Ok(envelope(
                    0,
                    &CodeEntrySecret {
                        secret: Some(secret.to_vec()),
                    },
                ))
            }
            QrCodeTag::MESSAGE_TYPE => {
                let secret = channel.pairing.qr_secret.ok_or("QR code not selected")?;
                let tag = QrCodeTag::decode(payload)
                    .ok()
                    .and_then(|t| t.tag)
                    .ok_or("Malformed QR tag")?;
                let valid = tag == qr_code_tag(&hh, &qr_code(&hh, &secret));
                if !valid && !lenient {
                    return Ok(failure(0, FAILURE_DATA_ERROR, "Unexpected QR code tag"));
                }
                if valid {
                    channel.phase = Phase::Credential;
                }
                Ok(envelope(
                    0,
                    &QrCodeSecret {
                        secret: Some(secret.to_vec()),
                    },
                ))
            }
            NfcTagHost::MESSAGE_TYPE => {
                let secret = channel.pairing.nfc_secret.ok_or("NFC not selected")?;
                let tag = NfcTagHost::decode(payload)
                    .ok()
                    .and_then(|t| t.tag)
                    .ok_or("Malformed NFC tag")?;
                let valid = tag == nfc_tag(&hh, &secret);
                if !valid && !lenient {
                    return Ok(failure(0, FAILURE_DATA_ERROR, "Unexpected NFC tag"));
                }
                let host_secret = self.nfc_host_secret.take().ok_or("No NFC host secret")?;
                if valid {
                    channel.phase = Phase::Credential;
                }
                Ok(envelope(
                    0,
                    &NfcTagTrezor {
                        tag: Some(nfc_tag(&hh, &host_secret).to_vec()),
                    },
                ))
            }
            CredentialRequest::MESSAGE_TYPE => {
                if channel.phase != Phase::Credential {
                    return Err("Not paired");
                }
                let request =
                    CredentialRequest::decode(payload).map_err(|_| "Malformed credential request")?;
                let host_static_pubkey: [u8; 32] = request
                    .host_static_pubkey
                    .as_deref()
                    .and_then(|key| key.try_into().ok())
                    .ok_or("Malformed host key")?;
                if host_static_pubkey != channel.host_static {
                    return Err("Host key does not match the channel");
                }
                let blob = random_array::<24>().map_err(|_| "No randomness")?.to_vec();
                self.issued.push(IssuedCredential {
                    blob: blob.clone(),
                    host_static_pubkey,
                    autoconnect: request.autoconnect.unwrap_or(false),
                });
                Ok(envelope(
                    0,
                    &CredentialResponse {
                        trezor_static_pubkey: Some(
                            self.static_key.public_key().to_bytes().to_vec(),
                        ),
                        credential: Some(blob),
                    },
                ))
            }
            EndRequest::MESSAGE_TYPE => {
                if channel.phase != Phase::Credential {
                    return Err("Not paired");
                }
                channel.phase = Phase::Transport;
                Ok(envelope(0, &EndResponse {}))
            }
            _ => Err("Unexpected message"),
        }
    }
}

fn envelope<M: ThpMessage>(session_id: u8, message: &M) -> Envelope {
    Envelope {
        session_id,
        message_type: M::MESSAGE_TYPE,
        payload: message.encode_to_vec(),
    }
}

fn failure(session_id: u8, code: i32, message: &str) -> Envelope {
    envelope(
        session_id,
        &Failure {
            code: Some(code),
            message: Some(message.into()),
        },
    )
}

/// Transport connected to a [`SimulatedDevice`].
pub struct DeviceTransport {
    device: SimulatedDevice,
    opens: OpenCount,
    stats: TransportStats,
}

impl DeviceTransport {
    /// Whether a connection scope is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.opens.is_open()
    }

    /// The device behind this transport.
    #[must_use]
    pub fn device(&self) -> &SimulatedDevice {
        &self.device
    }
}

impl Transport for DeviceTransport {
    fn chunk_size(&self) -> usize {
        self.device.lock().chunk_size
    }

    fn open(&mut self) -> TransportResult<()> {
        self.opens.enter();
        Ok(())
    }

    fn close(&mut self) -> TransportResult<()> {
        self.opens.leave();
        Ok(())
    }

    fn write_chunk(&mut self, chunk: &[u8]) -> TransportResult<()> {
        if !self.opens.is_open() {
            return Err(TransportError::Closed);
        }
        let mut state = self.device.lock();
        if chunk.len() != state.chunk_size {
            return Err(TransportError::InvalidChunkSize {
                expected: state.chunk_size,
                actual: chunk.len(),
            });
        }
        state.write_chunk(chunk);
        self.stats.record_send(chunk.len());
        Ok(())
    }

    fn read_chunk(&mut self, timeout: Option<Duration>) -> TransportResult<Vec<u8>> {
        if !self.opens.is_open() {
            return Err(TransportError::Closed);
        }
        let chunk = self.device.lock().outbound.pop_front();
        match chunk {
            Some(chunk) => {
                self.stats.record_recv(chunk.len());
                Ok(chunk)
            }
            None => {
                // The device answers synchronously, so nothing can arrive while waiting.
                let timeout = timeout.unwrap_or_default();
                std::thread::sleep(timeout);
                self.stats.record_timeout();
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}
