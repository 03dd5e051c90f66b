//! Pairing controller.
//!
//! Pairing runs on session 0 of a freshly opened channel and ends with the
//! channel in encrypted transport. The controller's lifecycle is derived
//! from the channel state plus two local flags, so it can never disagree
//! with the channel:
//!
//! ```text
//!                 start()                 method verified          finish()
//!   Initial ─────────────▶ PairingRequested ─────────────▶ PairingCompleted ─────▶ Finished
//!      │                        │                               │
//!      └────────────────────────┴──────── abort() ──────────────┴──────▶ Failed
//! ```

mod flow;
mod methods;

pub use flow::{CodeProvider, default_pairing_flow};
pub use methods::{
    CHALLENGE_LEN, CODE_ENTRY_DIGITS, CodeEntry, IMPLEMENTED_METHODS, NFC_SECRET_LEN, Nfc,
    PairingMethod, QR_CODE_LEN, QrCode, code_entry_code, nfc_tag, qr_code, qr_code_tag,
};

use crate::channel::{Channel, ChannelState, OpenOutcome, PairingState};
use crate::credential::Credential;
use crate::error::Error;
use crate::messages::{
    CredentialRequest, CredentialResponse, EndRequest, EndResponse, PairingMethodId,
    PairingRequest, PairingRequestApproved, SelectMethod, ThpMessage,
};
use crate::session::Session;
use thp_crypto::constant_time::ct_eq;
use thp_transport::Transport;

/// Pairing lifecycle, in order of progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ControllerLifecycle {
    /// Channel not open or pairing not requested yet
    Initial,
    /// Device approved the pairing request
    PairingRequested,
    /// Host is paired; credentials may be requested
    PairingCompleted,
    /// Channel is in encrypted transport
    Finished,
    /// Pairing was aborted
    Failed,
}

/// Derive the controller lifecycle from the channel state and local flags.
#[must_use]
pub fn derive_lifecycle(
    channel_state: ChannelState,
    pairing_requested: bool,
    failed: bool,
) -> ControllerLifecycle {
    if failed {
        return ControllerLifecycle::Failed;
    }
    match channel_state {
        ChannelState::EncryptedTransport => ControllerLifecycle::Finished,
        ChannelState::CredentialPhase => ControllerLifecycle::PairingCompleted,
        ChannelState::PairingPhase if pairing_requested => ControllerLifecycle::PairingRequested,
        _ => ControllerLifecycle::Initial,
    }
}

/// Drives pairing over one channel.
///
/// The controller holds a transport scope from [`PairingController::start`]
/// until [`PairingController::finish`] or [`PairingController::abort`] (or
/// drop), so out-of-band pairing steps that wait on the user keep the link
/// open.
pub struct PairingController<'a, T: Transport> {
    channel: &'a mut Channel<T>,
    session: Session,
    host_name: String,
    app_name: String,
    pairing_requested: bool,
    failed: bool,
    scope_open: bool,
}

impl<'a, T: Transport> PairingController<'a, T> {
    /// Create a controller for `channel`, identifying the host to the user
    /// by `host_name` and `app_name`.
    pub fn new(
        channel: &'a mut Channel<T>,
        host_name: impl Into<String>,
        app_name: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            session: Session::pairing(),
            host_name: host_name.into(),
            app_name: app_name.into(),
            pairing_requested: false,
            failed: false,
            scope_open: false,
        }
    }

    /// Current lifecycle.
    #[must_use]
    pub fn state(&self) -> ControllerLifecycle {
        derive_lifecycle(self.channel.state(), self.pairing_requested, self.failed)
    }

    /// Move to `target`, driving the channel state where the lifecycle
    /// depends on it. Setting the current state again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StateMismatch`] for backward moves, moves out of
    /// `Failed`, and moves the channel cannot support yet.
    pub fn set_state(&mut self, target: ControllerLifecycle) -> Result<(), Error> {
        let current = self.state();
        if target == current {
            return Ok(());
        }
        if target == ControllerLifecycle::Failed {
            self.failed = true;
            tracing::debug!("Pairing state transition: {:?} -> {:?}", current, target);
            return Ok(());
        }
        if current == ControllerLifecycle::Failed || target < current {
            return Err(Error::StateMismatch(format!(
                "pairing cannot move from {current:?} to {target:?}"
            )));
        }
        if self.channel.state() < ChannelState::PairingPhase {
            return Err(Error::StateMismatch(format!(
                "channel is {:?}, pairing needs an open channel",
                self.channel.state()
            )));
        }

        match target {
            ControllerLifecycle::PairingRequested => {
                if self.channel.state() != ChannelState::PairingPhase {
                    return Err(Error::StateMismatch(format!(
                        "cannot request pairing in channel state {:?}",
                        self.channel.state()
                    )));
                }
                self.pairing_requested = true;
            }
            ControllerLifecycle::PairingCompleted => {
                self.channel.advance_state(ChannelState::CredentialPhase)?;
            }
            ControllerLifecycle::Finished => {
                self.channel.advance_state(ChannelState::EncryptedTransport)?;
            }
            ControllerLifecycle::Initial | ControllerLifecycle::Failed => {}
        }
        tracing::debug!("Pairing state transition: {:?} -> {:?}", current, target);
        Ok(())
    }

    /// Open the connection scope and the channel if needed, then request
    /// pairing unless the device already trusts this host.
    ///
    /// `credentials` are offered during the handshake when the channel is
    /// not open yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StateMismatch`] after a failure,
    /// [`Error::DeviceLocked`] if the device is locked, or any channel or
    /// device error.
    pub fn start(&mut self, credentials: &[Credential]) -> Result<(), Error> {
        if self.failed {
            return Err(Error::StateMismatch("pairing has failed".into()));
        }
        if !self.scope_open {
            self.channel.transport_mut().open()?;
            self.scope_open = true;
        }
        if !self.channel.is_handshake_done() {
            match self.channel.open(credentials, false)? {
                OpenOutcome::Opened(pairing_state) => {
                    tracing::debug!("Channel opened for pairing ({:?})", pairing_state);
                }
                OpenOutcome::DeviceLocked => return Err(Error::DeviceLocked),
            }
        }

        if self.state() == ControllerLifecycle::Initial {
            let request = PairingRequest {
                host_name: Some(self.host_name.clone()),
                app_name: Some(self.app_name.clone()),
            };
            let _: PairingRequestApproved = self.call(&request)?;
            self.set_state(ControllerLifecycle::PairingRequested)?;
        }
        Ok(())
    }

    /// Pairing methods both advertised by the device and implemented here,
    /// in preference order.
    #[must_use]
    pub fn methods(&self) -> Vec<PairingMethodId> {
        let advertised = &self.channel.device_properties().pairing_methods;
        IMPLEMENTED_METHODS
            .iter()
            .copied()
            .filter(|method| advertised.contains(&(*method as i32)))
            .collect()
    }

    /// Whether the host is paired and pairing has not failed.
    #[must_use]
    pub fn is_paired(&self) -> bool {
        !self.failed && self.channel.pairing_state().is_paired()
    }

    /// Record successful pairing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StateMismatch`] if the channel cannot move to the
    /// credential phase.
    pub fn set_paired(&mut self) -> Result<(), Error> {
        if !self.channel.pairing_state().is_paired() {
            self.channel.set_pairing_state(PairingState::Paired);
        }
        self.set_state(ControllerLifecycle::PairingCompleted)
    }

    /// Ask the device for a credential bound to the current host static key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StateMismatch`] unless pairing is completed, and
    /// [`Error::Protocol`] for an incomplete response.
    pub fn request_credential(&mut self, autoconnect: bool) -> Result<Credential, Error> {
        let state = self.state();
        if state != ControllerLifecycle::PairingCompleted {
            return Err(Error::StateMismatch(format!(
                "credentials can only be requested after pairing, not in {state:?}"
            )));
        }
        let request = CredentialRequest {
            host_static_pubkey: Some(self.channel.host_static_pubkey().to_vec()),
            autoconnect: Some(autoconnect),
            credential: None,
        };
        let response: CredentialResponse = self.call(&request)?;
        let trezor_pubkey = response
            .trezor_static_pubkey
            .ok_or_else(|| Error::protocol("credential response without device key"))?;
        let credential = response
            .credential
            .ok_or_else(|| Error::protocol("credential response without credential"))?;
        Ok(Credential::new(
            trezor_pubkey,
            self.channel.host_static_privkey(),
            credential,
        ))
    }

    /// End pairing: send `EndRequest`, move the channel to encrypted
    /// transport and release the connection scope. Finishing twice is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StateMismatch`] before pairing completed.
    pub fn finish(&mut self) -> Result<(), Error> {
        self.finish_with(true)
    }

    pub(crate) fn finish_with(&mut self, send_end_request: bool) -> Result<(), Error> {
        match self.state() {
            ControllerLifecycle::Finished => return self.close_scope(),
            ControllerLifecycle::PairingCompleted => {}
            state => {
                return Err(Error::StateMismatch(format!(
                    "cannot finish pairing in {state:?}"
                )));
            }
        }
        if send_end_request {
            let _: EndResponse = self.call(&EndRequest {})?;
        }
        self.set_state(ControllerLifecycle::Finished)?;
        tracing::info!("Pairing finished on channel {:#06x}", self.channel.channel_id());
        self.close_scope()
    }

    /// Mark pairing failed, close the channel and release the connection
    /// scope.
    pub fn abort(&mut self) {
        tracing::warn!("Aborting pairing on channel {:#06x}", self.channel.channel_id());
        self.failed = true;
        self.channel.close();
        if let Err(err) = self.close_scope() {
            tracing::warn!("Failed to release transport: {}", err);
        }
    }

    /// Channel being paired.
    #[must_use]
    pub fn channel(&self) -> &Channel<T> {
        &*self.channel
    }

    /// Handshake hash of the channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] before the handshake completed.
    pub fn handshake_hash(&self) -> Result<[u8; 32], Error> {
        self.channel.handshake_hash()
    }

    pub(crate) fn call<Req: ThpMessage, Resp: ThpMessage>(
        &mut self,
        request: &Req,
    ) -> Result<Resp, Error> {
        self.session.call(self.channel, request)
    }

    /// Send `SelectMethod` and read the method's first device message.
    pub(crate) fn select_method<Resp: ThpMessage>(
        &mut self,
        method: PairingMethodId,
    ) -> Result<Resp, Error> {
        let state = self.state();
        if state != ControllerLifecycle::PairingRequested {
            return Err(Error::StateMismatch(format!(
                "cannot select a pairing method in {state:?}"
            )));
        }
        if !self.methods().contains(&method) {
            return Err(Error::protocol(format!(
                "pairing method {method:?} not offered by the device"
            )));
        }
        tracing::debug!("Selecting pairing method {:?}", method);
        self.call(&SelectMethod {
            selected_pairing_method: Some(method as i32),
        })
    }

    /// Abort unless `expected` equals `actual` in constant time.
    pub(crate) fn abort_if_not_equal(
        &mut self,
        expected: &[u8],
        actual: &[u8],
        what: &str,
    ) -> Result<(), Error> {
        if ct_eq(expected, actual) {
            return Ok(());
        }
        self.abort();
        Err(Error::protocol(format!("{what} mismatch")))
    }

    fn close_scope(&mut self) -> Result<(), Error> {
        if self.scope_open {
            self.scope_open = false;
            self.channel.transport_mut().close()?;
        }
        Ok(())
    }
}

impl<T: Transport> Drop for PairingController<'_, T> {
    fn drop(&mut self) {
        if let Err(err) = self.close_scope() {
            tracing::warn!("Failed to release transport: {}", err);
        }
    }
}
