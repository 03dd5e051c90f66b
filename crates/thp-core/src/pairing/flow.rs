//! Default pairing policy.

use super::{ControllerLifecycle, PairingController};
use crate::credential::Credential;
use crate::error::Error;
use crate::messages::PairingMethodId;
use crate::pairing::methods::{CodeEntry, PairingMethod};
use thp_transport::Transport;

/// Source of the code entry code, typically a prompt to the user.
pub trait CodeProvider {
    /// Return the six digit code shown on the device.
    ///
    /// # Errors
    ///
    /// Any error aborts pairing.
    fn code(&mut self) -> Result<u32, Error>;
}

impl<F> CodeProvider for F
where
    F: FnMut() -> Result<u32, Error>,
{
    fn code(&mut self) -> Result<u32, Error> {
        self()
    }
}

/// Pair with the device using the simplest method it offers.
///
/// Already trusted hosts skip the pairing methods and get no new
/// credential. Otherwise skip pairing
/// is preferred; code entry needs a `code_provider`. With
/// `request_credential` set, a credential is requested after a method that
/// leaves room for one (every method but skip pairing). The flow always
/// ends with the channel in encrypted transport.
///
/// Any failure aborts the controller.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if no usable method is offered, plus any
/// error of the steps.
pub fn default_pairing_flow<T: Transport>(
    controller: &mut PairingController<'_, T>,
    credentials: &[Credential],
    code_provider: Option<&mut dyn CodeProvider>,
    request_credential: bool,
) -> Result<Option<Credential>, Error> {
    let result = run(controller, credentials, code_provider, request_credential);
    if result.is_err() && controller.state() != ControllerLifecycle::Failed {
        controller.abort();
    }
    result
}

fn run<T: Transport>(
    controller: &mut PairingController<'_, T>,
    credentials: &[Credential],
    code_provider: Option<&mut dyn CodeProvider>,
    request_credential: bool,
) -> Result<Option<Credential>, Error> {
    controller.start(credentials)?;

    if controller.is_paired() {
        tracing::info!("Host already paired");
        controller.finish()?;
        return Ok(None);
    }

    let methods = controller.methods();
    if methods.contains(&PairingMethodId::SkipPairing) {
        PairingMethod::setup(PairingMethodId::SkipPairing, controller)?;
    } else if methods.contains(&PairingMethodId::CodeEntry) {
        let provider = code_provider
            .ok_or_else(|| Error::protocol("code entry pairing needs a code provider"))?;
        let method = CodeEntry::setup(controller)?;
        let code = provider.code()?;
        method.send_code(controller, code)?;
    } else {
        return Err(Error::protocol(format!(
            "no supported pairing method among {methods:?}"
        )));
    }

    let credential = if request_credential
        && controller.state() == ControllerLifecycle::PairingCompleted
    {
        Some(controller.request_credential(false)?)
    } else {
        None
    };
    controller.finish()?;
    Ok(credential)
}
