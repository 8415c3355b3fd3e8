//! Render decision for the presentation layer.
//!
//! [`gate`] maps an [`EncryptionState`] to one of four branches. Features
//! render their children only behind [`GateView::Children`] and get their
//! crypto through [`EncryptionController::session`].
//!
//! [`EncryptionController::session`]: crate::controller::EncryptionController::session

use url::Url;

use crate::controller::{EncryptionState, StateError};
use crate::error::{E2eeError, ErrorKind, Result, GENERIC_UNLOCK_MESSAGE};

/// Query parameter the setup service reads to send the user back.
pub const RETURN_TO_PARAM: &str = "return_to";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// Locked, nothing went wrong yet.
    Unlock,
    /// The last attempt failed; the same action may succeed.
    Retry,
    /// This client cannot do passkeys or PRF. Retrying will not help.
    Unsupported,
    /// Encryption cannot run in this context at all.
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptView {
    pub kind: PromptKind,
    pub message: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateView {
    Loading,
    /// Send the user to the setup service.
    Redirect,
    Prompt(PromptView),
    Children,
}

const UNLOCK_MESSAGE: &str = "Unlock your encrypted data with your passkey.";

pub fn gate(state: &EncryptionState) -> GateView {
    match state {
        EncryptionState::Loading => GateView::Loading,
        EncryptionState::Unlocked => GateView::Children,
        EncryptionState::LockedNeedsSetup => GateView::Redirect,
        EncryptionState::LockedNeedsUnlock { error: None } => GateView::Prompt(PromptView {
            kind: PromptKind::Unlock,
            message: UNLOCK_MESSAGE,
        }),
        EncryptionState::LockedNeedsUnlock { error: Some(err) } => GateView::Prompt(failed(err)),
        EncryptionState::Error(err) => GateView::Prompt(match err.kind {
            ErrorKind::StorageError => PromptView {
                kind: PromptKind::Blocked,
                message: err.message,
            },
            _ => failed(err),
        }),
    }
}

fn failed(err: &StateError) -> PromptView {
    match err.kind {
        ErrorKind::PasskeyNotSupported | ErrorKind::PrfNotSupported => PromptView {
            kind: PromptKind::Unsupported,
            message: err.message,
        },
        _ => PromptView {
            kind: PromptKind::Retry,
            message: GENERIC_UNLOCK_MESSAGE,
        },
    }
}

/// Builds redirects to the external passkey setup service.
#[derive(Debug, Clone)]
pub struct SetupRedirect {
    base: Url,
}

impl SetupRedirect {
    pub fn new(setup_url: &str) -> Result<Self> {
        let base = Url::parse(setup_url).map_err(|e| E2eeError::Config(format!("setup_url: {e}")))?;
        Ok(Self { base })
    }

    /// The setup URL with `return_to` set to where the user came from.
    /// Any existing `return_to` on the base URL is replaced.
    pub fn url(&self, return_to: &str) -> Url {
        let mut url = self.base.clone();
        let kept: Vec<(String, String)> = self
            .base
            .query_pairs()
            .filter(|(k, _)| k != RETURN_TO_PARAM)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        {
            let mut query = url.query_pairs_mut();
            query.clear();
            query.extend_pairs(kept);
            query.append_pair(RETURN_TO_PARAM, return_to);
        }
        url
    }
}
