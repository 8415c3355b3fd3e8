//! Encryption state controller.
//!
//! Holds the in-memory master key for one page/tab and mediates between
//! "not configured", "configured but locked" and "unlocked".
//!
//! ```text
//! Loading ──► Unlocked
//!        ├──► LockedNeedsSetup   (no derivation parameters: redirect to setup)
//!        ├──► LockedNeedsUnlock  (parameters exist: show unlock prompt)
//!        └──► Error              (storage unavailable or lookup failed)
//! ```
//!
//! The visible [`EncryptionState`] is never stored. It is recomputed from a
//! [`Snapshot`] of facts (key held, parameters known, last failure, operation
//! in flight) so the flags cannot drift apart. Observers subscribe through a
//! `tokio::sync::watch` channel.
//!
//! There is no idle re-lock timer here; the session layer calls
//! [`EncryptionController::lock`] when it decides to.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use crate::cache::KeyCache;
use crate::ceremony::{Authenticator, CredentialPlatform, CredentialReference};
use crate::collab::ParameterSource;
use crate::config::E2eeConfig;
use crate::error::{E2eeError, ErrorKind, Result};
use crate::keys::{self, DerivationParameters, DerivedKey};
use crate::session::UnlockedSession;
use crate::store::KeyStore;

/// A failure as it is shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateError {
    pub kind: ErrorKind,
    pub message: &'static str,
}

impl From<&E2eeError> for StateError {
    fn from(err: &E2eeError) -> Self {
        Self {
            kind: err.kind(),
            message: err.user_message(),
        }
    }
}

/// What the rest of the application sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptionState {
    Loading,
    Unlocked,
    LockedNeedsSetup,
    /// `error` is set after a failed unlock attempt; the user may retry.
    LockedNeedsUnlock { error: Option<StateError> },
    /// Blocking failure: storage unavailable or the parameter lookup failed.
    Error(StateError),
}

impl EncryptionState {
    pub fn is_unlocked(&self) -> bool {
        matches!(self, Self::Unlocked)
    }
}

#[derive(Debug, Clone, Default)]
enum ParamsStatus {
    #[default]
    Unknown,
    Missing,
    /// Parameters exist. `None` when known to exist but not fetched yet.
    Present(Option<DerivationParameters>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Check,
    Unlock,
}

#[derive(Debug, Clone, Copy)]
struct Failure {
    stage: Stage,
    error: StateError,
}

/// The facts the visible state is derived from.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    user: Option<String>,
    key: Option<DerivedKey>,
    params: ParamsStatus,
    busy: bool,
    failure: Option<Failure>,
    /// Bumped by every lock and user switch. Results of operations that
    /// started earlier are discarded and sessions taken earlier are revoked.
    epoch: u64,
}

impl Snapshot {
    /// Start over for `user_id` if the snapshot belongs to someone else.
    /// Returns true when a previous user was replaced.
    fn reset_for(&mut self, user_id: &str) -> bool {
        if self.user.as_deref() == Some(user_id) {
            return false;
        }
        let replaced = self.user.is_some();
        *self = Snapshot {
            user: Some(user_id.to_string()),
            epoch: self.epoch + 1,
            ..Snapshot::default()
        };
        replaced
    }

    /// The master key, if `user_id` is still unlocked in `epoch`.
    pub(crate) fn key_for(&self, user_id: &str, epoch: u64) -> Option<DerivedKey> {
        if self.epoch != epoch || self.user.as_deref() != Some(user_id) {
            return None;
        }
        self.key.clone()
    }

    #[cfg(test)]
    pub(crate) fn unlocked_for_tests(user_id: &str, key: DerivedKey) -> Self {
        Snapshot {
            user: Some(user_id.to_string()),
            key: Some(key),
            params: ParamsStatus::Present(None),
            ..Snapshot::default()
        }
    }

    /// Derive the visible state.
    pub fn state(&self) -> EncryptionState {
        if self.key.is_some() {
            return EncryptionState::Unlocked;
        }
        if self.busy {
            return EncryptionState::Loading;
        }
        if let Some(Failure {
            stage: Stage::Check,
            error,
        }) = self.failure
        {
            return EncryptionState::Error(error);
        }
        match self.params {
            ParamsStatus::Unknown => EncryptionState::Loading,
            ParamsStatus::Missing => EncryptionState::LockedNeedsSetup,
            ParamsStatus::Present(_) => EncryptionState::LockedNeedsUnlock {
                error: self.failure.map(|f| f.error),
            },
        }
    }
}

/// Receives state changes from a controller.
pub struct StateWatcher {
    rx: watch::Receiver<Snapshot>,
}

impl StateWatcher {
    pub fn current(&self) -> EncryptionState {
        self.rx.borrow().state()
    }

    /// Wait for the next change. `None` once the controller is gone.
    pub async fn changed(&mut self) -> Option<EncryptionState> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().state())
    }
}

enum Mount {
    Cached(DerivedKey),
    NeedsSetup,
    NeedsUnlock(DerivationParameters),
}

enum UnlockStep {
    Unlocked {
        key: DerivedKey,
        params: DerivationParameters,
    },
    NeedsSetup,
}

/// Orchestrates ceremony, derivation and caching for one page/tab.
pub struct EncryptionController<P, S> {
    authenticator: Authenticator<P>,
    params: S,
    cache: Arc<KeyCache>,
    snapshot: watch::Sender<Snapshot>,
    operation: Mutex<()>,
}

impl<P, S> EncryptionController<P, S>
where
    P: CredentialPlatform,
    S: ParameterSource,
{
    pub fn new(authenticator: Authenticator<P>, params: S, cache: Arc<KeyCache>) -> Self {
        let (snapshot, _) = watch::channel(Snapshot::default());
        Self {
            authenticator,
            params,
            cache,
            snapshot,
            operation: Mutex::new(()),
        }
    }

    /// Wire a controller from configuration. `store` may be shared with
    /// other controllers of the same origin.
    pub fn from_config(
        platform: P,
        params: S,
        store: Arc<dyn KeyStore>,
        config: &E2eeConfig,
    ) -> Self {
        let authenticator = Authenticator::new(platform, config);
        let cache = Arc::new(KeyCache::new(store, config.cache_ttl()));
        Self::new(authenticator, params, cache)
    }

    pub fn authenticator(&self) -> &Authenticator<P> {
        &self.authenticator
    }

    pub fn state(&self) -> EncryptionState {
        self.snapshot.borrow().state()
    }

    pub fn subscribe(&self) -> StateWatcher {
        StateWatcher {
            rx: self.snapshot.subscribe(),
        }
    }

    /// Crypto operations for the unlocked user, or `None` while locked.
    ///
    /// The session does not hold the key. It is revoked by the next `lock`
    /// or user switch, after which every operation fails with `KeyNotFound`.
    pub fn session(&self) -> Option<UnlockedSession> {
        let snapshot = self.snapshot.borrow();
        snapshot.key.as_ref()?;
        let user = snapshot.user.clone()?;
        Some(UnlockedSession::new(
            user,
            snapshot.epoch,
            self.snapshot.subscribe(),
            Arc::clone(&self.cache),
        ))
    }

    /// Like [`session`](Self::session), but a locked controller is
    /// `KeyNotFound`.
    pub fn require_session(&self) -> Result<UnlockedSession> {
        self.session().ok_or(E2eeError::KeyNotFound)
    }

    // -----------------------------------------------------------------------
    // Mount
    // -----------------------------------------------------------------------

    /// Resolve the state for `user_id`: cached key, setup needed, or unlock
    /// needed. A cache hit unlocks without any ceremony.
    pub async fn check(&self, user_id: &str) -> EncryptionState {
        let _op = self.operation.lock().await;

        let mut epoch = 0;
        let mut already_unlocked = false;
        let mut switched = false;
        self.snapshot.send_modify(|s| {
            switched = s.reset_for(user_id);
            if s.key.is_some() {
                already_unlocked = true;
                return;
            }
            s.busy = true;
            s.failure = None;
            epoch = s.epoch;
        });
        if already_unlocked {
            return EncryptionState::Unlocked;
        }
        if switched {
            self.forget_unit_keys(user_id).await;
        }

        let result = self.mount(user_id).await;

        self.snapshot.send_modify(|s| {
            if s.epoch != epoch {
                return;
            }
            s.busy = false;
            match result {
                Ok(Mount::Cached(key)) => {
                    s.key = Some(key);
                    s.params = ParamsStatus::Present(None);
                }
                Ok(Mount::NeedsSetup) => s.params = ParamsStatus::Missing,
                Ok(Mount::NeedsUnlock(params)) => s.params = ParamsStatus::Present(Some(params)),
                Err(err) => {
                    s.failure = Some(Failure {
                        stage: Stage::Check,
                        error: StateError::from(&err),
                    });
                }
            }
        });

        let state = self.state();
        tracing::info!(user = user_id, state = ?state, "encryption state resolved");
        state
    }

    async fn mount(&self, user_id: &str) -> Result<Mount> {
        if !self.cache.is_storage_available() {
            tracing::error!("persistent key storage is unavailable; encryption cannot run");
            return Err(E2eeError::StorageError {
                context: "persistent storage is unavailable",
                source: None,
            });
        }

        if let Some(key) = self.cache.get(user_id).await? {
            tracing::debug!(user = user_id, "using cached master key");
            return Ok(Mount::Cached(key));
        }

        let params = self
            .params
            .get_derivation_parameters(user_id)
            .await
            .map_err(E2eeError::Remote)?;
        Ok(match params {
            Some(params) => Mount::NeedsUnlock(params),
            None => Mount::NeedsSetup,
        })
    }

    // -----------------------------------------------------------------------
    // Unlock
    // -----------------------------------------------------------------------

    /// Run a ceremony, derive the master key and cache it.
    ///
    /// Ignored while another check or unlock is in flight, so one user
    /// action never produces two ceremony prompts. On failure the state
    /// stays `LockedNeedsUnlock` with an error and the user may retry.
    pub async fn unlock(&self, user_id: &str, allowed: &[CredentialReference]) -> EncryptionState {
        let Ok(_op) = self.operation.try_lock() else {
            tracing::debug!(user = user_id, "unlock already in flight; ignoring request");
            return self.state();
        };

        let mut epoch = 0;
        let mut known = None;
        let mut already_unlocked = false;
        let mut switched = false;
        self.snapshot.send_modify(|s| {
            switched = s.reset_for(user_id);
            if s.key.is_some() {
                already_unlocked = true;
                return;
            }
            if let ParamsStatus::Present(Some(params)) = &s.params {
                known = Some(params.clone());
            }
            s.busy = true;
            s.failure = None;
            epoch = s.epoch;
        });
        if already_unlocked {
            return EncryptionState::Unlocked;
        }
        if switched {
            self.forget_unit_keys(user_id).await;
        }

        let result = self.run_unlock(user_id, allowed, known).await;

        let mut stale_key = false;
        self.snapshot.send_modify(|s| {
            if s.epoch != epoch {
                stale_key = matches!(result, Ok(UnlockStep::Unlocked { .. }));
                return;
            }
            s.busy = false;
            match &result {
                Ok(UnlockStep::Unlocked { key, params }) => {
                    s.key = Some(key.clone());
                    s.params = ParamsStatus::Present(Some(params.clone()));
                }
                Ok(UnlockStep::NeedsSetup) => s.params = ParamsStatus::Missing,
                Err(err) => {
                    let stage = match err.kind() {
                        ErrorKind::StorageError | ErrorKind::Remote => Stage::Check,
                        _ => Stage::Unlock,
                    };
                    s.failure = Some(Failure {
                        stage,
                        error: StateError::from(err),
                    });
                    if matches!(s.params, ParamsStatus::Unknown | ParamsStatus::Missing) {
                        s.params = ParamsStatus::Present(None);
                    }
                }
            }
        });

        if stale_key {
            // Locked while the ceremony ran; drop what the unlock cached.
            if let Err(e) = self.cache.delete(user_id).await {
                tracing::warn!(user = user_id, error = %e, "failed to drop key cached after lock");
            }
        }
        if let Err(err) = &result {
            tracing::warn!(user = user_id, kind = ?err.kind(), "unlock failed");
        }
        self.state()
    }

    async fn run_unlock(
        &self,
        user_id: &str,
        allowed: &[CredentialReference],
        known: Option<DerivationParameters>,
    ) -> Result<UnlockStep> {
        if !self.cache.is_storage_available() {
            return Err(E2eeError::StorageError {
                context: "persistent storage is unavailable",
                source: None,
            });
        }

        let params = match known {
            Some(params) => params,
            None => {
                let fetched = self
                    .params
                    .get_derivation_parameters(user_id)
                    .await
                    .map_err(E2eeError::Remote)?;
                match fetched {
                    Some(params) => params,
                    None => return Ok(UnlockStep::NeedsSetup),
                }
            }
        };

        let outcome = self
            .authenticator
            .authenticate(allowed, Some(&params.salt))
            .await?;
        let prf = outcome.require_prf()?;
        let key = keys::derive_key(prf.as_bytes(), &params).await?;
        self.cache.store(user_id, &key).await?;

        tracing::info!(user = user_id, "unlocked");
        Ok(UnlockStep::Unlocked { key, params })
    }

    // -----------------------------------------------------------------------
    // Lock
    // -----------------------------------------------------------------------

    /// Forget the master key and every unit key. No network round-trip;
    /// calling it while locked changes nothing.
    pub async fn lock(&self, user_id: &str) -> EncryptionState {
        self.snapshot.send_modify(|s| {
            s.reset_for(user_id);
            s.epoch += 1;
            s.key = None;
            s.busy = false;
            s.failure = None;
            if !matches!(s.params, ParamsStatus::Present(_)) {
                s.params = ParamsStatus::Present(None);
            }
        });

        if self.cache.is_storage_available() {
            if let Err(e) = self.cache.delete(user_id).await {
                tracing::warn!(user = user_id, error = %e, "failed to delete cached master key");
            }
        }
        self.forget_unit_keys(user_id).await;

        tracing::info!(user = user_id, "locked");
        self.state()
    }

    /// Unit keys are cached by unit id only, so they never survive a lock
    /// or a change of user.
    async fn forget_unit_keys(&self, user_id: &str) {
        if let Err(e) = self.cache.clear_units().await {
            tracing::warn!(user = user_id, error = %e, "failed to clear unit keys");
        }
    }
}
