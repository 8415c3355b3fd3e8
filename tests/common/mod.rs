#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use passkey_vault::capability::ClientProfile;
use passkey_vault::ceremony::{AssertionRequest, AssertionResponse, PlatformError, PrfResults};
use passkey_vault::collab::{ParameterSource, RemoteError};
use passkey_vault::keys::{self, DerivationParameters};
use passkey_vault::store::{KeyStore, MemoryKeyStore};
use passkey_vault::{CredentialPlatform, E2eeConfig, EncryptionController};
use tokio::sync::Notify;
use zeroize::Zeroizing;

pub const USER: &str = "user-1";

#[derive(Default)]
struct PlatformShared {
    ceremonies: AtomicUsize,
    next_error: Mutex<Option<PlatformError>>,
    hold: Option<Notify>,
}

/// Scripted credential platform. `secret` stands in for the authenticator's
/// PRF: the same secret always yields the same PRF output.
#[derive(Clone)]
pub struct FakePlatform {
    available: bool,
    secret: Option<Vec<u8>>,
    shared: Arc<PlatformShared>,
}

impl FakePlatform {
    pub fn with_prf(secret: &[u8]) -> Self {
        Self {
            available: true,
            secret: Some(secret.to_vec()),
            shared: Arc::default(),
        }
    }

    /// An authenticator that completes ceremonies but ignores PRF.
    pub fn without_prf() -> Self {
        Self {
            available: true,
            secret: None,
            shared: Arc::default(),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            secret: None,
            shared: Arc::default(),
        }
    }

    /// Every ceremony waits for `release` before answering.
    pub fn held(secret: &[u8]) -> Self {
        Self {
            available: true,
            secret: Some(secret.to_vec()),
            shared: Arc::new(PlatformShared {
                hold: Some(Notify::new()),
                ..PlatformShared::default()
            }),
        }
    }

    pub fn release(&self) {
        if let Some(hold) = &self.shared.hold {
            hold.notify_one();
        }
    }

    pub fn fail_next(&self, err: PlatformError) {
        *self.shared.next_error.lock().unwrap() = Some(err);
    }

    pub fn ceremonies(&self) -> usize {
        self.shared.ceremonies.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialPlatform for FakePlatform {
    fn is_available(&self) -> bool {
        self.available
    }

    fn client_profile(&self) -> ClientProfile {
        ClientProfile::default()
    }

    async fn get_assertion(
        &self,
        request: AssertionRequest,
    ) -> Result<AssertionResponse, PlatformError> {
        self.shared.ceremonies.fetch_add(1, Ordering::SeqCst);
        if let Some(hold) = &self.shared.hold {
            hold.notified().await;
        }
        if let Some(err) = self.shared.next_error.lock().unwrap().take() {
            return Err(err);
        }

        let prf = match (&self.secret, request.prf_eval) {
            (Some(secret), Some(eval)) => {
                let mut first = secret.clone();
                first.extend_from_slice(&eval);
                Some(PrfResults {
                    first: Zeroizing::new(first),
                })
            }
            _ => None,
        };
        Ok(AssertionResponse {
            credential_id: vec![0xC0, 0xFF, 0xEE],
            prf,
        })
    }
}

/// In-memory data-access collaborator.
#[derive(Clone, Default)]
pub struct FakeParams {
    params: Arc<Mutex<HashMap<String, DerivationParameters>>>,
    failing: Arc<AtomicBool>,
    fetches: Arc<AtomicUsize>,
}

impl FakeParams {
    pub fn with_user(user_id: &str) -> Self {
        let source = Self::default();
        source.add_user(user_id);
        source
    }

    pub fn add_user(&self, user_id: &str) {
        self.params
            .lock()
            .unwrap()
            .insert(user_id.to_string(), keys::generate_parameters().unwrap());
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ParameterSource for FakeParams {
    async fn get_derivation_parameters(
        &self,
        user_id: &str,
    ) -> Result<Option<DerivationParameters>, RemoteError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(RemoteError::new("parameter service unreachable"));
        }
        Ok(self.params.lock().unwrap().get(user_id).cloned())
    }

    async fn save_derivation_parameters(
        &self,
        params: &DerivationParameters,
        user_id: &str,
    ) -> Result<(), RemoteError> {
        self.params
            .lock()
            .unwrap()
            .insert(user_id.to_string(), params.clone());
        Ok(())
    }
}

pub type Controller = EncryptionController<FakePlatform, FakeParams>;

pub fn controller(
    platform: &FakePlatform,
    params: &FakeParams,
    store: &Arc<MemoryKeyStore>,
) -> Controller {
    EncryptionController::from_config(
        platform.clone(),
        params.clone(),
        Arc::clone(store) as Arc<dyn KeyStore>,
        &E2eeConfig::for_rp("app.example.com"),
    )
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
