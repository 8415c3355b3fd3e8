//! Passkey authentication bridge.
//!
//! Drives one WebAuthn-style assertion ceremony with the PRF extension and
//! extracts the credential id and PRF output from the response. This is the
//! single place where platform-specific negative outcomes are translated
//! into the crate's error taxonomy.
//!
//! The ceremony itself is performed by a [`CredentialPlatform`], the seam
//! to the browser or OS credential API.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::capability::{AuthenticatorHint, CapabilityResolver, ClientProfile};
use crate::config::E2eeConfig;
use crate::encoding::{self, serde_b64url};
use crate::error::{E2eeError, Result};

/// Length of the random challenge put on every request.
pub const CHALLENGE_LEN: usize = 32;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// How the client can reach an authenticator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    Usb,
    Nfc,
    Ble,
    SmartCard,
    Hybrid,
    Internal,
}

impl Transport {
    /// Every transport the client knows, used when a credential has no
    /// recorded hints.
    pub const ALL: [Transport; 6] = [
        Transport::Internal,
        Transport::Hybrid,
        Transport::Usb,
        Transport::Nfc,
        Transport::Ble,
        Transport::SmartCard,
    ];
}

/// Identifies a registered authenticator to challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialReference {
    #[serde(with = "serde_b64url")]
    pub credential_id: Vec<u8>,
    #[serde(default)]
    pub transports: Vec<Transport>,
}

impl CredentialReference {
    pub fn new(credential_id: Vec<u8>) -> Self {
        Self {
            credential_id,
            transports: Vec::new(),
        }
    }

    pub fn from_base64url(id: &str) -> Result<Self> {
        Ok(Self::new(encoding::from_base64url(id)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserVerification {
    Required,
    Preferred,
    Discouraged,
}

/// One allow-list entry of an assertion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedCredential {
    pub id: Vec<u8>,
    pub transports: Vec<Transport>,
}

/// A fully built ceremony request, handed to the platform as-is.
#[derive(Debug, Clone)]
pub struct AssertionRequest {
    pub challenge: [u8; CHALLENGE_LEN],
    pub rp_id: String,
    pub timeout: Duration,
    pub user_verification: UserVerification,
    /// Empty means any discoverable credential may answer.
    pub allow_credentials: Vec<AllowedCredential>,
    /// PRF `eval.first` input, when PRF evaluation is requested.
    pub prf_eval: Option<Vec<u8>>,
    pub hint: AuthenticatorHint,
}

/// PRF extension results as returned by the authenticator.
pub struct PrfResults {
    pub first: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for PrfResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrfResults")
            .field("first", &"[REDACTED]")
            .finish()
    }
}

/// What the platform returns for a successful ceremony.
#[derive(Debug)]
pub struct AssertionResponse {
    pub credential_id: Vec<u8>,
    /// `None` when the authenticator ignored the PRF extension.
    pub prf: Option<PrfResults>,
}

/// Negative outcomes a platform may report, named after the WebAuthn
/// `DOMException` kinds.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("the user cancelled or the request was not allowed")]
    NotAllowed,
    #[error("the ceremony was aborted")]
    Aborted,
    #[error("security error: {0}")]
    Security(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("the ceremony timed out")]
    Timeout,
    #[error("public key credentials are not supported")]
    NotSupported,
    #[error("{0}")]
    Other(String),
}

/// Seam to the platform credential API (browser or OS).
#[async_trait]
pub trait CredentialPlatform: Send + Sync {
    /// Whether the platform exposes public key credentials at all.
    fn is_available(&self) -> bool;

    /// What the platform knows about the current device and client.
    fn client_profile(&self) -> ClientProfile;

    /// Run one assertion ceremony.
    async fn get_assertion(
        &self,
        request: AssertionRequest,
    ) -> std::result::Result<AssertionResponse, PlatformError>;
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// PRF output from a ceremony. Zeroised on drop, never printed.
pub struct PrfOutput(Zeroizing<Vec<u8>>);

impl PrfOutput {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PrfOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrfOutput([REDACTED])")
    }
}

/// Result of [`Authenticator::authenticate`].
#[derive(Debug)]
pub struct AuthenticationOutcome {
    pub credential_id: Vec<u8>,
    pub prf_output: Option<PrfOutput>,
    pub prf_enabled: bool,
}

impl AuthenticationOutcome {
    /// The PRF output, or `PrfNotSupported` when the authenticator did not
    /// produce one. Callers must not derive keys without it.
    pub fn require_prf(self) -> Result<PrfOutput> {
        match self.prf_output {
            Some(output) if self.prf_enabled => Ok(output),
            _ => Err(E2eeError::PrfNotSupported),
        }
    }
}

// ---------------------------------------------------------------------------
// Authenticator
// ---------------------------------------------------------------------------

/// Builds ceremony requests and interprets their results.
pub struct Authenticator<P> {
    platform: P,
    resolver: Arc<dyn CapabilityResolver>,
    rp_id: String,
    timeout: Duration,
}

impl<P: CredentialPlatform> Authenticator<P> {
    /// Build an authenticator using the capability table from `config`.
    pub fn new(platform: P, config: &E2eeConfig) -> Self {
        Self {
            platform,
            resolver: Arc::new(config.capabilities.clone()),
            rp_id: config.rp_id.clone(),
            timeout: config.ceremony_timeout(),
        }
    }

    /// Replace the capability strategy.
    pub fn with_resolver(mut self, resolver: Arc<dyn CapabilityResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Build the request for one ceremony.
    pub fn build_request(
        &self,
        allowed: &[CredentialReference],
        prf_salt: Option<&[u8]>,
    ) -> Result<AssertionRequest> {
        let challenge = encoding::random_array::<CHALLENGE_LEN>()
            .map_err(|e| E2eeError::PasskeyAuthenticationFailed(Some(Box::new(e))))?;

        let allow_credentials = allowed
            .iter()
            .map(|c| AllowedCredential {
                id: c.credential_id.clone(),
                transports: if c.transports.is_empty() {
                    Transport::ALL.to_vec()
                } else {
                    c.transports.clone()
                },
            })
            .collect();

        let hint = self.resolver.resolve(&self.platform.client_profile());

        Ok(AssertionRequest {
            challenge,
            rp_id: self.rp_id.clone(),
            timeout: self.timeout,
            user_verification: UserVerification::Required,
            allow_credentials,
            prf_eval: prf_salt.map(<[u8]>::to_vec),
            hint,
        })
    }

    /// Run one ceremony, requesting PRF evaluation with `prf_salt`.
    ///
    /// With no `allowed` credentials the platform may pick any discoverable
    /// credential, which is what cross-device linking needs.
    ///
    /// A successful ceremony without PRF results is reported through
    /// `prf_enabled = false`, not as an error.
    pub async fn authenticate(
        &self,
        allowed: &[CredentialReference],
        prf_salt: Option<&[u8]>,
    ) -> Result<AuthenticationOutcome> {
        if !self.platform.is_available() {
            tracing::warn!("passkey ceremony requested on a client without passkey support");
            return Err(E2eeError::PasskeyNotSupported);
        }

        let request = self.build_request(allowed, prf_salt)?;
        if request.allow_credentials.is_empty() {
            tracing::debug!("no known credentials; allowing any discoverable credential");
        }
        let hint = request.hint;

        let response = self
            .platform
            .get_assertion(request)
            .await
            .map_err(translate_platform_error)?;

        let prf_output = response
            .prf
            .filter(|_| prf_salt.is_some())
            .map(|results| results.first)
            .filter(|first| !first.is_empty())
            .map(PrfOutput);
        let prf_enabled = prf_output.is_some();

        tracing::info!(
            hint = hint.as_webauthn_hint(),
            prf_enabled,
            credentials = allowed.len(),
            "passkey ceremony completed"
        );

        Ok(AuthenticationOutcome {
            credential_id: response.credential_id,
            prf_output,
            prf_enabled,
        })
    }
}

fn translate_platform_error(err: PlatformError) -> E2eeError {
    tracing::warn!(error = %err, "passkey ceremony failed");
    match err {
        PlatformError::NotSupported => E2eeError::PasskeyNotSupported,
        other => E2eeError::PasskeyAuthenticationFailed(Some(Box::new(other))),
    }
}
