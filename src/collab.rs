//! Seams to external collaborators.
//!
//! The core never creates derivation parameters itself; that happens in the
//! external setup service, reached by redirect. It only reads previously
//! stored parameters through a [`ParameterSource`] and detects their absence.

use async_trait::async_trait;
use thiserror::Error;

use crate::error::BoxError;
use crate::keys::DerivationParameters;

/// A failed call to a remote collaborator.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct RemoteError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Data-access collaborator holding per-user derivation parameters.
///
/// Both calls are fallible remote calls. Failures come back as values and
/// are never allowed to escape into core logic uncaught.
#[async_trait]
pub trait ParameterSource: Send + Sync {
    /// Parameters for `user_id`, or `None` if encryption was never set up.
    async fn get_derivation_parameters(
        &self,
        user_id: &str,
    ) -> Result<Option<DerivationParameters>, RemoteError>;

    async fn save_derivation_parameters(
        &self,
        params: &DerivationParameters,
        user_id: &str,
    ) -> Result<(), RemoteError>;
}
