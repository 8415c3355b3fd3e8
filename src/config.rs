//! Runtime configuration.
//!
//! Loaded from JSON. Every field has a default, so an empty object is a
//! valid configuration apart from `rp_id`, which must be set before a
//! ceremony can run.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::capability::CapabilityTable;
use crate::error::{E2eeError, Result};

/// Default time-to-live for cached keys (24 hours).
pub const DEFAULT_CACHE_TTL_SECS: u64 = 24 * 60 * 60;

/// Default ceremony timeout handed to the platform.
pub const DEFAULT_CEREMONY_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct E2eeConfig {
    /// WebAuthn relying party id (the site's registrable domain).
    pub rp_id: String,
    /// Cached key lifetime in seconds.
    pub cache_ttl_secs: u64,
    /// Timeout put on every ceremony request, in milliseconds.
    pub ceremony_timeout_ms: u64,
    /// Where users without derivation parameters are sent to set up a passkey.
    pub setup_url: Option<String>,
    /// PRF capability heuristics.
    pub capabilities: CapabilityTable,
}

impl Default for E2eeConfig {
    fn default() -> Self {
        Self {
            rp_id: String::new(),
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            ceremony_timeout_ms: DEFAULT_CEREMONY_TIMEOUT_MS,
            setup_url: None,
            capabilities: CapabilityTable::default(),
        }
    }
}

impl E2eeConfig {
    pub fn for_rp(rp_id: impl Into<String>) -> Self {
        Self {
            rp_id: rp_id.into(),
            ..Self::default()
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| E2eeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| E2eeError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rp_id.trim().is_empty() {
            return Err(E2eeError::Config("rp_id must be set".into()));
        }
        if self.cache_ttl_secs == 0 {
            return Err(E2eeError::Config("cache_ttl_secs must be positive".into()));
        }
        if self.ceremony_timeout_ms == 0 {
            return Err(E2eeError::Config("ceremony_timeout_ms must be positive".into()));
        }
        if let Some(setup) = &self.setup_url {
            Url::parse(setup).map_err(|e| E2eeError::Config(format!("setup_url: {e}")))?;
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn ceremony_timeout(&self) -> Duration {
        Duration::from_millis(self.ceremony_timeout_ms)
    }
}
