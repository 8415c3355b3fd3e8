//! The key hierarchy behind a passkey.
//!
//! The authenticator's PRF output never becomes a key on its own: it is fed
//! through HKDF-SHA256 with the user's stored salt to produce the master
//! key. The master key in turn wraps random per-unit keys, so a shared unit
//! can be re-wrapped without re-encrypting its data.
//!
//! Key bytes live only inside [`DerivedKey`], a shared handle that cannot be
//! read back out and is wiped when the last clone drops.
//!
//! ## Derivation structure
//!
//! ```text
//! HKDF-SHA256(
//!     ikm  = prf_output,
//!     salt = params.salt,
//!     info = "passkey-vault/e2ee-master-key/v1"
//! )
//! ```

use std::fmt;
use std::sync::Arc;

use ring::hkdf;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::crypto::{self, KEY_LEN, NONCE_LEN};
use crate::encoding::{self, serde_b64};
use crate::error::{E2eeError, Result};

/// Fixed, cross-application HKDF info string for the master key.
pub const MASTER_KEY_INFO: &[u8] = b"passkey-vault/e2ee-master-key/v1";

/// Associated data bound into every wrapped unit key.
const UNIT_KEY_AAD: &[u8] = b"passkey-vault/unit-key/v1";

/// Version written into freshly generated parameters.
pub const CURRENT_PARAMS_VERSION: u32 = 1;

/// Version written into wrapped unit keys.
pub const WRAP_VERSION: u32 = 1;

/// Minimum accepted salt length in bytes.
pub const MIN_SALT_LEN: usize = 16;

/// Length of salts produced by [`generate_parameters`].
const SALT_LEN: usize = 32;

// ---------------------------------------------------------------------------
// Derivation parameters
// ---------------------------------------------------------------------------

/// Non-secret inputs to master key derivation, stored server-side per user.
///
/// Immutable once created for a credential. A new credential needs new
/// parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivationParameters {
    #[serde(with = "serde_b64")]
    pub salt: Vec<u8>,
    pub version: u32,
}

impl DerivationParameters {
    pub fn validate(&self) -> Result<()> {
        if self.salt.len() < MIN_SALT_LEN {
            return Err(E2eeError::InvalidParameters("salt shorter than 16 bytes"));
        }
        if self.version == 0 {
            return Err(E2eeError::InvalidParameters("version must be positive"));
        }
        Ok(())
    }
}

/// Generate parameters for a first-time setup: a fresh random salt and the
/// current version.
///
/// Invoked by the external setup flow; the unlock path only ever reads
/// previously stored parameters.
pub fn generate_parameters() -> Result<DerivationParameters> {
    Ok(DerivationParameters {
        salt: encoding::random_bytes(SALT_LEN)?,
        version: CURRENT_PARAMS_VERSION,
    })
}

// ---------------------------------------------------------------------------
// Key handle
// ---------------------------------------------------------------------------

struct KeyMaterial {
    bytes: [u8; KEY_LEN],
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

/// An opaque handle to a 256-bit AES key.
///
/// - Raw bytes never leave the crate. There is no export, no `Serialize`,
///   and `Debug` prints `[REDACTED]`.
/// - Cloning shares the handle rather than copying the key; the material is
///   zeroised when the last clone is dropped.
/// - Usable only for encrypt/decrypt and wrap/unwrap inside this crate.
#[derive(Clone)]
pub struct DerivedKey {
    material: Arc<KeyMaterial>,
}

impl DerivedKey {
    fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            material: Arc::new(KeyMaterial { bytes }),
        }
    }

    /// Borrow the raw key bytes for AEAD operations.
    ///
    /// `pub(crate)`: raw bytes never leave the crate.
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.material.bytes
    }

    /// True when both values refer to the same key handle.
    pub fn same_handle(&self, other: &DerivedKey) -> bool {
        Arc::ptr_eq(&self.material, &other.material)
    }

    #[cfg(test)]
    pub(crate) fn for_tests(byte: u8) -> Self {
        Self::from_bytes([byte; KEY_LEN])
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("material", &"[REDACTED]")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

/// Derive the master key from a passkey PRF output.
///
/// Fails with `KeyDerivationFailed` when the PRF output is empty, the
/// parameters are invalid, or HKDF rejects the request.
///
/// # Security properties
/// - HKDF is one-way: the key reveals nothing about the PRF output.
/// - The salt is per user, so equal PRF outputs never collide across users.
/// - The returned handle cannot be exported.
pub async fn derive_key(prf_output: &[u8], params: &DerivationParameters) -> Result<DerivedKey> {
    if prf_output.is_empty() {
        return Err(E2eeError::KeyDerivationFailed);
    }
    params
        .validate()
        .map_err(|_| E2eeError::KeyDerivationFailed)?;

    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &params.salt);
    let prk = salt.extract(prf_output);

    let info = [MASTER_KEY_INFO];
    let okm = prk
        .expand(&info, hkdf::HKDF_SHA256)
        .map_err(|_| E2eeError::KeyDerivationFailed)?;

    let mut derived = [0u8; KEY_LEN];
    okm.fill(&mut derived)
        .map_err(|_| E2eeError::KeyDerivationFailed)?;

    let key = DerivedKey::from_bytes(derived);
    derived.zeroize();
    tracing::debug!(params_version = params.version, "derived master key");
    Ok(key)
}

// ---------------------------------------------------------------------------
// Unit keys
// ---------------------------------------------------------------------------

/// A unit key encrypted under a master key. Safe to persist and transmit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    #[serde(with = "serde_b64")]
    pub iv: Vec<u8>,
    #[serde(with = "serde_b64")]
    pub ciphertext: Vec<u8>,
    pub version: u32,
}

/// Generate a random 256-bit unit key.
pub fn generate_unit_key() -> Result<DerivedKey> {
    let bytes = encoding::random_array::<KEY_LEN>().map_err(|_| E2eeError::KeyWrapFailed)?;
    Ok(DerivedKey::from_bytes(bytes))
}

/// Wrap a unit key under the master key with AES-256-GCM.
pub async fn wrap_unit_key(master: &DerivedKey, unit: &DerivedKey) -> Result<WrappedKey> {
    let (iv, ciphertext) = crypto::seal(master, UNIT_KEY_AAD, unit.as_bytes())
        .map_err(|_| E2eeError::KeyWrapFailed)?;
    Ok(WrappedKey {
        iv: iv.to_vec(),
        ciphertext,
        version: WRAP_VERSION,
    })
}

/// Unwrap a unit key previously produced by [`wrap_unit_key`].
///
/// A wrong master key, a tampered blob and an unknown version all fail the
/// same way.
pub async fn unwrap_unit_key(master: &DerivedKey, wrapped: &WrappedKey) -> Result<DerivedKey> {
    if wrapped.version != WRAP_VERSION || wrapped.iv.len() != NONCE_LEN {
        return Err(E2eeError::KeyUnwrapFailed);
    }

    let mut plaintext = crypto::open(master, UNIT_KEY_AAD, &wrapped.iv, &wrapped.ciphertext)
        .map_err(|_| E2eeError::KeyUnwrapFailed)?;

    if plaintext.len() != KEY_LEN {
        plaintext.zeroize();
        return Err(E2eeError::KeyUnwrapFailed);
    }

    let mut bytes = [0u8; KEY_LEN];
    bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();

    let key = DerivedKey::from_bytes(bytes);
    bytes.zeroize();
    Ok(key)
}

/// Re-wrap a unit key from one master key to another.
///
/// Used when a user replaces their passkey: every stored unit key is
/// re-wrapped under the new master key while the old one is still
/// unlocked. The unit key itself does not change, so data encrypted under
/// it stays readable.
pub async fn rewrap_unit_key(
    old_master: &DerivedKey,
    new_master: &DerivedKey,
    wrapped: &WrappedKey,
) -> Result<WrappedKey> {
    let unit = unwrap_unit_key(old_master, wrapped).await?;
    wrap_unit_key(new_master, &unit).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(byte: u8) -> DerivationParameters {
        DerivationParameters {
            salt: vec![byte; 32],
            version: CURRENT_PARAMS_VERSION,
        }
    }

    #[tokio::test]
    async fn test_derivation_is_deterministic() {
        let prf = [7u8; 32];
        let a = derive_key(&prf, &params(1)).await.unwrap();
        let b = derive_key(&prf, &params(1)).await.unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert!(!a.same_handle(&b));
    }

    #[tokio::test]
    async fn test_salt_separates_keys() {
        let prf = [7u8; 32];
        let a = derive_key(&prf, &params(1)).await.unwrap();
        let b = derive_key(&prf, &params(2)).await.unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[tokio::test]
    async fn test_empty_prf_output_rejected() {
        let err = derive_key(&[], &params(1)).await.unwrap_err();
        assert!(matches!(err, E2eeError::KeyDerivationFailed));
    }

    #[tokio::test]
    async fn test_short_salt_rejected() {
        let short = DerivationParameters {
            salt: vec![1u8; 8],
            version: 1,
        };
        assert!(short.validate().is_err());
        assert!(derive_key(&[1u8; 32], &short).await.is_err());
    }

    #[test]
    fn test_generated_parameters_are_valid_and_unique() {
        let a = generate_parameters().unwrap();
        let b = generate_parameters().unwrap();
        a.validate().unwrap();
        assert_eq!(a.version, CURRENT_PARAMS_VERSION);
        assert_ne!(a.salt, b.salt);
    }

    #[test]
    fn test_parameters_serialize_salt_as_base64() {
        let json = serde_json::to_value(params(0)).unwrap();
        assert_eq!(json["salt"], encoding::to_base64(&[0u8; 32]));
        assert_eq!(json["version"], 1);
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = DerivedKey::for_tests(9);
        let shown = format!("{key:?}");
        assert!(shown.contains("REDACTED"));
        assert!(!shown.contains("9, 9"));
    }

    #[tokio::test]
    async fn test_wrap_unwrap_roundtrip() {
        let master = DerivedKey::for_tests(1);
        let unit = generate_unit_key().unwrap();
        let wrapped = wrap_unit_key(&master, &unit).await.unwrap();
        assert_eq!(wrapped.iv.len(), NONCE_LEN);
        let opened = unwrap_unit_key(&master, &wrapped).await.unwrap();
        assert_eq!(opened.as_bytes(), unit.as_bytes());
    }

    #[tokio::test]
    async fn test_unwrap_with_wrong_master_fails() {
        let unit = generate_unit_key().unwrap();
        let wrapped = wrap_unit_key(&DerivedKey::for_tests(1), &unit).await.unwrap();
        let err = unwrap_unit_key(&DerivedKey::for_tests(2), &wrapped)
            .await
            .unwrap_err();
        assert!(matches!(err, E2eeError::KeyUnwrapFailed));
    }

    #[tokio::test]
    async fn test_rewrap_moves_unit_key_to_new_master() {
        let old = DerivedKey::for_tests(1);
        let new = DerivedKey::for_tests(2);
        let unit = generate_unit_key().unwrap();

        let wrapped = wrap_unit_key(&old, &unit).await.unwrap();
        let rewrapped = rewrap_unit_key(&old, &new, &wrapped).await.unwrap();

        assert!(unwrap_unit_key(&old, &rewrapped).await.is_err());
        let opened = unwrap_unit_key(&new, &rewrapped).await.unwrap();
        assert_eq!(opened.as_bytes(), unit.as_bytes());
    }
}
