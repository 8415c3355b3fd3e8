//! Error types for passkey-vault.
//!
//! Every variant is a distinct failure mode in the key lifecycle. Error
//! messages are intentionally minimal. They signal *what* failed without
//! revealing *why* in ways that could leak cryptographic state.
//!
//! Platform and backend failures are caught at the boundary of the module
//! that talks to them and re-wrapped here. The original error is kept as the
//! `source()` for diagnostics; nothing above the boundary matches on it.

use std::fmt;

use thiserror::Error;

use crate::collab::RemoteError;

/// Boxed cause attached to boundary errors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, E2eeError>;

/// Why a decryption was rejected.
///
/// `Authentication` covers wrong key, tampered ciphertext, tampered IV and
/// truncated payloads alike. They are deliberately not distinguished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptFailure {
    /// The GCM tag did not verify, or the payload was structurally unusable.
    Authentication,
    /// The tag verified but the plaintext is not the expected serialized data.
    InvalidData,
}

impl fmt::Display for DecryptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authentication => write!(f, "decryption failed"),
            Self::InvalidData => write!(f, "decryption failed: decrypted data is not valid"),
        }
    }
}

/// The single error type for all passkey-vault operations.
#[derive(Debug, Error)]
pub enum E2eeError {
    /// HKDF rejected the input (for example an empty PRF output).
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// The AEAD seal operation failed.
    #[error("encryption failed")]
    EncryptionFailed,

    /// See [`DecryptFailure`].
    #[error("{0}")]
    DecryptionFailed(DecryptFailure),

    /// No key is held for the requested owner or unit.
    #[error("key not found")]
    KeyNotFound,

    /// The key store failed. The backend error is kept as the source.
    #[error("key storage failed: {context}")]
    StorageError {
        context: &'static str,
        #[source]
        source: Option<BoxError>,
    },

    /// A unit key could not be wrapped under the master key.
    #[error("key wrap failed")]
    KeyWrapFailed,

    /// A wrapped unit key could not be opened with the master key.
    #[error("key unwrap failed")]
    KeyUnwrapFailed,

    /// The client has no usable passkey (WebAuthn) support at all.
    #[error("passkeys are not supported on this client")]
    PasskeyNotSupported,

    /// The ceremony succeeded but the authenticator returned no PRF result.
    #[error("the passkey does not support the PRF extension")]
    PrfNotSupported,

    /// The ceremony was cancelled, rejected, timed out or raised a
    /// security error.
    #[error("passkey authentication failed")]
    PasskeyAuthenticationFailed(#[source] Option<BoxError>),

    /// Malformed base64/base64url/UTF-8 input.
    #[error("malformed encoding: {0}")]
    Encoding(&'static str),

    /// Derivation parameters failed validation.
    #[error("invalid derivation parameters: {0}")]
    InvalidParameters(&'static str),

    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// A data-access collaborator call failed.
    #[error("remote call failed")]
    Remote(#[source] RemoteError),
}

/// Coarse classification of [`E2eeError`], for callers that branch on the
/// kind of failure rather than its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    KeyDerivationFailed,
    EncryptionFailed,
    DecryptionFailed,
    KeyNotFound,
    StorageError,
    KeyWrapFailed,
    KeyUnwrapFailed,
    PasskeyNotSupported,
    PrfNotSupported,
    PasskeyAuthenticationFailed,
    Encoding,
    InvalidParameters,
    Config,
    Remote,
}

/// Shown for every unlock failure that is not an unsupported-client case.
pub const GENERIC_UNLOCK_MESSAGE: &str = "Unlocking failed. Please try again.";

impl E2eeError {
    pub(crate) fn storage(
        context: &'static str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::StorageError {
            context,
            source: Some(Box::new(source)),
        }
    }

    /// Return the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::KeyDerivationFailed => ErrorKind::KeyDerivationFailed,
            Self::EncryptionFailed => ErrorKind::EncryptionFailed,
            Self::DecryptionFailed(_) => ErrorKind::DecryptionFailed,
            Self::KeyNotFound => ErrorKind::KeyNotFound,
            Self::StorageError { .. } => ErrorKind::StorageError,
            Self::KeyWrapFailed => ErrorKind::KeyWrapFailed,
            Self::KeyUnwrapFailed => ErrorKind::KeyUnwrapFailed,
            Self::PasskeyNotSupported => ErrorKind::PasskeyNotSupported,
            Self::PrfNotSupported => ErrorKind::PrfNotSupported,
            Self::PasskeyAuthenticationFailed(_) => ErrorKind::PasskeyAuthenticationFailed,
            Self::Encoding(_) => ErrorKind::Encoding,
            Self::InvalidParameters(_) => ErrorKind::InvalidParameters,
            Self::Config(_) => ErrorKind::Config,
            Self::Remote(_) => ErrorKind::Remote,
        }
    }

    /// Text that is safe to show to the user.
    ///
    /// Unsupported-client kinds get actionable text. Everything else collapses
    /// to [`GENERIC_UNLOCK_MESSAGE`] so the prompt never reveals whether the
    /// credential or the platform was at fault.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::PasskeyNotSupported => {
                "This browser or device does not support passkeys. \
                 Please use a recent version of Chrome, Safari, Edge or Firefox."
            }
            Self::PrfNotSupported => {
                "This passkey cannot be used for encryption. \
                 Please use a client whose passkeys support the PRF extension."
            }
            Self::StorageError { .. } => {
                "Secure key storage is unavailable in this browsing context. \
                 Private browsing modes are not supported."
            }
            _ => GENERIC_UNLOCK_MESSAGE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_decrypt_messages_do_not_leak_cause() {
        let err = E2eeError::DecryptionFailed(DecryptFailure::Authentication);
        assert_eq!(err.to_string(), "decryption failed");
        assert_eq!(err.kind(), ErrorKind::DecryptionFailed);
    }

    #[test]
    fn test_storage_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "quota exceeded");
        let err = E2eeError::storage("put master key", io);
        assert_eq!(err.kind(), ErrorKind::StorageError);
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "key storage failed: put master key");
    }

    #[test]
    fn test_unlock_failures_share_one_message() {
        let a = E2eeError::PasskeyAuthenticationFailed(None);
        let b = E2eeError::KeyDerivationFailed;
        assert_eq!(a.user_message(), b.user_message());
        assert_ne!(E2eeError::PrfNotSupported.user_message(), a.user_message());
    }
}
