//! # passkey-vault
//!
//! Client-side end-to-end encryption keyed by a passkey.
//!
//! A WebAuthn assertion with the PRF extension yields a per-credential
//! secret. That secret is run through HKDF into a non-exportable AES-256-GCM
//! master key, which is cached for the session and used to encrypt
//! application data so the server only ever stores ciphertext.
//!
//! ## Layout
//!
//! - [`encoding`], [`crypto`], [`keys`]: primitives, the cipher engine and
//!   key derivation. Only `crypto` and `keys` touch `ring` AEAD/HKDF types.
//! - [`capability`], [`ceremony`]: picking the authenticator flow and
//!   running one assertion ceremony.
//! - [`store`], [`cache`]: the persistent key cache with TTL expiry.
//! - [`controller`], [`session`], [`gate`]: the lock state machine, the
//!   crypto surface for unlocked users and the render decision.
//!
//! ## Public API
//!
//! Features are expected to go through [`EncryptionController`] and
//! [`UnlockedSession`]. The lower modules stay public for setup flows and
//! tests, but raw key bytes are `pub(crate)` at most.

pub mod cache;
pub mod capability;
pub mod ceremony;
pub mod collab;
pub mod config;
pub mod controller;
pub mod crypto;
pub mod encoding;
pub mod error;
pub mod gate;
pub mod keys;
pub mod session;
pub mod store;

pub use cache::KeyCache;
pub use ceremony::{Authenticator, CredentialPlatform, CredentialReference};
pub use collab::{ParameterSource, RemoteError};
pub use config::E2eeConfig;
pub use controller::{EncryptionController, EncryptionState, StateWatcher};
pub use crypto::EncryptedPayload;
pub use error::{E2eeError, ErrorKind, Result};
pub use gate::{gate, GateView, SetupRedirect};
pub use keys::{DerivationParameters, DerivedKey, WrappedKey};
pub use session::UnlockedSession;
pub use store::{KeyStore, MemoryKeyStore};
