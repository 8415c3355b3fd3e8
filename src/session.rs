//! Crypto operations for an unlocked user.
//!
//! An [`UnlockedSession`] is what features get from the controller once the
//! master key is in memory. Features only see payloads and wrapped unit keys.
//!
//! A session holds no key of its own. Every operation looks the master key
//! up in the controller's snapshot for the epoch the session was created
//! in, so a `lock` or a user switch revokes every outstanding session.

use std::sync::Arc;

use futures::future::try_join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::cache::KeyCache;
use crate::controller::Snapshot;
use crate::crypto::{self, EncryptedPayload};
use crate::error::{E2eeError, Result};
use crate::keys::{self, DerivedKey, WrappedKey};

#[derive(Clone)]
pub struct UnlockedSession {
    user_id: String,
    epoch: u64,
    snapshot: watch::Receiver<Snapshot>,
    cache: Arc<KeyCache>,
}

impl std::fmt::Debug for UnlockedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnlockedSession")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

impl UnlockedSession {
    pub(crate) fn new(
        user_id: String,
        epoch: u64,
        snapshot: watch::Receiver<Snapshot>,
        cache: Arc<KeyCache>,
    ) -> Self {
        Self {
            user_id,
            epoch,
            snapshot,
            cache,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Whether the controller still holds the key this session was issued
    /// for.
    pub fn is_active(&self) -> bool {
        self.snapshot
            .borrow()
            .key_for(&self.user_id, self.epoch)
            .is_some()
    }

    /// The master key handle, for flows such as passkey rotation that need
    /// to pass it back into [`keys`] functions. `KeyNotFound` once revoked.
    pub fn master_key(&self) -> Result<DerivedKey> {
        self.snapshot
            .borrow()
            .key_for(&self.user_id, self.epoch)
            .ok_or(E2eeError::KeyNotFound)
    }

    pub async fn encrypt(&self, plaintext: &str) -> Result<EncryptedPayload> {
        crypto::encrypt(plaintext, &self.master_key()?).await
    }

    pub async fn decrypt(&self, payload: &EncryptedPayload) -> Result<String> {
        crypto::decrypt(payload, &self.master_key()?).await
    }

    pub async fn encrypt_object<T: Serialize + ?Sized>(
        &self,
        value: &T,
    ) -> Result<EncryptedPayload> {
        crypto::encrypt_object(value, &self.master_key()?).await
    }

    pub async fn decrypt_object<T: DeserializeOwned>(
        &self,
        payload: &EncryptedPayload,
    ) -> Result<T> {
        crypto::decrypt_object(payload, &self.master_key()?).await
    }

    pub async fn encrypt_fields(
        &self,
        record: &Map<String, Value>,
        fields: &[&str],
    ) -> Result<Map<String, Value>> {
        crypto::encrypt_fields(record, fields, &self.master_key()?).await
    }

    pub async fn decrypt_fields(
        &self,
        record: &Map<String, Value>,
        fields: &[&str],
    ) -> Result<Map<String, Value>> {
        crypto::decrypt_fields(record, fields, &self.master_key()?).await
    }

    // -----------------------------------------------------------------------
    // Unit keys
    // -----------------------------------------------------------------------

    /// Create a key for a new unit (a shared group, a document) and cache
    /// it. The returned wrapped form is what the caller persists.
    pub async fn create_unit_key(&self, unit_id: u64) -> Result<WrappedKey> {
        let master = self.master_key()?;
        let unit = keys::generate_unit_key()?;
        let wrapped = keys::wrap_unit_key(&master, &unit).await?;
        self.cache_unit_key(unit_id, &unit).await?;
        tracing::debug!(unit_id, "created unit key");
        Ok(wrapped)
    }

    /// The unit key, from the cache or by unwrapping `wrapped`.
    async fn unit_key(&self, unit_id: u64, wrapped: &WrappedKey) -> Result<DerivedKey> {
        let master = self.master_key()?;
        if let Some(key) = self.cache.get_unit(unit_id).await? {
            return Ok(key);
        }
        let key = keys::unwrap_unit_key(&master, wrapped).await?;
        self.cache_unit_key(unit_id, &key).await?;
        Ok(key)
    }

    /// Cache a unit key, undoing the write if the session was revoked while
    /// it was in flight.
    async fn cache_unit_key(&self, unit_id: u64, key: &DerivedKey) -> Result<()> {
        self.cache.store_unit(unit_id, key).await?;
        if self.is_active() {
            return Ok(());
        }
        if let Err(e) = self.cache.delete_unit(unit_id).await {
            tracing::warn!(unit_id, error = %e, "failed to drop unit key cached after lock");
        }
        Err(E2eeError::KeyNotFound)
    }

    pub async fn encrypt_for_unit(
        &self,
        unit_id: u64,
        wrapped: &WrappedKey,
        plaintext: &str,
    ) -> Result<EncryptedPayload> {
        let key = self.unit_key(unit_id, wrapped).await?;
        crypto::encrypt(plaintext, &key).await
    }

    pub async fn decrypt_for_unit(
        &self,
        unit_id: u64,
        wrapped: &WrappedKey,
        payload: &EncryptedPayload,
    ) -> Result<String> {
        let key = self.unit_key(unit_id, wrapped).await?;
        crypto::decrypt(payload, &key).await
    }

    /// Forget the cached copy of one unit key, e.g. after leaving a group.
    pub async fn forget_unit_key(&self, unit_id: u64) -> Result<()> {
        self.cache.delete_unit(unit_id).await
    }

    /// Re-wrap unit keys under a new master key, for passkey rotation.
    /// All-or-nothing: any unwrap failure fails the whole batch.
    pub async fn rewrap_unit_keys(
        &self,
        new_master: &DerivedKey,
        wrapped: &[WrappedKey],
    ) -> Result<Vec<WrappedKey>> {
        let master = self.master_key()?;
        let jobs = wrapped
            .iter()
            .map(|w| keys::rewrap_unit_key(&master, new_master, w));
        let rewrapped = try_join_all(jobs).await?;
        tracing::info!(count = rewrapped.len(), "re-wrapped unit keys");
        Ok(rewrapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KeyStore, MemoryKeyStore};
    use std::time::Duration;

    fn cache() -> Arc<KeyCache> {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
        Arc::new(KeyCache::new(store, Duration::from_secs(60)))
    }

    fn revocable(byte: u8) -> (watch::Sender<Snapshot>, UnlockedSession) {
        let snapshot = Snapshot::unlocked_for_tests("alice", DerivedKey::for_tests(byte));
        let (tx, rx) = watch::channel(snapshot);
        let session = UnlockedSession::new("alice".into(), 0, rx, cache());
        (tx, session)
    }

    fn session(byte: u8) -> UnlockedSession {
        revocable(byte).1
    }

    #[tokio::test]
    async fn test_unit_key_lifecycle() {
        let s = session(1);
        let wrapped = s.create_unit_key(5).await.unwrap();

        let payload = s.encrypt_for_unit(5, &wrapped, "group note").await.unwrap();
        assert!(s.decrypt(&payload).await.is_err());

        s.forget_unit_key(5).await.unwrap();
        let text = s.decrypt_for_unit(5, &wrapped, &payload).await.unwrap();
        assert_eq!(text, "group note");
    }

    #[tokio::test]
    async fn test_unit_key_from_other_master_fails() {
        let owner = session(1);
        let wrapped = owner.create_unit_key(5).await.unwrap();

        let stranger = session(2);
        let err = stranger
            .encrypt_for_unit(5, &wrapped, "x")
            .await
            .unwrap_err();
        assert!(matches!(err, E2eeError::KeyUnwrapFailed));
    }

    #[tokio::test]
    async fn test_rewrap_batch() {
        let s = session(1);
        let a = s.create_unit_key(1).await.unwrap();
        let b = s.create_unit_key(2).await.unwrap();
        let payload = s.encrypt_for_unit(1, &a, "kept").await.unwrap();

        let new_master = DerivedKey::for_tests(9);
        let rewrapped = s.rewrap_unit_keys(&new_master, &[a, b]).await.unwrap();
        assert_eq!(rewrapped.len(), 2);

        let rotated = session(9);
        let text = rotated
            .decrypt_for_unit(1, &rewrapped[0], &payload)
            .await
            .unwrap();
        assert_eq!(text, "kept");
    }

    #[tokio::test]
    async fn test_revoked_session_refuses_work() {
        let (tx, s) = revocable(1);
        let wrapped = s.create_unit_key(3).await.unwrap();
        assert!(s.is_active());

        tx.send_replace(Snapshot::default());
        assert!(!s.is_active());
        assert!(matches!(s.encrypt("x").await, Err(E2eeError::KeyNotFound)));
        assert!(matches!(s.master_key(), Err(E2eeError::KeyNotFound)));
        assert!(matches!(
            s.encrypt_for_unit(3, &wrapped, "x").await,
            Err(E2eeError::KeyNotFound)
        ));
        assert!(matches!(
            s.create_unit_key(4).await,
            Err(E2eeError::KeyNotFound)
        ));
    }

    #[tokio::test]
    async fn test_debug_hides_key() {
        let shown = format!("{:?}", session(7));
        assert!(shown.contains("alice"));
        assert!(!shown.contains("7, 7"));
    }
}
