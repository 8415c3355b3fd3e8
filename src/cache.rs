//! Session key cache.
//!
//! Keeps derived master keys (one per owner) and unit keys (one per unit id)
//! in a [`KeyStore`] for a bounded time, so a reload within the TTL does not
//! need a new ceremony.
//!
//! - Expired entries read as absent. The read schedules a purge and returns
//!   without waiting for it.
//! - The purge is a compare-and-delete on `cached_at`, so it can never remove
//!   a record written by a concurrent `store` for the same owner.
//! - Backend faults surface as `StorageError`; raw backend errors never leak.
//! - `clear_all` on a context without storage is a successful no-op.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;

use crate::error::{E2eeError, Result};
use crate::keys::DerivedKey;
use crate::store::{CacheRecord, ClearScope, KeyStore, RecordKey};

/// Persistent key cache with TTL expiry. Owns its store handle.
pub struct KeyCache {
    store: Arc<dyn KeyStore>,
    ttl: TimeDelta,
    opened: Mutex<bool>,
}

impl KeyCache {
    pub fn new(store: Arc<dyn KeyStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
            opened: Mutex::new(false),
        }
    }

    /// Whether persistent storage exists in this context.
    pub fn is_storage_available(&self) -> bool {
        self.store.is_available()
    }

    /// Open the store if it is not open yet.
    async fn ready(&self) -> Result<()> {
        if !self.store.is_available() {
            return Err(E2eeError::StorageError {
                context: "persistent storage is unavailable",
                source: None,
            });
        }
        let mut opened = self.opened.lock().await;
        if !*opened {
            self.store
                .open()
                .await
                .map_err(|e| E2eeError::storage("open key store", e))?;
            *opened = true;
            tracing::debug!("opened key store");
        }
        Ok(())
    }

    /// Release this cache's hold on the store. Other holders keep it open;
    /// the next operation here reopens it.
    pub async fn close(&self) {
        let mut opened = self.opened.lock().await;
        if *opened {
            self.store.close().await;
            *opened = false;
            tracing::debug!("closed key store");
        }
    }

    fn is_expired(&self, cached_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(cached_at) > self.ttl
    }

    async fn put(&self, key: RecordKey, handle: &DerivedKey) -> Result<()> {
        self.ready().await?;
        let record = CacheRecord {
            key: handle.clone(),
            cached_at: Utc::now(),
        };
        self.store
            .put(key, record)
            .await
            .map_err(|e| E2eeError::storage("store key", e))
    }

    async fn lookup(&self, key: RecordKey) -> Result<Option<DerivedKey>> {
        self.ready().await?;
        let record = self
            .store
            .get(&key)
            .await
            .map_err(|e| E2eeError::storage("read key", e))?;

        let Some(record) = record else {
            return Ok(None);
        };
        if self.is_expired(record.cached_at, Utc::now()) {
            tracing::debug!(record = ?key, "cached key expired");
            self.purge(key, record.cached_at).await;
            return Ok(None);
        }
        Ok(Some(record.key))
    }

    /// Remove an expired record without making the caller wait for it.
    async fn purge(&self, key: RecordKey, cached_at: DateTime<Utc>) {
        let store = Arc::clone(&self.store);
        let task = async move {
            match store.delete_if_cached_at(&key, cached_at).await {
                Ok(true) => tracing::debug!(record = ?key, "purged expired key"),
                Ok(false) => {}
                Err(e) => tracing::warn!(record = ?key, error = %e, "failed to purge expired key"),
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(task);
            }
            Err(_) => task.await,
        }
    }

    async fn remove(&self, key: RecordKey) -> Result<()> {
        self.ready().await?;
        self.store
            .delete(&key)
            .await
            .map_err(|e| E2eeError::storage("delete key", e))
    }

    async fn clear(&self, scope: ClearScope) -> Result<()> {
        if !self.store.is_available() {
            tracing::debug!("no persistent storage; nothing to clear");
            return Ok(());
        }
        self.ready().await?;
        self.store
            .clear(scope)
            .await
            .map_err(|e| E2eeError::storage("clear keys", e))
    }

    // -----------------------------------------------------------------------
    // Master keys
    // -----------------------------------------------------------------------

    pub async fn store(&self, owner: &str, key: &DerivedKey) -> Result<()> {
        self.put(RecordKey::Master(owner.to_string()), key).await?;
        tracing::debug!(owner, "cached master key");
        Ok(())
    }

    /// The owner's key, or `None` if absent or expired.
    pub async fn get(&self, owner: &str) -> Result<Option<DerivedKey>> {
        self.lookup(RecordKey::Master(owner.to_string())).await
    }

    /// Like [`get`](Self::get), but a miss is `KeyNotFound`.
    pub async fn require(&self, owner: &str) -> Result<DerivedKey> {
        self.get(owner).await?.ok_or(E2eeError::KeyNotFound)
    }

    pub async fn delete(&self, owner: &str) -> Result<()> {
        self.remove(RecordKey::Master(owner.to_string())).await
    }

    /// Remove every master and unit key in one transaction.
    pub async fn clear_all(&self) -> Result<()> {
        self.clear(ClearScope::All).await
    }

    // -----------------------------------------------------------------------
    // Unit keys
    // -----------------------------------------------------------------------

    pub async fn store_unit(&self, unit_id: u64, key: &DerivedKey) -> Result<()> {
        self.put(RecordKey::Unit(unit_id), key).await
    }

    pub async fn get_unit(&self, unit_id: u64) -> Result<Option<DerivedKey>> {
        self.lookup(RecordKey::Unit(unit_id)).await
    }

    pub async fn delete_unit(&self, unit_id: u64) -> Result<()> {
        self.remove(RecordKey::Unit(unit_id)).await
    }

    pub async fn clear_units(&self) -> Result<()> {
        self.clear(ClearScope::Units).await
    }
}
