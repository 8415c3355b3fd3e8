//! Key store backends.
//!
//! A [`KeyStore`] is an origin-scoped, transactional key-value store that
//! holds key handles directly, without serializing them. Each trait method
//! is one transaction: it either applies completely or not at all.
//!
//! One store is shared by every cache of the same origin. `open` and `close`
//! are counted: the store stays open while any holder has it open.
//!
//! [`MemoryKeyStore`] is the in-process implementation. It backs the cache
//! in tests and in hosts without a platform store, and can be constructed
//! as unavailable to model contexts where persistent storage is disabled.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::error::BoxError;
use crate::keys::DerivedKey;

/// Addresses one record. Master keys and unit keys live in separate stores.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKey {
    /// Master key store, keyed by owner (user) id.
    Master(String),
    /// Unit key store, keyed by unit id.
    Unit(u64),
}

/// A cached key handle and when it was cached.
#[derive(Debug, Clone)]
pub struct CacheRecord {
    pub key: DerivedKey,
    pub cached_at: DateTime<Utc>,
}

/// Which records a [`KeyStore::clear`] removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearScope {
    Units,
    All,
}

/// A backend failure, as raised by the underlying platform store.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct StoreFault {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl StoreFault {
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

pub type StoreResult<T> = std::result::Result<T, StoreFault>;

#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Whether persistent storage exists in this context at all.
    fn is_available(&self) -> bool;

    /// Take a hold on the store, opening it if nobody holds it yet.
    async fn open(&self) -> StoreResult<()>;

    /// Release one hold taken by `open`.
    async fn close(&self);

    async fn put(&self, key: RecordKey, record: CacheRecord) -> StoreResult<()>;

    async fn get(&self, key: &RecordKey) -> StoreResult<Option<CacheRecord>>;

    async fn delete(&self, key: &RecordKey) -> StoreResult<()>;

    /// Delete the record only if it is still the one cached at `cached_at`.
    /// Returns whether a record was removed.
    async fn delete_if_cached_at(
        &self,
        key: &RecordKey,
        cached_at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Remove every record in `scope` in one transaction.
    async fn clear(&self, scope: ClearScope) -> StoreResult<()>;
}

#[derive(Default)]
struct Tables {
    holders: usize,
    masters: HashMap<String, CacheRecord>,
    units: HashMap<u64, CacheRecord>,
}

impl Tables {
    fn ensure_open(&self) -> StoreResult<()> {
        if self.holders > 0 {
            Ok(())
        } else {
            Err(StoreFault::new("key store is not open"))
        }
    }

    fn slot(&self, key: &RecordKey) -> Option<&CacheRecord> {
        match key {
            RecordKey::Master(owner) => self.masters.get(owner),
            RecordKey::Unit(id) => self.units.get(id),
        }
    }

    fn remove(&mut self, key: &RecordKey) -> Option<CacheRecord> {
        match key {
            RecordKey::Master(owner) => self.masters.remove(owner),
            RecordKey::Unit(id) => self.units.remove(id),
        }
    }
}

/// In-process [`KeyStore`]. One lock acquisition per call makes every call
/// a transaction; `clear(All)` empties both stores under the same lock.
pub struct MemoryKeyStore {
    available: bool,
    tables: Mutex<Tables>,
}

impl Default for MemoryKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self {
            available: true,
            tables: Mutex::new(Tables::default()),
        }
    }

    /// A store for contexts without persistent storage (private browsing).
    pub fn unavailable() -> Self {
        Self {
            available: false,
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Number of physically present records, expired or not.
    pub async fn len(&self) -> usize {
        let tables = self.tables.lock().await;
        tables.masters.len() + tables.units.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn open(&self) -> StoreResult<()> {
        if !self.available {
            return Err(StoreFault::new("persistent storage is disabled"));
        }
        self.tables.lock().await.holders += 1;
        Ok(())
    }

    async fn close(&self) {
        let mut tables = self.tables.lock().await;
        tables.holders = tables.holders.saturating_sub(1);
    }

    async fn put(&self, key: RecordKey, record: CacheRecord) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        tables.ensure_open()?;
        match key {
            RecordKey::Master(owner) => {
                tables.masters.insert(owner, record);
            }
            RecordKey::Unit(id) => {
                tables.units.insert(id, record);
            }
        }
        Ok(())
    }

    async fn get(&self, key: &RecordKey) -> StoreResult<Option<CacheRecord>> {
        let tables = self.tables.lock().await;
        tables.ensure_open()?;
        Ok(tables.slot(key).cloned())
    }

    async fn delete(&self, key: &RecordKey) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        tables.ensure_open()?;
        tables.remove(key);
        Ok(())
    }

    async fn delete_if_cached_at(
        &self,
        key: &RecordKey,
        cached_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.lock().await;
        tables.ensure_open()?;
        let matches = tables
            .slot(key)
            .is_some_and(|record| record.cached_at == cached_at);
        if matches {
            tables.remove(key);
        }
        Ok(matches)
    }

    async fn clear(&self, scope: ClearScope) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        tables.ensure_open()?;
        tables.units.clear();
        if scope == ClearScope::All {
            tables.masters.clear();
        }
        Ok(())
    }
}
