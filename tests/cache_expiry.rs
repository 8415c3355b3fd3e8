use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use passkey_vault::keys;
use passkey_vault::store::{CacheRecord, KeyStore, MemoryKeyStore, RecordKey};
use passkey_vault::KeyCache;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

async fn stale_store(age: TimeDelta) -> Arc<MemoryKeyStore> {
    let store = Arc::new(MemoryKeyStore::new());
    store.open().await.unwrap();
    let record = CacheRecord {
        key: keys::generate_unit_key().unwrap(),
        cached_at: Utc::now() - age,
    };
    store
        .put(RecordKey::Master("alice".into()), record)
        .await
        .unwrap();
    store
}

async fn settle(store: &MemoryKeyStore) {
    for _ in 0..100 {
        if store.is_empty().await {
            return;
        }
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_entry_older_than_ttl_reads_as_absent() {
    let store = stale_store(TimeDelta::hours(24) + TimeDelta::seconds(1)).await;
    let cache = KeyCache::new(Arc::clone(&store) as Arc<dyn KeyStore>, DAY);

    // Physically present until the purge runs.
    assert_eq!(store.len().await, 1);
    assert!(cache.get("alice").await.unwrap().is_none());

    settle(&store).await;
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_entry_within_ttl_is_served() {
    let store = stale_store(TimeDelta::hours(23)).await;
    let cache = KeyCache::new(Arc::clone(&store) as Arc<dyn KeyStore>, DAY);
    assert!(cache.get("alice").await.unwrap().is_some());
}

#[tokio::test]
async fn test_purge_spares_fresh_store_for_same_owner() {
    let store = stale_store(TimeDelta::hours(30)).await;
    let cache = KeyCache::new(Arc::clone(&store) as Arc<dyn KeyStore>, DAY);

    let fresh = keys::generate_unit_key().unwrap();
    // The expired read schedules a purge; the store lands before it runs.
    assert!(cache.get("alice").await.unwrap().is_none());
    cache.store("alice", &fresh).await.unwrap();
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    let hit = cache.get("alice").await.unwrap().unwrap();
    assert!(hit.same_handle(&fresh));
}

#[tokio::test]
async fn test_shorter_configured_ttl() {
    let store = stale_store(TimeDelta::minutes(10)).await;
    let cache = KeyCache::new(
        Arc::clone(&store) as Arc<dyn KeyStore>,
        Duration::from_secs(5 * 60),
    );
    assert!(cache.get("alice").await.unwrap().is_none());
}
