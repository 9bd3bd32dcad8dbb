use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use super::StoreError;
use crate::entities::CacheEntry;

/// Durable store of cached result pages. Rows outlive their expiry so they
/// can be served as stale fallback; a periodic sweep removes them later.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Entry for the key that has not expired at `now`.
    async fn find_valid(
        &self,
        cache_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, StoreError>;

    /// Entry for the key regardless of expiry.
    async fn find_latest(&self, cache_key: &str) -> Result<Option<CacheEntry>, StoreError>;

    async fn upsert(&self, entry: &CacheEntry) -> Result<(), StoreError>;

    /// Deletes entries that expired before `cutoff`.
    async fn delete_expired_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

fn check_entry(entry: &CacheEntry) -> Result<(), StoreError> {
    if entry.expires_at <= entry.cached_at {
        return Err(StoreError::Invalid(format!(
            "{} expires at or before it was cached",
            entry.cache_key
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const ENTRY_COLUMNS: &str = "cache_key, server, keyword, page, size, item_order, result_json, \
                             total_count, cached_at, expires_at";

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn find_valid(
        &self,
        cache_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, StoreError> {
        let entry = sqlx::query_as::<_, CacheEntry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM vending_search_cache WHERE cache_key = $1 AND expires_at > $2"
        ))
        .bind(cache_key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    async fn find_latest(&self, cache_key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let entry = sqlx::query_as::<_, CacheEntry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM vending_search_cache WHERE cache_key = $1"
        ))
        .bind(cache_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    async fn upsert(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        check_entry(entry)?;

        sqlx::query(
            "INSERT INTO vending_search_cache (
                cache_key, server, keyword, page, size, item_order,
                result_json, total_count, cached_at, expires_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
            ON CONFLICT (cache_key) DO UPDATE SET
                result_json = EXCLUDED.result_json,
                total_count = EXCLUDED.total_count,
                cached_at = EXCLUDED.cached_at,
                expires_at = EXCLUDED.expires_at",
        )
        .bind(&entry.cache_key)
        .bind(&entry.server)
        .bind(&entry.keyword)
        .bind(entry.page)
        .bind(entry.size)
        .bind(&entry.item_order)
        .bind(&entry.result_json)
        .bind(entry.total_count)
        .bind(entry.cached_at)
        .bind(entry.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_expired_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let deleted = sqlx::query("DELETE FROM vending_search_cache WHERE expires_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }
}

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemorySnapshotStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, cache_key: &str) -> Option<CacheEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cache_key)
            .cloned()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn find_valid(
        &self,
        cache_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self.get(cache_key).filter(|entry| entry.is_valid_at(now)))
    }

    async fn find_latest(&self, cache_key: &str) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self.get(cache_key))
    }

    async fn upsert(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        check_entry(entry)?;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.cache_key.clone(), entry.clone());
        Ok(())
    }

    async fn delete_expired_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at >= cutoff);
        Ok(u64::try_from(before - entries.len()).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(key: &str, cached_at: DateTime<Utc>, ttl: Duration) -> CacheEntry {
        CacheEntry {
            cache_key: key.to_string(),
            server: "baphomet".to_string(),
            keyword: "Red Potion".to_string(),
            page: 1,
            size: 10,
            item_order: "price".to_string(),
            result_json: "[]".to_string(),
            total_count: 0,
            cached_at,
            expires_at: cached_at + ttl,
        }
    }

    #[tokio::test]
    async fn valid_versus_latest() {
        let store = MemorySnapshotStore::new();
        let now = Utc::now();
        store
            .upsert(&entry("k", now - Duration::minutes(20), Duration::minutes(10)))
            .await
            .unwrap();

        assert!(store.find_valid("k", now).await.unwrap().is_none());
        assert!(store.find_latest("k").await.unwrap().is_some());
        assert!(store.find_latest("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_non_expiring_entries() {
        let store = MemorySnapshotStore::new();
        let result = store.upsert(&entry("k", Utc::now(), Duration::zero())).await;
        assert!(matches!(result, Err(StoreError::Invalid(_))));
    }

    #[tokio::test]
    async fn sweep_respects_cutoff() {
        let store = MemorySnapshotStore::new();
        let now = Utc::now();
        store
            .upsert(&entry("old", now - Duration::days(3), Duration::minutes(10)))
            .await
            .unwrap();
        store
            .upsert(&entry("recent", now - Duration::minutes(30), Duration::minutes(10)))
            .await
            .unwrap();

        let deleted = store
            .delete_expired_before(now - Duration::days(1))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(store.find_latest("recent").await.unwrap().is_some());
    }
}
