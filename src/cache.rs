//! Two-level result cache: a short-TTL in-process front cache over the
//! durable [`SnapshotStore`]. Expired snapshots are kept for stale fallback
//! and only removed by [`CacheStore::sweep`].

use chrono::{DateTime, Utc};
use metrics::increment_counter;
use moka::future::Cache;
use std::{sync::Arc, time::Duration};
use tracing::debug;

use crate::{
    entities::{CacheEntry, ListingView},
    query::SearchQuery,
    store::{SnapshotStore, StoreError},
};

/// A decoded cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPage {
    pub listings: Vec<ListingView>,
    pub total: i64,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CachedPage {
    fn decode(entry: &CacheEntry) -> Result<Self, StoreError> {
        Ok(Self {
            listings: serde_json::from_str(&entry.result_json)?,
            total: i64::from(entry.total_count),
            cached_at: entry.cached_at,
            expires_at: entry.expires_at,
        })
    }

    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Clone)]
pub struct CacheStore {
    front: Cache<String, Arc<CachedPage>>,
    snapshots: Arc<dyn SnapshotStore>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("front_entries", &self.front.entry_count())
            .finish_non_exhaustive()
    }
}

impl CacheStore {
    #[must_use]
    pub fn new(snapshots: Arc<dyn SnapshotStore>, front_capacity: u64, front_ttl: Duration) -> Self {
        Self {
            front: Cache::builder()
                .max_capacity(front_capacity)
                .time_to_live(front_ttl)
                .build(),
            snapshots,
        }
    }

    /// Unexpired page for the key, front cache first.
    pub async fn get_fresh(&self, cache_key: &str) -> Result<Option<Arc<CachedPage>>, StoreError> {
        let now = Utc::now();

        if let Some(page) = self.front.get(cache_key) {
            if page.is_valid_at(now) {
                increment_counter!("vending_cache_hit", "level" => "front");
                return Ok(Some(page));
            }
            self.front.invalidate(cache_key).await;
        }

        let Some(entry) = self.snapshots.find_valid(cache_key, now).await? else {
            return Ok(None);
        };

        increment_counter!("vending_cache_hit", "level" => "snapshot");
        let page = Arc::new(CachedPage::decode(&entry)?);
        self.front
            .insert(cache_key.to_string(), Arc::clone(&page))
            .await;
        Ok(Some(page))
    }

    /// Most recent page for the key, expired or not.
    pub async fn get_latest(&self, cache_key: &str) -> Result<Option<CachedPage>, StoreError> {
        match self.snapshots.find_latest(cache_key).await? {
            Some(entry) => Ok(Some(CachedPage::decode(&entry)?)),
            None => Ok(None),
        }
    }

    /// Stores a freshly fetched page. TTLs under one second are raised to one
    /// second so an entry always expires after it was cached.
    pub async fn put(
        &self,
        query: &SearchQuery,
        listings: Vec<ListingView>,
        total: i64,
        ttl: Duration,
    ) -> Result<Arc<CachedPage>, StoreError> {
        let ttl = chrono::Duration::from_std(ttl.max(Duration::from_secs(1)))
            .unwrap_or_else(|_| chrono::Duration::seconds(1));
        let cached_at = Utc::now();
        let cache_key = query.cache_key();

        let entry = CacheEntry {
            cache_key: cache_key.clone(),
            server: query.server.code().to_string(),
            keyword: query.keyword.clone(),
            page: i32::try_from(query.page).unwrap_or(i32::MAX),
            size: i32::try_from(query.size).unwrap_or(i32::MAX),
            item_order: query.sort.token(),
            result_json: serde_json::to_string(&listings)?,
            total_count: i32::try_from(total).unwrap_or(i32::MAX),
            cached_at,
            expires_at: cached_at + ttl,
        };
        self.snapshots.upsert(&entry).await?;

        let page = Arc::new(CachedPage {
            listings,
            total,
            cached_at,
            expires_at: entry.expires_at,
        });
        self.front.insert(cache_key, Arc::clone(&page)).await;
        debug!(cache_key = entry.cache_key, rows = page.listings.len(), "cached result page");
        Ok(page)
    }

    /// Deletes snapshots that expired more than `retention` ago.
    pub async fn sweep(&self, retention: Duration) -> Result<u64, StoreError> {
        let retention =
            chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(1));
        self.snapshots
            .delete_expired_before(Utc::now() - retention)
            .await
    }

    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.front.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        entities::DealType,
        query::Sort,
        servers::Server,
        store::MemorySnapshotStore,
    };

    fn query() -> SearchQuery {
        SearchQuery {
            server: Server::Baphomet,
            keyword: "Red Potion".to_string(),
            page: 1,
            size: 10,
            sort: Sort::default(),
        }
    }

    fn view() -> ListingView {
        ListingView {
            item_name: "Red Potion".to_string(),
            item_name_normalized: "Red Potion".to_string(),
            item_id: Some(501),
            icon_url: None,
            image_url: None,
            price: 50,
            quantity: 10,
            shop_name: "Potions".to_string(),
            seller_name: None,
            location: Some("prontera".to_string()),
            deal_type: DealType::Sell,
            map_id: Some("1".to_string()),
            transaction_id: Some("2".to_string()),
        }
    }

    fn store(snapshots: Arc<MemorySnapshotStore>) -> CacheStore {
        CacheStore::new(snapshots, 100, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn put_then_read_back() {
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let cache = store(Arc::clone(&snapshots));
        let query = query();

        let stored = cache
            .put(&query, vec![view()], 1, Duration::from_secs(600))
            .await
            .unwrap();
        assert!(stored.expires_at > stored.cached_at);

        let fresh = cache.get_fresh(&query.cache_key()).await.unwrap().unwrap();
        assert_eq!(fresh.listings, vec![view()]);
        assert_eq!(fresh.total, 1);

        // a second store over the same snapshots sees it too
        let other = store(snapshots);
        assert!(other.get_fresh(&query.cache_key()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn zero_ttl_still_expires_after_cached_at() {
        let cache = store(Arc::new(MemorySnapshotStore::new()));
        let stored = cache
            .put(&query(), Vec::new(), 0, Duration::ZERO)
            .await
            .unwrap();
        assert!(stored.expires_at > stored.cached_at);
    }

    #[tokio::test]
    async fn expired_snapshot_is_only_latest() {
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let cached_at = Utc::now() - chrono::Duration::minutes(30);
        snapshots
            .upsert(&CacheEntry {
                cache_key: query().cache_key(),
                server: "baphomet".to_string(),
                keyword: "Red Potion".to_string(),
                page: 1,
                size: 10,
                item_order: "price".to_string(),
                result_json: serde_json::to_string(&vec![view()]).unwrap(),
                total_count: 1,
                cached_at,
                expires_at: cached_at + chrono::Duration::minutes(10),
            })
            .await
            .unwrap();

        let cache = store(snapshots);
        assert!(cache.get_fresh(&query().cache_key()).await.unwrap().is_none());
        let latest = cache.get_latest(&query().cache_key()).await.unwrap().unwrap();
        assert_eq!(latest.listings.len(), 1);

        assert_eq!(cache.sweep(Duration::from_secs(86400)).await.unwrap(), 0);
        assert_eq!(cache.sweep(Duration::from_secs(60)).await.unwrap(), 1);
    }
}
