//! The search façade.
//!
//! One component answers every client query with one of two strategies:
//!
//! * [`SearchStrategy::Snapshot`] reads through the [`CacheStore`]. On a miss,
//!   one leader per cache key fetches the upstream page while concurrent
//!   callers wait for it. Failures fall back to the latest snapshot, expired
//!   or not, and surface [`SearchError::Unavailable`] only when none exists.
//! * [`SearchStrategy::Listings`] answers from the listing store only and
//!   kicks off a background collection when the stored data is stale.

use chrono::Utc;
use metrics::{histogram, increment_counter};
use std::{str::FromStr, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    cache::{CacheStore, CachedPage},
    coalesce::Coalescer,
    collector::{CollectError, CollectRequest, Collector},
    entities::{ListingView, SearchResult},
    governor::Governor,
    query::SearchQuery,
    resolver::ItemResolver,
    store::{ListingStore, StoreError},
    upstream::{total_pages, FetchError, PageRequest, PageSource, ScrapedPage, UPSTREAM_PAGE_SIZE},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchStrategy {
    #[default]
    Snapshot,
    Listings,
}

#[derive(Debug, Error)]
#[error("unknown search strategy {0:?}, expected \"snapshot\" or \"listings\"")]
pub struct UnknownStrategy(String);

impl FromStr for SearchStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "snapshot" => Ok(Self::Snapshot),
            "listings" | "listing_store" => Ok(Self::Listings),
            _ => Err(UnknownStrategy(s.to_string())),
        }
    }
}

impl SearchStrategy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::Listings => "listings",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchPolicy {
    pub strategy: SearchStrategy,
    /// Lifetime of a freshly fetched snapshot.
    pub cache_ttl: Duration,
    /// Age after which stored listings trigger a background collection.
    pub stale_after: Duration,
    pub rate_limited_retry: Duration,
    pub failure_retry: Duration,
}

impl Default for SearchPolicy {
    fn default() -> Self {
        Self {
            strategy: SearchStrategy::Snapshot,
            cache_ttl: Duration::from_secs(600),
            stale_after: Duration::from_secs(300),
            rate_limited_retry: Duration::from_secs(600),
            failure_retry: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("no data available ({reason}), retry in {}s", .retry_after.as_secs())]
    Unavailable {
        reason: &'static str,
        retry_after: Duration,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
struct Fetched {
    page: Arc<CachedPage>,
    /// False when the leader found a fresh entry on its double-check.
    fetched: bool,
}

pub struct SearchService {
    policy: SearchPolicy,
    source: Arc<dyn PageSource>,
    cache: CacheStore,
    listings: Arc<dyn ListingStore>,
    resolver: Arc<ItemResolver>,
    governor: Arc<Governor>,
    collector: Arc<Collector>,
    in_flight: Coalescer<Fetched>,
}

impl std::fmt::Debug for SearchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchService")
            .field("policy", &self.policy)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl SearchService {
    #[must_use]
    pub fn new(
        policy: SearchPolicy,
        source: Arc<dyn PageSource>,
        cache: CacheStore,
        listings: Arc<dyn ListingStore>,
        resolver: Arc<ItemResolver>,
        governor: Arc<Governor>,
        collector: Arc<Collector>,
    ) -> Self {
        Self {
            policy,
            source,
            cache,
            listings,
            resolver,
            governor,
            collector,
            in_flight: Coalescer::new(),
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &SearchPolicy {
        &self.policy
    }

    #[must_use]
    pub const fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Upstream fetches currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.in_flight()
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResult, SearchError> {
        let start = Instant::now();
        let strategy = self.policy.strategy.as_str();
        increment_counter!("vending_search_request", "strategy" => strategy);

        let result = match self.policy.strategy {
            SearchStrategy::Snapshot => {
                let query = SearchQuery {
                    sort: query.sort.on_scraped_page(),
                    ..query.clone()
                };
                self.search_snapshot(&query).await
            }
            SearchStrategy::Listings => self.search_listings(query).await,
        };

        histogram!("vending_search_time", start.elapsed(), "strategy" => strategy);
        result
    }

    async fn search_snapshot(&self, query: &SearchQuery) -> Result<SearchResult, SearchError> {
        let cache_key = query.cache_key();

        if let Some(page) = self.cache.get_fresh(&cache_key).await? {
            debug!(cache_key, "cache hit");
            return Ok(snapshot_result(query, &page, false, false, None));
        }
        increment_counter!("vending_cache_miss");

        let error = match self.in_flight.run(&cache_key, || self.lead(query)).await {
            Ok(Fetched { page, fetched }) => {
                return Ok(snapshot_result(query, &page, false, fetched, None));
            }
            Err(error) => error,
        };

        if let Some(page) = self.cache.get_latest(&cache_key).await? {
            increment_counter!("vending_cache_stale", "reason" => error.reason());
            info!(cache_key, reason = error.reason(), "serving stale snapshot");
            return Ok(snapshot_result(
                query,
                &page,
                true,
                false,
                Some(error.reason()),
            ));
        }

        Err(SearchError::Unavailable {
            reason: error.reason(),
            retry_after: self.retry_after(&error),
        })
    }

    /// Runs once per cache key at a time, inside the coalescer.
    async fn lead(&self, query: &SearchQuery) -> Result<Fetched, FetchError> {
        let cache_key = query.cache_key();

        // another leader may have just filled it
        match self.cache.get_fresh(&cache_key).await {
            Ok(Some(page)) => return Ok(Fetched { page, fetched: false }),
            Ok(None) => {}
            Err(err) => warn!(cache_key, error = %err, "cache read failed, fetching anyway"),
        }

        let cooldown_key = query.cooldown_key();
        if let Some(remaining) = self.governor.backoff_remaining(&cooldown_key) {
            return Err(FetchError::BackingOff {
                remaining_secs: remaining.as_secs().max(1),
            });
        }

        let request = PageRequest {
            server: query.server,
            keyword: query.keyword.clone(),
            page: query.page,
            sort: query.sort,
        };
        let scraped = match self
            .source
            .fetch_page(&request)
            .await
            .and_then(ScrapedPage::require_table)
        {
            Ok(scraped) => scraped,
            Err(err) => {
                if matches!(err, FetchError::RateLimited { .. }) {
                    self.governor.record_rate_limited(&cooldown_key);
                }
                return Err(err);
            }
        };

        let views: Vec<ListingView> = scraped
            .listings
            .iter()
            .map(|draft| self.resolver.view(draft))
            .collect();

        let page = match self
            .cache
            .put(query, views.clone(), scraped.total, self.policy.cache_ttl)
            .await
        {
            Ok(page) => page,
            Err(err) => {
                warn!(cache_key, error = %err, "failed to store snapshot");
                let now = Utc::now();
                Arc::new(CachedPage {
                    listings: views,
                    total: scraped.total,
                    cached_at: now,
                    expires_at: now,
                })
            }
        };

        Ok(Fetched {
            page,
            fetched: true,
        })
    }

    fn retry_after(&self, error: &FetchError) -> Duration {
        match error {
            FetchError::RateLimited { .. } => self.policy.rate_limited_retry,
            FetchError::BackingOff { remaining_secs } => Duration::from_secs(*remaining_secs),
            _ => self.policy.failure_retry,
        }
    }

    async fn search_listings(&self, query: &SearchQuery) -> Result<SearchResult, SearchError> {
        let server = query.server.code();
        let page = self
            .listings
            .search(server, &query.keyword, query.page, query.size, query.sort)
            .await?;
        let latest = self
            .listings
            .latest_scraped_at(server, &query.keyword)
            .await?;

        let stale_after = chrono::Duration::from_std(self.policy.stale_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let stale = latest.map_or(true, |at| Utc::now() - at > stale_after);
        if stale {
            self.refresh_in_background(query);
        }

        if latest.is_none() {
            return Err(SearchError::Unavailable {
                reason: "no_snapshot",
                retry_after: self.policy.failure_retry,
            });
        }

        Ok(SearchResult {
            data: page
                .listings
                .into_iter()
                .map(|listing| self.resolver.view_stored(listing))
                .collect(),
            total: page.total,
            page: query.page,
            size: query.size,
            total_pages: total_pages(page.total, i64::from(query.size)),
            scraped_at: latest,
            stale,
            refresh_triggered: stale,
            reason: stale.then(|| "refreshing".to_string()),
        })
    }

    fn refresh_in_background(&self, query: &SearchQuery) {
        let collector = Arc::clone(&self.collector);
        let request = CollectRequest {
            server: query.server,
            keyword: query.keyword.clone(),
            start_page: 1,
            max_pages: collector.policy().max_pages,
        };

        tokio::spawn(async move {
            match collector.collect(&request).await {
                Ok(report) => debug!(
                    server = %request.server,
                    keyword = request.keyword,
                    saved = report.saved_count(),
                    "background refresh finished"
                ),
                Err(CollectError::Refused(refusal)) => debug!(
                    server = %request.server,
                    keyword = request.keyword,
                    %refusal,
                    "background refresh skipped"
                ),
                Err(err) => warn!(
                    server = %request.server,
                    keyword = request.keyword,
                    error = %err,
                    "background refresh failed"
                ),
            }
        });
    }
}

/// Snapshots hold one upstream page, so `size` is the upstream page size
/// whatever the caller asked for.
fn snapshot_result(
    query: &SearchQuery,
    page: &CachedPage,
    stale: bool,
    refresh_triggered: bool,
    reason: Option<&str>,
) -> SearchResult {
    SearchResult {
        data: page.listings.clone(),
        total: page.total,
        page: query.page,
        size: u32::try_from(UPSTREAM_PAGE_SIZE).unwrap_or(u32::MAX),
        total_pages: total_pages(page.total, UPSTREAM_PAGE_SIZE),
        scraped_at: Some(page.cached_at),
        stale,
        refresh_triggered,
        reason: reason.map(str::to_string),
    }
}
