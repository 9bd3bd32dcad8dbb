//! Batch collection of upstream pages into the listing store.

use chrono::Utc;
use metrics::{counter, histogram, increment_counter};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{
    entities::NewListing,
    governor::{Governor, Refusal},
    query::{cooldown_key, Sort},
    resolver::ItemResolver,
    servers::Server,
    store::{ListingStore, StoreError, Upserted},
    upstream::{DraftListing, FetchError, PageRequest, PageSource, ScrapedPage},
    util::random_between,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectPolicy {
    /// Hard cap on pages per collection, whatever the caller asks for.
    pub max_pages: u32,
    pub page_delay_min: Duration,
    pub page_delay_max: Duration,
}

impl Default for CollectPolicy {
    fn default() -> Self {
        Self {
            max_pages: 5,
            page_delay_min: Duration::from_secs(3),
            page_delay_max: Duration::from_secs(6),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectRequest {
    pub server: Server,
    pub keyword: String,
    pub start_page: u32,
    pub max_pages: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestCounts {
    pub inserted: usize,
    pub updated: usize,
    /// Rows without upstream identifiers.
    pub skipped: usize,
}

impl IngestCounts {
    #[must_use]
    pub const fn saved(&self) -> usize {
        self.inserted + self.updated
    }

    fn add(&mut self, other: &Self) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectReport {
    pub pages_fetched: u32,
    pub rows_seen: usize,
    #[serde(flatten)]
    pub counts: IngestCounts,
    pub rate_limited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CollectReport {
    #[must_use]
    pub const fn saved_count(&self) -> usize {
        self.counts.saved()
    }
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error(transparent)]
    Refused(#[from] Refusal),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Collector {
    source: Arc<dyn PageSource>,
    listings: Arc<dyn ListingStore>,
    resolver: Arc<ItemResolver>,
    governor: Arc<Governor>,
    policy: CollectPolicy,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Collector {
    #[must_use]
    pub fn new(
        source: Arc<dyn PageSource>,
        listings: Arc<dyn ListingStore>,
        resolver: Arc<ItemResolver>,
        governor: Arc<Governor>,
        policy: CollectPolicy,
    ) -> Self {
        Self {
            source,
            listings,
            resolver,
            governor,
            policy,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &CollectPolicy {
        &self.policy
    }

    /// Fetches up to `max_pages` pages starting at `start_page` and upserts
    /// every persistable row. Refused without touching the upstream when the
    /// governor says no.
    pub async fn collect(&self, request: &CollectRequest) -> Result<CollectReport, CollectError> {
        let key = cooldown_key(request.server, &request.keyword);
        let _permit = self.governor.try_begin(&key)?;
        let start = Instant::now();

        let mut report = CollectReport::default();
        let result = self.crawl(request, &key, &mut report).await;

        // a rate limit already installed a longer window
        if !report.rate_limited {
            self.governor.finish(&key);
        }
        result?;

        histogram!("vending_collect_time", start.elapsed(), "server" => request.server.code());
        info!(
            server = %request.server,
            keyword = request.keyword,
            pages = report.pages_fetched,
            saved = report.saved_count(),
            rate_limited = report.rate_limited,
            "collection finished"
        );
        Ok(report)
    }

    async fn crawl(
        &self,
        request: &CollectRequest,
        key: &str,
        report: &mut CollectReport,
    ) -> Result<(), StoreError> {
        let first = request.start_page.max(1);
        let pages = request.max_pages.clamp(1, self.policy.max_pages.max(1));

        for page in first..first.saturating_add(pages) {
            if page > first {
                tokio::time::sleep(random_between(
                    self.policy.page_delay_min,
                    self.policy.page_delay_max,
                ))
                .await;
            }

            let fetch = PageRequest {
                server: request.server,
                keyword: request.keyword.clone(),
                page,
                sort: Sort::default(),
            };
            let scraped = match self
                .source
                .fetch_page(&fetch)
                .await
                .and_then(ScrapedPage::require_table)
            {
                Ok(scraped) => scraped,
                Err(err @ FetchError::RateLimited { .. }) => {
                    self.governor.record_rate_limited(key);
                    report.rate_limited = true;
                    report.error = Some(err.to_string());
                    break;
                }
                Err(err) => {
                    warn!(
                        server = %request.server,
                        keyword = request.keyword,
                        page,
                        error = %err,
                        "collection stopped on fetch failure"
                    );
                    report.error = Some(err.to_string());
                    break;
                }
            };

            report.pages_fetched += 1;
            if scraped.listings.is_empty() {
                break;
            }
            report.rows_seen += scraped.listings.len();

            let counts = self
                .ingest(request.server, &scraped.listings, page)
                .await?;
            report.counts.add(&counts);
        }

        Ok(())
    }

    /// Upserts already scraped rows. Shared by collection and trusted uploads.
    pub async fn ingest(
        &self,
        server: Server,
        drafts: &[DraftListing],
        source_page: u32,
    ) -> Result<IngestCounts, StoreError> {
        let scraped_at = Utc::now();
        let mut counts = IngestCounts::default();

        for draft in drafts {
            let Some((map_id, transaction_id)) = draft.ids() else {
                counts.skipped += 1;
                continue;
            };

            let (item_name_normalized, item_id) =
                self.resolver.identify(&draft.item_name, draft.image_item_id);
            let listing = NewListing {
                server: server.code().to_string(),
                map_id: map_id.to_string(),
                transaction_id: transaction_id.to_string(),
                item_name: draft.item_name.clone(),
                item_name_normalized,
                item_id,
                price: draft.price,
                quantity: draft.quantity,
                shop_name: draft.shop_name.clone(),
                seller_name: draft.seller_name.clone(),
                location: draft.location.clone(),
                deal_type: draft.deal_type,
                scraped_at,
                source_page: i32::try_from(source_page).unwrap_or(i32::MAX),
            };

            match self.listings.upsert(&listing).await? {
                Upserted::Inserted => counts.inserted += 1,
                Upserted::Updated => counts.updated += 1,
            }
        }

        counter!("vending_rows_upserted", counts.saved() as u64, "server" => server.code());
        if counts.skipped > 0 {
            increment_counter!("vending_rows_unpersistable", "server" => server.code());
        }
        Ok(counts)
    }
}
