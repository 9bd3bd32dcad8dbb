//! Access to the upstream marketplace website.
//!
//! The upstream has no API, so every page is fetched as HTML and parsed into
//! [`DraftListing`]s. This layer never retries; backoff and fallback live in
//! the search façade and the collector.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::{
    entities::DealType,
    query::{Sort, SortDir, SortField},
    servers::Server,
};

pub mod client;
#[cfg(test)]
pub mod fake;
pub mod parser;

pub use client::UpstreamClient;

/// Rows per upstream result page. The upstream ignores any requested size.
pub const UPSTREAM_PAGE_SIZE: i64 = 10;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("upstream rate limited the request (status {status})")]
    RateLimited { status: u16 },
    #[error("backing off after upstream rate limit, {remaining_secs}s remaining")]
    BackingOff { remaining_secs: u64 },
    #[error("upstream returned status {0}")]
    Status(u16),
    #[error("upstream request timed out")]
    Timeout,
    #[error("upstream request failed: {0}")]
    Transport(String),
    #[error("upstream page has no result table")]
    MissingTable,
    #[error("upstream fetch was abandoned before completing")]
    Abandoned,
}

impl FetchError {
    /// Whether the upstream explicitly throttled us (now or recently).
    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::BackingOff { .. })
    }

    /// Short reason code surfaced to clients alongside stale data.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::BackingOff { .. } => "backing_off",
            Self::Status(_) => "upstream_status",
            Self::Timeout => "upstream_timeout",
            Self::MissingTable => "upstream_markup",
            Self::Transport(_) | Self::Abandoned => "upstream_error",
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout;
        }
        match err.status() {
            Some(reqwest::StatusCode::TOO_MANY_REQUESTS) => Self::RateLimited { status: 429 },
            Some(status) => Self::Status(status.as_u16()),
            None => Self::Transport(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub server: Server,
    pub keyword: String,
    pub page: u32,
    pub sort: Sort,
}

/// One row as scraped, before name resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftListing {
    pub item_name: String,
    pub image_url: Option<String>,
    /// Numeric file stem of the row image, usually the catalog id.
    pub image_item_id: Option<i32>,
    pub price: i64,
    pub quantity: i32,
    pub shop_name: String,
    pub seller_name: Option<String>,
    pub location: Option<String>,
    pub deal_type: DealType,
    pub map_id: Option<String>,
    pub transaction_id: Option<String>,
}

impl DraftListing {
    /// `(map_id, transaction_id)`. Rows without them can be shown but never
    /// stored.
    #[must_use]
    pub fn ids(&self) -> Option<(&str, &str)> {
        self.map_id.as_deref().zip(self.transaction_id.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapedPage {
    pub page: u32,
    pub listings: Vec<DraftListing>,
    /// Total results reported by the upstream summary, or the parsed row count.
    pub total: i64,
    pub skipped_rows: usize,
    pub table_found: bool,
}

impl ScrapedPage {
    /// A page without the result table is a maintenance or block page, never
    /// an empty result.
    pub fn require_table(self) -> Result<Self, FetchError> {
        if self.table_found {
            Ok(self)
        } else {
            Err(FetchError::MissingTable)
        }
    }

    pub fn sort_by(&mut self, sort: Sort) {
        let sort = sort.on_scraped_page();
        self.listings.sort_by(|a, b| {
            let ordering = match sort.field {
                SortField::Price | SortField::ScrapedAt => a.price.cmp(&b.price),
                SortField::Quantity => a.quantity.cmp(&b.quantity),
                SortField::Name => a.item_name.cmp(&b.item_name),
            };
            match sort.dir {
                SortDir::Asc => ordering,
                SortDir::Desc => ordering.reverse(),
            }
        });
    }
}

#[must_use]
pub fn total_pages(total: i64, size: i64) -> i64 {
    if size <= 0 || total <= 0 {
        return 0;
    }
    (total + size - 1) / size
}

/// Shop details from the upstream listing detail page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingDetail {
    pub shop_title: Option<String>,
    pub seller_name: Option<String>,
    pub map_id: String,
    pub transaction_id: String,
    pub slots: Vec<String>,
}

/// Something that can produce upstream pages. Implemented by
/// [`UpstreamClient`]; tests substitute their own.
#[async_trait]
pub trait PageSource: Send + Sync + std::fmt::Debug {
    async fn fetch_page(&self, request: &PageRequest) -> Result<ScrapedPage, FetchError>;

    async fn fetch_detail(
        &self,
        server: Server,
        map_id: &str,
        transaction_id: &str,
    ) -> Result<ListingDetail, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_round_up() {
        assert_eq!(total_pages(0, 10), 0);
        assert_eq!(total_pages(1, 10), 1);
        assert_eq!(total_pages(10, 10), 1);
        assert_eq!(total_pages(11, 10), 2);
    }

    #[test]
    fn rate_limit_classification() {
        assert!(FetchError::RateLimited { status: 429 }.is_rate_limited());
        assert!(FetchError::BackingOff { remaining_secs: 5 }.is_rate_limited());
        assert!(!FetchError::Timeout.is_rate_limited());
        assert_eq!(FetchError::Status(503).reason(), "upstream_status");
        assert!(!FetchError::MissingTable.is_rate_limited());
    }

    #[test]
    fn page_without_table_is_an_error() {
        let blocked = ScrapedPage {
            page: 1,
            ..ScrapedPage::default()
        };
        assert_eq!(blocked.require_table(), Err(FetchError::MissingTable));

        let empty = ScrapedPage {
            page: 1,
            table_found: true,
            ..ScrapedPage::default()
        };
        assert!(empty.require_table().is_ok());
    }
}
