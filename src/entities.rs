use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted listing row. `(server, map_id, transaction_id, item_name, price)`
/// identifies the same observed offer across scrapes.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Listing {
    pub id: i64,
    pub server: String,
    pub map_id: String,
    pub transaction_id: String,
    pub item_name: String,
    pub item_name_normalized: String,
    pub item_id: Option<i32>,
    pub price: i64,
    pub quantity: i32,
    pub shop_name: String,
    pub seller_name: Option<String>,
    pub location: Option<String>,
    pub deal_type: String,
    pub scraped_at: DateTime<Utc>,
    pub source_page: i32,
}

/// A listing about to be upserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewListing {
    pub server: String,
    pub map_id: String,
    pub transaction_id: String,
    pub item_name: String,
    pub item_name_normalized: String,
    pub item_id: Option<i32>,
    pub price: i64,
    pub quantity: i32,
    pub shop_name: String,
    pub seller_name: Option<String>,
    pub location: Option<String>,
    pub deal_type: DealType,
    pub scraped_at: DateTime<Utc>,
    pub source_page: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NaturalKey {
    pub server: String,
    pub map_id: String,
    pub transaction_id: String,
    pub item_name: String,
    pub price: i64,
}

impl NewListing {
    #[must_use]
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            server: self.server.clone(),
            map_id: self.map_id.clone(),
            transaction_id: self.transaction_id.clone(),
            item_name: self.item_name.clone(),
            price: self.price,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DealType {
    #[default]
    Sell,
    Buy,
}

impl DealType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sell => "sell",
            Self::Buy => "buy",
        }
    }

    /// Upstream shops label buying shops with 구매.
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        if label.contains("구매") {
            Self::Buy
        } else {
            Self::Sell
        }
    }

    #[must_use]
    pub fn from_db(value: &str) -> Self {
        if value == "buy" {
            Self::Buy
        } else {
            Self::Sell
        }
    }
}

/// One cached upstream result page.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CacheEntry {
    pub cache_key: String,
    pub server: String,
    pub keyword: String,
    pub page: i32,
    pub size: i32,
    pub item_order: String,
    pub result_json: String,
    pub total_count: i32,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Outbound shape of one listing, also the serialized form inside a
/// [`CacheEntry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingView {
    pub item_name: String,
    pub item_name_normalized: String,
    pub item_id: Option<i32>,
    pub icon_url: Option<String>,
    pub image_url: Option<String>,
    pub price: i64,
    pub quantity: i32,
    pub shop_name: String,
    pub seller_name: Option<String>,
    pub location: Option<String>,
    pub deal_type: DealType,
    pub map_id: Option<String>,
    pub transaction_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub data: Vec<ListingView>,
    pub total: i64,
    pub page: u32,
    pub size: u32,
    pub total_pages: i64,
    pub scraped_at: Option<DateTime<Utc>>,
    pub stale: bool,
    pub refresh_triggered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Catalog entry used to resolve scraped names to item ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CatalogItem {
    pub item_id: i32,
    pub name: String,
}
