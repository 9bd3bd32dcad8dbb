use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::{
    cmp::Ordering,
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use super::StoreError;
use crate::{
    entities::{Listing, NaturalKey, NewListing},
    query::{Sort, SortDir, SortField},
    util::escape_like,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upserted {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    pub listings: Vec<Listing>,
    pub total: i64,
}

/// Deduplicated listing observations, keyed by [`NaturalKey`].
#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Inserts a new observation or refreshes price, quantity and
    /// `scraped_at` of the existing row with the same natural key. Other
    /// columns, including the resolved item id, keep their first values.
    async fn upsert(&self, listing: &NewListing) -> Result<Upserted, StoreError>;

    /// Listings on `server` whose raw name contains `keyword`
    /// (case-insensitive). An empty keyword matches everything.
    async fn search(
        &self,
        server: &str,
        keyword: &str,
        page: u32,
        size: u32,
        sort: Sort,
    ) -> Result<ListingPage, StoreError>;

    async fn latest_scraped_at(
        &self,
        server: &str,
        keyword: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

fn contains_pattern(keyword: &str) -> String {
    format!("%{}%", escape_like(keyword.trim()))
}

fn offset(page: u32, size: u32) -> i64 {
    i64::from(page.saturating_sub(1)) * i64::from(size)
}

#[derive(Debug, Clone)]
pub struct PgListingStore {
    pool: PgPool,
}

impl PgListingStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn upsert(&self, listing: &NewListing) -> Result<Upserted, StoreError> {
        let inserted: bool = sqlx::query_scalar(
            "INSERT INTO vending_listing (
                server, map_id, transaction_id, item_name, item_name_normalized, item_id,
                price, quantity, shop_name, seller_name, location, deal_type,
                scraped_at, source_page)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)
            ON CONFLICT (server, map_id, transaction_id, item_name, price) DO UPDATE SET
                price = EXCLUDED.price,
                quantity = EXCLUDED.quantity,
                scraped_at = EXCLUDED.scraped_at
            RETURNING (xmax = 0)",
        )
        .bind(&listing.server)
        .bind(&listing.map_id)
        .bind(&listing.transaction_id)
        .bind(&listing.item_name)
        .bind(&listing.item_name_normalized)
        .bind(listing.item_id)
        .bind(listing.price)
        .bind(listing.quantity)
        .bind(&listing.shop_name)
        .bind(&listing.seller_name)
        .bind(&listing.location)
        .bind(listing.deal_type.as_str())
        .bind(listing.scraped_at)
        .bind(listing.source_page)
        .fetch_one(&self.pool)
        .await?;

        Ok(if inserted {
            Upserted::Inserted
        } else {
            Upserted::Updated
        })
    }

    async fn search(
        &self,
        server: &str,
        keyword: &str,
        page: u32,
        size: u32,
        sort: Sort,
    ) -> Result<ListingPage, StoreError> {
        let pattern = contains_pattern(keyword);

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM vending_listing WHERE server = $1 AND item_name ILIKE $2",
        )
        .bind(server)
        .bind(&pattern)
        .fetch_one(&self.pool)
        .await?;

        // column and direction come from closed enums, never from input
        let listings = sqlx::query_as::<_, Listing>(&format!(
            "SELECT * FROM vending_listing
            WHERE server = $1 AND item_name ILIKE $2
            ORDER BY {} {}, id ASC
            LIMIT $3 OFFSET $4",
            sort.field.column(),
            sort.dir.sql()
        ))
        .bind(server)
        .bind(&pattern)
        .bind(i64::from(size))
        .bind(offset(page, size))
        .fetch_all(&self.pool)
        .await?;

        Ok(ListingPage { listings, total })
    }

    async fn latest_scraped_at(
        &self,
        server: &str,
        keyword: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let latest: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MAX(scraped_at) FROM vending_listing WHERE server = $1 AND item_name ILIKE $2",
        )
        .bind(server)
        .bind(contains_pattern(keyword))
        .fetch_one(&self.pool)
        .await?;
        Ok(latest)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let deleted = sqlx::query("DELETE FROM vending_listing WHERE scraped_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }
}

#[derive(Debug, Default)]
struct MemoryRows {
    rows: HashMap<NaturalKey, Listing>,
    next_id: i64,
}

#[derive(Debug, Default)]
pub struct MemoryListingStore {
    inner: Mutex<MemoryRows>,
}

impl MemoryListingStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .rows
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn matching(&self, server: &str, keyword: &str) -> Vec<Listing> {
        let keyword = keyword.trim().to_lowercase();
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .rows
            .values()
            .filter(|l| l.server == server && l.item_name.to_lowercase().contains(&keyword))
            .cloned()
            .collect()
    }
}

fn compare(a: &Listing, b: &Listing, sort: Sort) -> Ordering {
    let ordering = match sort.field {
        SortField::Price => a.price.cmp(&b.price),
        SortField::Quantity => a.quantity.cmp(&b.quantity),
        SortField::Name => a.item_name.cmp(&b.item_name),
        SortField::ScrapedAt => a.scraped_at.cmp(&b.scraped_at),
    };
    let ordering = match sort.dir {
        SortDir::Asc => ordering,
        SortDir::Desc => ordering.reverse(),
    };
    ordering.then(a.id.cmp(&b.id))
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn upsert(&self, listing: &NewListing) -> Result<Upserted, StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let key = listing.natural_key();

        if let Some(existing) = inner.rows.get_mut(&key) {
            existing.price = listing.price;
            existing.quantity = listing.quantity;
            existing.scraped_at = listing.scraped_at;
            return Ok(Upserted::Updated);
        }

        inner.next_id += 1;
        let id = inner.next_id;
        inner.rows.insert(
            key,
            Listing {
                id,
                server: listing.server.clone(),
                map_id: listing.map_id.clone(),
                transaction_id: listing.transaction_id.clone(),
                item_name: listing.item_name.clone(),
                item_name_normalized: listing.item_name_normalized.clone(),
                item_id: listing.item_id,
                price: listing.price,
                quantity: listing.quantity,
                shop_name: listing.shop_name.clone(),
                seller_name: listing.seller_name.clone(),
                location: listing.location.clone(),
                deal_type: listing.deal_type.as_str().to_string(),
                scraped_at: listing.scraped_at,
                source_page: listing.source_page,
            },
        );
        Ok(Upserted::Inserted)
    }

    async fn search(
        &self,
        server: &str,
        keyword: &str,
        page: u32,
        size: u32,
        sort: Sort,
    ) -> Result<ListingPage, StoreError> {
        let mut listings = self.matching(server, keyword);
        listings.sort_by(|a, b| compare(a, b, sort));

        let total = i64::try_from(listings.len()).unwrap_or(i64::MAX);
        let skip = usize::try_from(offset(page, size)).unwrap_or(usize::MAX);
        let listings = listings
            .into_iter()
            .skip(skip)
            .take(size as usize)
            .collect();

        Ok(ListingPage { listings, total })
    }

    async fn latest_scraped_at(
        &self,
        server: &str,
        keyword: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .matching(server, keyword)
            .into_iter()
            .map(|l| l.scraped_at)
            .max())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let before = inner.rows.len();
        inner.rows.retain(|_, listing| listing.scraped_at >= cutoff);
        Ok(u64::try_from(before - inner.rows.len()).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::DealType;
    use chrono::Duration;

    fn listing(name: &str, price: i64, quantity: i32, scraped_at: DateTime<Utc>) -> NewListing {
        NewListing {
            server: "baphomet".to_string(),
            map_id: "prontera".to_string(),
            transaction_id: format!("tx-{name}"),
            item_name: name.to_string(),
            item_name_normalized: name.to_string(),
            item_id: Some(501),
            price,
            quantity,
            shop_name: "Shop".to_string(),
            seller_name: None,
            location: None,
            deal_type: DealType::Sell,
            scraped_at,
            source_page: 1,
        }
    }

    #[tokio::test]
    async fn upsert_twice_keeps_one_row_with_latest_values() {
        let store = MemoryListingStore::new();
        let first = Utc::now() - Duration::minutes(5);
        let second = Utc::now();

        let mut row = listing("Red Potion", 50, 10, first);
        assert_eq!(store.upsert(&row).await.unwrap(), Upserted::Inserted);

        row.quantity = 3;
        row.scraped_at = second;
        row.item_id = Some(999);
        assert_eq!(store.upsert(&row).await.unwrap(), Upserted::Updated);
        assert_eq!(store.len(), 1);

        let page = store
            .search("baphomet", "red", 1, 10, Sort::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.listings[0].quantity, 3);
        assert_eq!(page.listings[0].scraped_at, second);
        // first resolution sticks
        assert_eq!(page.listings[0].item_id, Some(501));
    }

    #[tokio::test]
    async fn price_change_is_a_new_offer() {
        let store = MemoryListingStore::new();
        let now = Utc::now();
        store.upsert(&listing("Apple", 10, 1, now)).await.unwrap();
        store.upsert(&listing("Apple", 12, 1, now)).await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn search_sorts_and_pages() {
        let store = MemoryListingStore::new();
        let now = Utc::now();
        for (i, price) in [300, 100, 200].into_iter().enumerate() {
            store
                .upsert(&listing(&format!("Potion {i}"), price, 1, now))
                .await
                .unwrap();
        }

        let first = store
            .search("baphomet", "potion", 1, 2, Sort::default())
            .await
            .unwrap();
        assert_eq!(first.total, 3);
        assert_eq!(
            first.listings.iter().map(|l| l.price).collect::<Vec<_>>(),
            vec![100, 200]
        );

        let desc = Sort {
            field: SortField::Price,
            dir: SortDir::Desc,
        };
        let second = store.search("baphomet", "", 2, 2, desc).await.unwrap();
        assert_eq!(
            second.listings.iter().map(|l| l.price).collect::<Vec<_>>(),
            vec![100]
        );

        assert!(store
            .search("ifrit", "potion", 1, 10, Sort::default())
            .await
            .unwrap()
            .listings
            .is_empty());
    }

    #[tokio::test]
    async fn latest_and_sweep() {
        let store = MemoryListingStore::new();
        let now = Utc::now();
        store
            .upsert(&listing("Old Hat", 1, 1, now - Duration::days(8)))
            .await
            .unwrap();
        store.upsert(&listing("New Hat", 1, 1, now)).await.unwrap();

        assert_eq!(
            store.latest_scraped_at("baphomet", "hat").await.unwrap(),
            Some(now)
        );
        assert_eq!(
            store.latest_scraped_at("baphomet", "sword").await.unwrap(),
            None
        );
        assert_eq!(
            store
                .delete_older_than(now - Duration::days(7))
                .await
                .unwrap(),
            1
        );
    }
}
