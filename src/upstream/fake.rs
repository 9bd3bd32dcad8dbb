//! Scripted [`PageSource`] for tests.

use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use super::{DraftListing, FetchError, ListingDetail, PageRequest, PageSource, ScrapedPage};
use crate::{entities::DealType, servers::Server};

#[derive(Debug, Default)]
pub struct FakeSource {
    pages: Mutex<HashMap<u32, Result<ScrapedPage, FetchError>>>,
    failure: Mutex<Option<FetchError>>,
    calls: AtomicUsize,
    latency: Duration,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn set_page(&self, page: u32, listings: Vec<DraftListing>) {
        let total = i64::try_from(listings.len()).unwrap();
        self.pages.lock().unwrap().insert(
            page,
            Ok(ScrapedPage {
                page,
                listings,
                total,
                skipped_rows: 0,
                table_found: true,
            }),
        );
    }

    /// Serves `scraped` as is, table or not.
    pub fn set_scraped(&self, scraped: ScrapedPage) {
        self.pages.lock().unwrap().insert(scraped.page, Ok(scraped));
    }

    pub fn fail_page(&self, page: u32, error: FetchError) {
        self.pages.lock().unwrap().insert(page, Err(error));
    }

    /// Every request fails with `error` until cleared.
    pub fn fail_all(&self, error: Option<FetchError>) {
        *self.failure.lock().unwrap() = error;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageSource for FakeSource {
    async fn fetch_page(&self, request: &PageRequest) -> Result<ScrapedPage, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(error);
        }
        self.pages
            .lock()
            .unwrap()
            .get(&request.page)
            .cloned()
            .unwrap_or_else(|| {
                Ok(ScrapedPage {
                    page: request.page,
                    table_found: true,
                    ..ScrapedPage::default()
                })
            })
    }

    async fn fetch_detail(
        &self,
        _server: Server,
        map_id: &str,
        transaction_id: &str,
    ) -> Result<ListingDetail, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ListingDetail {
            shop_title: Some("Cheap Stuff".to_string()),
            seller_name: Some("Seller".to_string()),
            map_id: map_id.to_string(),
            transaction_id: transaction_id.to_string(),
            slots: Vec::new(),
        })
    }
}

pub fn draft(name: &str, price: i64, transaction_id: &str) -> DraftListing {
    DraftListing {
        item_name: name.to_string(),
        image_url: None,
        image_item_id: None,
        price,
        quantity: 1,
        shop_name: "Cheap Stuff".to_string(),
        seller_name: None,
        location: Some("바포메트".to_string()),
        deal_type: DealType::Sell,
        map_id: Some("prontera_12".to_string()),
        transaction_id: Some(transaction_id.to_string()),
    }
}
