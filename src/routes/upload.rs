use axum::{
    extract::{Query, State},
    Json, TypedHeader,
};
use metrics::{histogram, increment_counter};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::info;

use super::{require_api_key, vending::parse_server, ApiKey};
use crate::{
    collector::IngestCounts,
    entities::DealType,
    error::AppError,
    servers::Server,
    upstream::{
        parser::{absolute_url, image_stem_id},
        DraftListing,
    },
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub server: String,
}

/// One row as scraped by an external collector.
#[derive(Debug, Deserialize)]
pub struct UploadItem {
    pub item_name: String,
    #[serde(default)]
    pub vendor_name: String,
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub coordinates: Option<String>,
    #[serde(default)]
    pub quantity: Option<i32>,
    #[serde(default)]
    pub price: i64,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub ssi: Option<String>,
    #[serde(default)]
    pub map_id: Option<String>,
}

impl UploadItem {
    fn into_draft(self, origin: &str) -> DraftListing {
        let image_item_id = self.image_url.as_deref().and_then(image_stem_id);
        DraftListing {
            item_name: self.item_name.trim().to_string(),
            image_url: self
                .image_url
                .as_deref()
                .and_then(|src| absolute_url(src, origin)),
            image_item_id,
            price: self.price.max(0),
            quantity: self.quantity.filter(|q| *q > 0).unwrap_or(1),
            shop_name: self.vendor_name.trim().to_string(),
            seller_name: None,
            location: self.coordinates.or(self.server_name),
            deal_type: self
                .category
                .as_deref()
                .map_or(DealType::Sell, DealType::from_label),
            map_id: self.map_id.filter(|id| !id.is_empty()),
            transaction_id: self.ssi.filter(|id| !id.is_empty()),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub status: &'static str,
    pub server: Server,
    pub received_count: usize,
    pub saved_count: usize,
    #[serde(flatten)]
    pub counts: IngestCounts,
}

/// Accepts pre-scraped rows from a trusted collector and upserts them like a
/// crawl would.
pub async fn upload(
    State(state): State<AppState>,
    key: Option<TypedHeader<ApiKey>>,
    Query(params): Query<UploadParams>,
    Json(items): Json<Vec<UploadItem>>,
) -> Result<Json<UploadResponse>, AppError> {
    let config = &state.config.upload;
    require_api_key(
        config.api_key.as_deref(),
        key.as_ref().map(|TypedHeader(key)| key),
        "upload",
    )?;

    let server = parse_server(&params.server)?;
    if !config.allowed_servers.contains(&server) {
        return Err(AppError::BadRequest(format!(
            "uploads for {server} are not allowed"
        )));
    }
    if items.is_empty() {
        return Err(AppError::BadRequest("no items provided".to_string()));
    }
    if items.len() > config.max_items {
        return Err(AppError::PayloadTooLarge(format!(
            "too many items, max {}",
            config.max_items
        )));
    }

    let start = Instant::now();
    let received_count = items.len();
    let origin = &state.config.upstream.origin;
    let drafts: Vec<DraftListing> = items
        .into_iter()
        .map(|item| item.into_draft(origin))
        .collect();

    let counts = state.collector.ingest(server, &drafts, 0).await?;

    increment_counter!("vending_upload", "server" => server.code());
    histogram!("vending_upload_time", start.elapsed(), "server" => server.code());
    info!(
        %server,
        received = received_count,
        saved = counts.saved(),
        skipped = counts.skipped,
        "received upload"
    );

    Ok(Json(UploadResponse {
        status: "completed",
        server,
        received_count,
        saved_count: counts.saved(),
        counts,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_rows_become_drafts() {
        let item: UploadItem = serde_json::from_str(
            r#"{
                "item_name": " +7 Valkyrie Armor [1] ",
                "vendor_name": "Cheap Stuff",
                "server_name": "바포메트",
                "quantity": 0,
                "price": 12500000,
                "category": "구매",
                "image_url": "//img.gnjoy.com/item/2357.png",
                "ssi": "998877",
                "map_id": ""
            }"#,
        )
        .unwrap();

        let draft = item.into_draft("https://ro.gnjoy.com");
        assert_eq!(draft.item_name, "+7 Valkyrie Armor [1]");
        assert_eq!(draft.quantity, 1);
        assert_eq!(draft.deal_type, DealType::Buy);
        assert_eq!(draft.image_item_id, Some(2357));
        assert_eq!(
            draft.image_url.as_deref(),
            Some("https://img.gnjoy.com/item/2357.png")
        );
        assert_eq!(draft.location.as_deref(), Some("바포메트"));
        // empty map id makes the row unpersistable
        assert_eq!(draft.ids(), None);
    }
}
