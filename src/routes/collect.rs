use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

use super::vending::parse_server;
use crate::{
    collector::{CollectError, CollectReport, CollectRequest},
    error::AppError,
    governor::Refusal,
    AppState,
};

const fn one() -> u32 {
    1
}

const fn default_max_pages() -> u32 {
    3
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CollectParams {
    pub server: String,
    #[serde(default)]
    #[validate(length(max = 128))]
    pub keyword: String,
    #[serde(default = "one")]
    #[validate(range(min = 1))]
    pub start_page: u32,
    #[serde(default = "default_max_pages")]
    #[validate(range(min = 1))]
    pub max_pages: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectResponse {
    pub status: &'static str,
    pub server: String,
    pub keyword: String,
    pub saved_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<CollectReport>,
}

/// Runs a collection synchronously. Refusals from the governor are reported
/// in the body, not as errors.
pub async fn collect(
    State(state): State<AppState>,
    Query(params): Query<CollectParams>,
) -> Result<Json<CollectResponse>, AppError> {
    params
        .validate()
        .map_err(|err| AppError::BadRequest(err.to_string()))?;
    let server = parse_server(&params.server)?;

    let request = CollectRequest {
        server,
        keyword: params.keyword.trim().to_string(),
        start_page: params.start_page,
        max_pages: params.max_pages,
    };
    info!(
        server = %request.server,
        keyword = request.keyword,
        start_page = request.start_page,
        max_pages = request.max_pages,
        "collection requested"
    );

    let mut response = CollectResponse {
        status: "ok",
        server: server.code().to_string(),
        keyword: request.keyword.clone(),
        saved_count: 0,
        retry_after_seconds: None,
        report: None,
    };

    match state.collector.collect(&request).await {
        Ok(report) => {
            if report.rate_limited {
                response.status = "rate_limited";
            }
            response.saved_count = report.saved_count();
            response.report = Some(report);
        }
        Err(CollectError::Refused(refusal)) => {
            response.status = refusal_status(&refusal);
            response.retry_after_seconds = refusal.remaining().map(|d| d.as_secs().max(1));
        }
        Err(CollectError::Store(err)) => return Err(err.into()),
    }

    Ok(Json(response))
}

const fn refusal_status(refusal: &Refusal) -> &'static str {
    match refusal {
        Refusal::Busy => "busy",
        Refusal::Cooldown { .. } => "cooldown",
        Refusal::BackingOff { .. } => "backing_off",
    }
}
