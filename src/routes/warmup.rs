use axum::{extract::State, Json, TypedHeader};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use super::{require_api_key, vending::SearchParams, ApiKey};
use crate::{
    error::AppError,
    query::{SortDir, SortField},
    search::SearchError,
    AppState,
};

const BETWEEN_TARGETS: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
pub struct WarmupTarget {
    pub server: String,
    #[serde(default)]
    pub keyword: String,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub size: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct WarmupRequest {
    #[serde(default)]
    pub targets: Vec<WarmupTarget>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetStatus {
    Ok,
    RateLimited,
    Error,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetResult {
    pub server: String,
    pub keyword: String,
    pub status: TargetStatus,
    pub item_count: usize,
    pub stale: bool,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmupResponse {
    pub total_targets: usize,
    pub success_count: usize,
    pub fail_count: usize,
    pub results: Vec<TargetResult>,
}

/// Runs the search for each target in turn so their snapshots get cached.
pub async fn warmup(
    State(state): State<AppState>,
    key: Option<TypedHeader<ApiKey>>,
    Json(request): Json<WarmupRequest>,
) -> Result<Json<WarmupResponse>, AppError> {
    require_api_key(
        state.config.warmup_api_key.as_deref(),
        key.as_ref().map(|TypedHeader(key)| key),
        "warmup",
    )?;
    if request.targets.is_empty() {
        return Err(AppError::BadRequest("no targets provided".to_string()));
    }

    let total_targets = request.targets.len();
    let mut results = Vec::with_capacity(total_targets);

    for (i, target) in request.targets.into_iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(BETWEEN_TARGETS).await;
        }
        results.push(warm_one(&state, target).await);
    }

    let success_count = results
        .iter()
        .filter(|r| r.status == TargetStatus::Ok)
        .count();
    info!(
        total_targets,
        success_count, "cache warmup finished"
    );

    Ok(Json(WarmupResponse {
        total_targets,
        success_count,
        fail_count: total_targets - success_count,
        results,
    }))
}

async fn warm_one(state: &AppState, target: WarmupTarget) -> TargetResult {
    let mut result = TargetResult {
        server: target.server.clone(),
        keyword: target.keyword.clone(),
        status: TargetStatus::Error,
        item_count: 0,
        stale: false,
        cached: false,
        reason: None,
    };

    let params = SearchParams {
        server: target.server,
        item: target.keyword,
        page: target.page.unwrap_or(1),
        size: target.size.unwrap_or(10),
        sort: SortField::Price,
        dir: SortDir::Asc,
    };
    let query = match params.into_query() {
        Ok(query) => query,
        Err(err) => {
            result.reason = Some(err.to_string());
            return result;
        }
    };

    match state.search.search(&query).await {
        Ok(found) => {
            result.status = TargetStatus::Ok;
            result.item_count = found.data.len();
            result.stale = found.stale;
            result.cached = !found.refresh_triggered;
        }
        Err(SearchError::Unavailable { reason, .. }) => {
            result.status = TargetStatus::RateLimited;
            result.reason = Some(reason.to_string());
        }
        Err(err) => {
            warn!(server = %query.server, keyword = query.keyword, error = %err, "warmup target failed");
            result.reason = Some(err.to_string());
        }
    }
    result
}
