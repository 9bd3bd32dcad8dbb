use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use metrics::increment_counter;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{
    entities::SearchResult,
    error::AppError,
    query::{SearchQuery, Sort, SortDir, SortField},
    servers::Server,
    upstream::ListingDetail,
    AppState,
};

const fn default_page() -> u32 {
    1
}

const fn default_size() -> u32 {
    10
}

#[derive(Debug, Deserialize, Validate)]
pub struct SearchParams {
    pub server: String,
    #[serde(default, alias = "keyword")]
    #[validate(length(max = 128))]
    pub item: String,
    #[serde(default = "default_page")]
    #[validate(range(min = 1))]
    pub page: u32,
    #[serde(default = "default_size")]
    #[validate(range(min = 1, max = 100))]
    pub size: u32,
    #[serde(default)]
    pub sort: SortField,
    #[serde(default)]
    pub dir: SortDir,
}

impl SearchParams {
    pub fn into_query(self) -> Result<SearchQuery, AppError> {
        self.validate()
            .map_err(|err| AppError::BadRequest(err.to_string()))?;

        Ok(SearchQuery {
            server: parse_server(&self.server)?,
            keyword: self.item.trim().to_string(),
            page: self.page,
            size: self.size,
            sort: Sort {
                field: self.sort,
                dir: self.dir,
            },
        })
    }
}

pub fn parse_server(server: &str) -> Result<Server, AppError> {
    server
        .parse()
        .map_err(|err: crate::servers::UnknownServer| AppError::BadRequest(err.to_string()))
}

pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResult>, AppError> {
    let query = params.into_query()?;

    let result = state
        .search
        .search(&query)
        .await
        .map_err(|err| AppError::from_search(err, &query))?;

    Ok(Json(result))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DetailParams {
    pub server: String,
    #[validate(length(min = 1, max = 64))]
    pub ssi: String,
    #[validate(length(min = 1, max = 64))]
    pub map_id: String,
}

pub async fn detail(
    State(state): State<AppState>,
    Query(params): Query<DetailParams>,
) -> Result<Json<ListingDetail>, AppError> {
    params
        .validate()
        .map_err(|err| AppError::BadRequest(err.to_string()))?;
    let server = parse_server(&params.server)?;
    increment_counter!("vending_detail_request");

    let detail = state
        .source
        .fetch_detail(server, &params.map_id, &params.ssi)
        .await
        .map_err(|err| {
            let policy = state.search.policy();
            AppError::Unavailable {
                reason: err.reason(),
                retry_after: if err.is_rate_limited() {
                    policy.rate_limited_retry
                } else {
                    policy.failure_retry
                },
                server: server.code().to_string(),
                keyword: params.ssi.clone(),
            }
        })?;

    Ok(Json(detail))
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub strategy: &'static str,
    pub front_cache_entries: u64,
    pub resolver_entries: usize,
    pub resolver_built_at: Option<DateTime<Utc>>,
    pub in_flight_fetches: usize,
    pub active_collections: usize,
}

pub async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    let index = state.resolver.snapshot();

    Json(CacheStats {
        strategy: state.search.policy().strategy.as_str(),
        front_cache_entries: state.search.cache().entry_count(),
        resolver_entries: index.len(),
        resolver_built_at: index.built_at(),
        in_flight_fetches: state.search.in_flight(),
        active_collections: state.governor.active(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(server: &str, item: &str, page: u32, size: u32) -> SearchParams {
        SearchParams {
            server: server.to_string(),
            item: item.to_string(),
            page,
            size,
            sort: SortField::Price,
            dir: SortDir::Asc,
        }
    }

    #[test]
    fn valid_params_become_a_query() {
        let query = params("Baphomet", "  Red Potion ", 2, 20).into_query().unwrap();
        assert_eq!(query.server, Server::Baphomet);
        assert_eq!(query.keyword, "Red Potion");
        assert_eq!(query.cache_key(), "baphomet|Red Potion|2|20|price");
    }

    #[test]
    fn invalid_params_are_rejected_before_fetching() {
        assert!(matches!(
            params("loki", "x", 1, 10).into_query(),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            params("ifrit", "x", 0, 10).into_query(),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            params("ifrit", "x", 1, 500).into_query(),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            params("ifrit", &"x".repeat(200), 1, 10).into_query(),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn query_string_defaults() {
        let params: SearchParams =
            serde_json::from_str(r#"{"server":"ifrit","keyword":"Apple","dir":"desc"}"#).unwrap();
        assert_eq!(params.page, 1);
        assert_eq!(params.size, 10);
        assert_eq!(params.item, "Apple");
        assert_eq!(params.dir, SortDir::Desc);
    }
}
