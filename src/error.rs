use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::error;

use crate::{query::SearchQuery, search::SearchError, store::StoreError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("missing or invalid api key")]
    Unauthorized,
    #[error("{0} is not configured")]
    Disabled(&'static str),
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("no data available for {server}/{keyword} ({reason})")]
    Unavailable {
        reason: &'static str,
        retry_after: Duration,
        server: String,
        keyword: String,
    },
    #[error(transparent)]
    Internal(#[from] color_eyre::eyre::Error),
}

impl AppError {
    /// Attaches the query to a search failure for the response body.
    #[must_use]
    pub fn from_search(err: SearchError, query: &SearchQuery) -> Self {
        match err {
            SearchError::Unavailable {
                reason,
                retry_after,
            } => Self::Unavailable {
                reason,
                retry_after,
                server: query.server.code().to_string(),
                keyword: query.keyword.clone(),
            },
            SearchError::Store(err) => err.into(),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        Self::Internal(err.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            Self::Unavailable {
                reason,
                retry_after,
                server,
                keyword,
            } => {
                let secs = retry_after.as_secs().max(1);
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(header::RETRY_AFTER, secs.to_string())],
                    Json(json!({
                        "error": "unavailable",
                        "reason": reason,
                        "server": server,
                        "keyword": keyword,
                        "retryAfterSeconds": secs,
                    })),
                )
                    .into_response()
            }
            Self::Internal(err) => {
                error!(error = ?err, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "Something went wrong" })),
                )
                    .into_response()
            }
            other => {
                let status = match other {
                    Self::BadRequest(_) => StatusCode::BAD_REQUEST,
                    Self::Unauthorized => StatusCode::UNAUTHORIZED,
                    Self::Disabled(_) => StatusCode::SERVICE_UNAVAILABLE,
                    Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
                    Self::Unavailable { .. } | Self::Internal(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, Json(json!({ "error": other.to_string() }))).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{query::Sort, servers::Server};

    #[test]
    fn unavailable_carries_retry_after() {
        let query = SearchQuery {
            server: Server::Baphomet,
            keyword: "Red Potion".to_string(),
            page: 1,
            size: 10,
            sort: Sort::default(),
        };
        let err = AppError::from_search(
            SearchError::Unavailable {
                reason: "rate_limited",
                retry_after: Duration::from_secs(600),
            },
            &query,
        );

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "600");
    }

    #[test]
    fn client_errors_map_to_status() {
        assert_eq!(
            AppError::Unauthorized.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::Disabled("upload").into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::PayloadTooLarge("too many".to_string())
                .into_response()
                .status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            AppError::BadRequest("bad".to_string()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }
}
