use axum::{
    headers::{self, Header},
    http::{HeaderName, HeaderValue},
    routing::{get, post},
    Router,
};

use crate::{error::AppError, AppState};

pub mod collect;
pub mod upload;
pub mod vending;
pub mod warmup;

pub fn api() -> Router<AppState> {
    Router::new()
        .route("/api/vending/search", get(vending::search))
        .route("/api/vending/detail", get(vending::detail))
        .route("/api/vending/cache-stats", get(vending::cache_stats))
        .route("/api/vending/collect", post(collect::collect))
        .route("/api/vending/upload", post(upload::upload))
        .route("/api/vending/warmup", post(warmup::warmup))
}

static X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");

/// The `X-API-KEY` shared secret sent by trusted clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKey(pub String);

impl Header for ApiKey {
    fn name() -> &'static HeaderName {
        &X_API_KEY
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        let key = value.to_str().map_err(|_| headers::Error::invalid())?;
        Ok(Self(key.trim().to_string()))
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        if let Ok(value) = HeaderValue::from_str(&self.0) {
            values.extend(std::iter::once(value));
        }
    }
}

/// Rejects with 503 when no key is configured and 401 when the caller's key
/// is missing or wrong.
pub fn require_api_key(
    configured: Option<&str>,
    provided: Option<&ApiKey>,
    feature: &'static str,
) -> Result<(), AppError> {
    let Some(expected) = configured else {
        return Err(AppError::Disabled(feature));
    };
    match provided {
        Some(ApiKey(key)) if key == expected => Ok(()),
        _ => Err(AppError::Unauthorized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_checks() {
        let key = ApiKey("secret".to_string());
        assert!(require_api_key(Some("secret"), Some(&key), "upload").is_ok());
        assert!(matches!(
            require_api_key(None, Some(&key), "upload"),
            Err(AppError::Disabled("upload"))
        ));
        assert!(matches!(
            require_api_key(Some("other"), Some(&key), "upload"),
            Err(AppError::Unauthorized)
        ));
        assert!(matches!(
            require_api_key(Some("secret"), None, "upload"),
            Err(AppError::Unauthorized)
        ));
    }

    #[test]
    fn decodes_trimmed_header() {
        let value = HeaderValue::from_static(" secret ");
        let mut values = std::iter::once(&value);
        assert_eq!(
            ApiKey::decode(&mut values).unwrap(),
            ApiKey("secret".to_string())
        );
    }
}
