//! Runtime configuration, read from the environment (and `.env` via
//! `dotenvy`, loaded by the binary before [`Config::from_env`] runs).

use color_eyre::eyre::{eyre, WrapErr};
use std::{fmt::Display, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use crate::{
    collector::CollectPolicy,
    governor::{BackoffPolicy, GovernorPolicy},
    search::{SearchPolicy, SearchStrategy},
    servers::Server,
};

const DEFAULT_LIST_URL: &str = "https://ro.gnjoy.com/itemdeal/itemDealList.asp";
const DEFAULT_DETAIL_URL: &str = "https://ro.gnjoy.com/itemdeal/itemDealView.asp";
const DEFAULT_REFERER: &str = "https://ro.gnjoy.com/";
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                                  (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const DEFAULT_ACCEPT_LANGUAGE: &str = "ko-KR,ko;q=0.9,en-US;q=0.8,en;q=0.7";
const DEFAULT_ICON_URL: &str = "https://static.divine-pride.net/images/items/item/{id}.png";

/// Listings not re-observed for this long are swept.
pub const LISTING_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub list_url: String,
    pub detail_url: String,
    /// Scheme and host used to absolutize relative image paths.
    pub origin: String,
    pub referer: String,
    pub user_agent: String,
    pub accept_language: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Uploads are disabled when unset.
    pub api_key: Option<String>,
    pub allowed_servers: Vec<Server>,
    pub max_items: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub bind_addr: SocketAddr,
    pub upstream: UpstreamConfig,
    pub search: SearchPolicy,
    pub front_cache_capacity: u64,
    pub front_cache_ttl: Duration,
    pub snapshot_retention: Duration,
    pub resolver_refresh: Duration,
    pub sweep_interval: Duration,
    pub governor: GovernorPolicy,
    pub collect: CollectPolicy,
    pub upload: UploadConfig,
    pub warmup_api_key: Option<String>,
    pub catalog_path: PathBuf,
    pub icon_url_template: String,
}

impl Config {
    pub fn from_env() -> color_eyre::Result<Self> {
        let list_url = string_or("UPSTREAM_URL", DEFAULT_LIST_URL);
        let origin = origin_of(&list_url)?;

        let upstream = UpstreamConfig {
            detail_url: string_or("UPSTREAM_DETAIL_URL", DEFAULT_DETAIL_URL),
            referer: string_or("UPSTREAM_REFERER", DEFAULT_REFERER),
            user_agent: string_or("UPSTREAM_USER_AGENT", DEFAULT_USER_AGENT),
            accept_language: string_or("UPSTREAM_ACCEPT_LANGUAGE", DEFAULT_ACCEPT_LANGUAGE),
            timeout: secs_or("UPSTREAM_TIMEOUT_SECS", 15)?,
            list_url,
            origin,
        };

        let search = SearchPolicy {
            strategy: parse_or("SEARCH_STRATEGY", SearchStrategy::Snapshot)?,
            cache_ttl: secs_or("CACHE_TTL_SECS", 600)?,
            stale_after: secs_or("STALE_AFTER_SECS", 300)?,
            rate_limited_retry: secs_or("RATE_LIMITED_RETRY_SECS", 600)?,
            failure_retry: secs_or("FAILURE_RETRY_SECS", 60)?,
        };

        let governor = GovernorPolicy {
            max_concurrency: parse_or("COLLECT_MAX_CONCURRENCY", 2)?,
            cooldown: secs_or("COLLECT_COOLDOWN_SECS", 60)?,
            backoff: BackoffPolicy {
                min: secs_or("BACKOFF_MIN_SECS", 15 * 60)?,
                max: secs_or("BACKOFF_MAX_SECS", 60 * 60)?,
            },
        };
        if governor.backoff.min > governor.backoff.max {
            return Err(eyre!("BACKOFF_MIN_SECS must not exceed BACKOFF_MAX_SECS"));
        }

        let collect = CollectPolicy {
            max_pages: parse_or("COLLECT_MAX_PAGES", 5)?,
            page_delay_min: millis_or("PAGE_DELAY_MIN_MS", 3000)?,
            page_delay_max: millis_or("PAGE_DELAY_MAX_MS", 6000)?,
        };

        let upload = UploadConfig {
            api_key: non_empty("UPLOAD_API_KEY"),
            allowed_servers: servers_or("UPLOAD_ALLOWED_SERVERS", &Server::ALL)?,
            max_items: parse_or("UPLOAD_MAX_ITEMS", 2000)?,
        };

        Ok(Self {
            database_url: non_empty("DATABASE_URL"),
            database_max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 30)?,
            bind_addr: parse_or("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 3000)))?,
            upstream,
            search,
            front_cache_capacity: parse_or("FRONT_CACHE_CAPACITY", 10_000)?,
            front_cache_ttl: secs_or("FRONT_CACHE_TTL_SECS", 60)?,
            snapshot_retention: secs_or("SNAPSHOT_RETENTION_SECS", 86_400)?,
            resolver_refresh: secs_or("RESOLVER_REFRESH_SECS", 600)?,
            sweep_interval: secs_or("SWEEP_INTERVAL_SECS", 900)?,
            governor,
            collect,
            upload,
            warmup_api_key: non_empty("WARMUP_API_KEY"),
            catalog_path: PathBuf::from(string_or("CATALOG_PATH", "assets/items.bin.zstd")),
            icon_url_template: string_or("ICON_URL_TEMPLATE", DEFAULT_ICON_URL),
        })
    }
}

fn non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn string_or(name: &str, default: &str) -> String {
    non_empty(name).unwrap_or_else(|| default.to_string())
}

fn parse_or<T>(name: &str, default: T) -> color_eyre::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match non_empty(name) {
        Some(value) => value
            .parse()
            .map_err(|err| eyre!("{name}={value:?} is invalid: {err}")),
        None => Ok(default),
    }
}

fn secs_or(name: &str, default: u64) -> color_eyre::Result<Duration> {
    parse_or(name, default).map(Duration::from_secs)
}

fn millis_or(name: &str, default: u64) -> color_eyre::Result<Duration> {
    parse_or(name, default).map(Duration::from_millis)
}

fn servers_or(name: &str, default: &[Server]) -> color_eyre::Result<Vec<Server>> {
    match non_empty(name) {
        Some(value) => value
            .split(',')
            .filter(|alias| !alias.trim().is_empty())
            .map(|alias| alias.parse::<Server>().wrap_err_with(|| format!("{name} lists an unknown server")))
            .collect(),
        None => Ok(default.to_vec()),
    }
}

fn origin_of(url: &str) -> color_eyre::Result<String> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| eyre!("UPSTREAM_URL must be absolute, got {url:?}"))?;
    let host = rest.split('/').next().unwrap_or_default();
    Ok(format!("{scheme}://{host}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_strips_path() {
        assert_eq!(
            origin_of(DEFAULT_LIST_URL).unwrap(),
            "https://ro.gnjoy.com"
        );
        assert!(origin_of("ro.gnjoy.com/itemdeal").is_err());
    }

    #[test]
    fn unset_variables_fall_back() {
        assert_eq!(
            parse_or("VENDING_TEST_SURELY_UNSET", 42_u32).unwrap(),
            42
        );
        assert_eq!(
            secs_or("VENDING_TEST_SURELY_UNSET", 5).unwrap(),
            Duration::from_secs(5)
        );
        assert_eq!(
            servers_or("VENDING_TEST_SURELY_UNSET", &Server::ALL).unwrap(),
            Server::ALL.to_vec()
        );
    }

    #[test]
    fn invalid_values_are_reported() {
        std::env::set_var("VENDING_TEST_BAD_NUMBER", "ten");
        let err = parse_or("VENDING_TEST_BAD_NUMBER", 1_u32).unwrap_err();
        assert!(err.to_string().contains("VENDING_TEST_BAD_NUMBER"));

        std::env::set_var("VENDING_TEST_SERVERS", "baphomet, 이프리트");
        assert_eq!(
            servers_or("VENDING_TEST_SERVERS", &[]).unwrap(),
            vec![Server::Baphomet, Server::Ifrit]
        );
    }
}
