use async_trait::async_trait;
use metrics::{histogram, increment_counter};
use reqwest::{header, StatusCode};
use std::time::Instant;
use tracing::{debug, warn};

use super::{parser, FetchError, ListingDetail, PageRequest, PageSource, ScrapedPage};
use crate::{config::UpstreamConfig, servers::Server};

/// HTTP access to the upstream marketplace pages.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    config: UpstreamConfig,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> Result<Self, reqwest::Error> {
        let mut headers = header::HeaderMap::new();
        if let Ok(lang) = header::HeaderValue::from_str(&config.accept_language) {
            headers.insert(header::ACCEPT_LANGUAGE, lang);
        }

        // the upstream rejects requests without a browser user-agent
        let http = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;

        Ok(Self { http, config })
    }

    async fn get_html(
        &self,
        url: &str,
        referer: &str,
        params: &[(&str, &str)],
        context: &PageContext<'_>,
    ) -> Result<String, FetchError> {
        let start = Instant::now();

        let response = self
            .http
            .get(url)
            .header(header::REFERER, referer)
            .query(params)
            .send()
            .await
            .map_err(|err| {
                let err = FetchError::from(err);
                warn!(
                    server = %context.server,
                    keyword = context.keyword,
                    page = context.page,
                    error = %err,
                    "upstream request failed"
                );
                err
            })?;

        let status = response.status();
        histogram!("vending_upstream_fetch_time", start.elapsed(), "server" => context.server.code());
        increment_counter!("vending_upstream_fetch", "status" => status.as_u16().to_string());

        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!(
                server = %context.server,
                keyword = context.keyword,
                page = context.page,
                status = status.as_u16(),
                "upstream rate limited"
            );
            return Err(FetchError::RateLimited {
                status: status.as_u16(),
            });
        }

        if !status.is_success() {
            warn!(
                server = %context.server,
                keyword = context.keyword,
                page = context.page,
                status = status.as_u16(),
                "upstream returned an error status"
            );
            return Err(FetchError::Status(status.as_u16()));
        }

        Ok(response.text().await?)
    }
}

struct PageContext<'a> {
    server: Server,
    keyword: &'a str,
    page: u32,
}

#[async_trait]
impl PageSource for UpstreamClient {
    async fn fetch_page(&self, request: &PageRequest) -> Result<ScrapedPage, FetchError> {
        let page = request.page.to_string();
        let params = [
            ("svrID", request.server.site_code()),
            ("itemFullName", request.keyword.as_str()),
            ("itemOrder", ""),
            ("inclusion", ""),
            ("curpage", page.as_str()),
        ];
        let context = PageContext {
            server: request.server,
            keyword: &request.keyword,
            page: request.page,
        };

        let body = self
            .get_html(&self.config.list_url, &self.config.referer, &params, &context)
            .await?;

        let mut scraped = parser::parse_page(&body, request.page, &self.config.origin);
        scraped.sort_by(request.sort);

        if !scraped.table_found {
            warn!(
                server = %request.server,
                keyword = request.keyword,
                page = request.page,
                "upstream page has no result table"
            );
        }
        debug!(
            server = %request.server,
            keyword = request.keyword,
            page = request.page,
            rows = scraped.listings.len(),
            skipped = scraped.skipped_rows,
            total = scraped.total,
            "parsed upstream page"
        );

        Ok(scraped)
    }

    async fn fetch_detail(
        &self,
        server: Server,
        map_id: &str,
        transaction_id: &str,
    ) -> Result<ListingDetail, FetchError> {
        let params = [
            ("svrID", server.site_code()),
            ("mapID", map_id),
            ("ssi", transaction_id),
            ("curpage", "1"),
        ];
        let context = PageContext {
            server,
            keyword: transaction_id,
            page: 1,
        };

        let body = self
            .get_html(
                &self.config.detail_url,
                &self.config.list_url,
                &params,
                &context,
            )
            .await?;

        Ok(parser::parse_detail(&body, map_id, transaction_id))
    }
}
