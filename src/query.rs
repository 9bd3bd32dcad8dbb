use serde::Deserialize;

use crate::servers::Server;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    Price,
    Quantity,
    Name,
    ScrapedAt,
}

impl SortField {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::Quantity => "quantity",
            Self::Name => "name",
            Self::ScrapedAt => "scraped_at",
        }
    }

    /// Column in `vending_listing` this field orders by.
    #[must_use]
    pub const fn column(self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::Quantity => "quantity",
            Self::Name => "item_name",
            Self::ScrapedAt => "scraped_at",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

impl SortDir {
    #[must_use]
    pub const fn sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sort {
    pub field: SortField,
    pub dir: SortDir,
}

impl Sort {
    /// Every row of a freshly scraped page shares one scrape time, so on a
    /// scraped page `scraped_at` order is price order.
    #[must_use]
    pub const fn on_scraped_page(self) -> Self {
        match self.field {
            SortField::ScrapedAt => Self {
                field: SortField::Price,
                dir: self.dir,
            },
            _ => self,
        }
    }

    /// Token used in cache keys. Ascending keeps the bare field name.
    #[must_use]
    pub fn token(self) -> String {
        match self.dir {
            SortDir::Asc => self.field.as_str().to_string(),
            SortDir::Desc => format!("{}:desc", self.field.as_str()),
        }
    }
}

/// A validated search request. Built by the HTTP layer, consumed by the
/// search façade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub server: Server,
    pub keyword: String,
    pub page: u32,
    pub size: u32,
    pub sort: Sort,
}

impl SearchQuery {
    #[must_use]
    pub fn cache_key(&self) -> String {
        cache_key(self.server.code(), &self.keyword, self.page, self.size, self.sort)
    }

    #[must_use]
    pub fn cooldown_key(&self) -> String {
        cooldown_key(self.server, &self.keyword)
    }
}

#[must_use]
pub fn cache_key(server: &str, keyword: &str, page: u32, size: u32, sort: Sort) -> String {
    format!(
        "{}|{}|{}|{}|{}",
        server.to_lowercase(),
        keyword,
        page,
        size,
        sort.token()
    )
}

/// Key shared by the collection cooldown and the rate-limit backoff.
#[must_use]
pub fn cooldown_key(server: Server, keyword: &str) -> String {
    format!("{}|{}", server.code(), keyword.trim())
}
