#![forbid(unsafe_code)]
#![deny(clippy::missing_const_for_fn)]
#![deny(clippy::nursery)]
#![deny(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]

use std::sync::Arc;

pub use sqlx::PgPool;

pub mod cache;
pub mod coalesce;
pub mod collector;
pub mod config;
pub mod entities;
pub mod error;
pub mod governor;
pub mod normalize;
pub mod query;
pub mod resolver;
pub mod routes;
pub mod scheduler;
pub mod search;
pub mod servers;
pub mod store;
pub mod upstream;
pub mod util;

use config::Config;
use governor::Governor;
use resolver::ItemResolver;
use search::SearchService;
use upstream::PageSource;

#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub search: Arc<SearchService>,
    pub collector: Arc<collector::Collector>,
    // detail pages bypass the search cache
    pub source: Arc<dyn PageSource>,
    pub resolver: Arc<ItemResolver>,
    pub governor: Arc<Governor>,
}
