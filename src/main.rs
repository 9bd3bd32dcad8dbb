#![forbid(unsafe_code)]
#![deny(clippy::missing_const_for_fn)]
#![deny(clippy::nursery)]
#![deny(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]

use axum::routing::get;
use axum_prometheus::PrometheusMetricLayer;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use vending_search::{
    cache::CacheStore,
    collector::Collector,
    config::{Config, LISTING_RETENTION},
    governor::Governor,
    resolver::ItemResolver,
    routes,
    scheduler::{self, Maintenance},
    search::SearchService,
    store::{
        CatalogSource, FileCatalog, ListingStore, MemoryListingStore, MemorySnapshotStore,
        PgCatalog, PgListingStore, PgSnapshotStore, SnapshotStore,
    },
    upstream::{PageSource, UpstreamClient},
    AppState,
};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();
    std::env::set_var(
        "RUST_LOG",
        std::env::var("RUST_LOG").unwrap_or_else(|_| String::from("info")),
    );

    // initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Arc::new(Config::from_env()?);

    let (snapshots, listings, catalog): (
        Arc<dyn SnapshotStore>,
        Arc<dyn ListingStore>,
        Arc<dyn CatalogSource>,
    ) = if let Some(url) = &config.database_url {
        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .connect(url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("connected to postgres");

        (
            Arc::new(PgSnapshotStore::new(pool.clone())) as Arc<dyn SnapshotStore>,
            Arc::new(PgListingStore::new(pool.clone())) as Arc<dyn ListingStore>,
            Arc::new(PgCatalog::new(pool)) as Arc<dyn CatalogSource>,
        )
    } else {
        warn!("DATABASE_URL not set, using in-memory stores");
        (
            Arc::new(MemorySnapshotStore::new()) as Arc<dyn SnapshotStore>,
            Arc::new(MemoryListingStore::new()) as Arc<dyn ListingStore>,
            Arc::new(FileCatalog::new(config.catalog_path.clone())) as Arc<dyn CatalogSource>,
        )
    };

    let resolver = Arc::new(ItemResolver::new(
        catalog,
        config.icon_url_template.clone(),
    ));
    if let Err(err) = resolver.rebuild().await {
        warn!(error = %err, "initial item index build failed, names will not resolve until the next rebuild");
    }

    let source: Arc<dyn PageSource> = Arc::new(UpstreamClient::new(config.upstream.clone())?);
    let governor = Arc::new(Governor::new(config.governor));
    let cache = CacheStore::new(
        snapshots,
        config.front_cache_capacity,
        config.front_cache_ttl,
    );

    let collector = Arc::new(Collector::new(
        Arc::clone(&source),
        Arc::clone(&listings),
        Arc::clone(&resolver),
        Arc::clone(&governor),
        config.collect,
    ));
    let search = Arc::new(SearchService::new(
        config.search,
        Arc::clone(&source),
        cache.clone(),
        Arc::clone(&listings),
        Arc::clone(&resolver),
        Arc::clone(&governor),
        Arc::clone(&collector),
    ));

    let maintenance = Arc::new(Maintenance {
        resolver: Arc::clone(&resolver),
        cache,
        listings,
        governor: Arc::clone(&governor),
        snapshot_retention: config.snapshot_retention,
        listing_retention: LISTING_RETENTION,
    });
    let _scheduler =
        scheduler::start(maintenance, config.resolver_refresh, config.sweep_interval).await?;

    let state = AppState {
        config: Arc::clone(&config),
        search,
        collector,
        source,
        resolver,
        governor,
    };

    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    let app = routes::api()
        .route("/metrics", get(|| async move { metric_handle.render() }))
        .layer(prometheus_layer)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!(
        addr = %config.bind_addr,
        strategy = config.search.strategy.as_str(),
        "listening"
    );
    axum::Server::bind(&config.bind_addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
