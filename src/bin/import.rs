use std::time::Instant;

use sqlx::postgres::PgPoolOptions;
use tracing::info;
use vending_search::store::catalog::read_catalog_file;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    run().await
}

// Loads the compact catalog written by `extract` into the item_catalog table.
async fn run() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    std::env::set_var(
        "RUST_LOG",
        std::env::var("RUST_LOG").unwrap_or_else(|_| String::from("info")),
    );

    // initialize tracing
    tracing_subscriber::fmt::init();

    let input = std::env::var("CATALOG_PATH").unwrap_or_else(|_| "assets/items.bin.zstd".into());
    let items = read_catalog_file(std::path::Path::new(&input))?;

    info!("Loaded {} items from {input}", items.len());

    let pool = PgPoolOptions::new()
        .max_connections(
            std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|x| x.parse().ok())
                .unwrap_or(30),
        )
        .connect(&std::env::var("DATABASE_URL")?)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let start = Instant::now();
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM item_catalog")
        .execute(&mut tx)
        .await?;

    for item in &items {
        sqlx::query("INSERT INTO item_catalog (item_id, name) VALUES ($1, $2)")
            .bind(item.item_id)
            .bind(&item.name)
            .execute(&mut tx)
            .await?;
    }

    tx.commit().await?;

    let elapsed = start.elapsed();
    info!("Done in {elapsed:?}");

    Ok(())
}
