#![forbid(unsafe_code)]
#![deny(clippy::missing_const_for_fn)]
#![deny(clippy::nursery)]
#![deny(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]

use serde::Deserialize;
use std::{path::PathBuf, time::Instant};
use tracing::info;
use vending_search::{entities::CatalogItem, store::catalog::write_catalog_file};

#[derive(Debug, Deserialize)]
struct ExportedItem {
    #[serde(alias = "item_id")]
    id: i32,
    #[serde(alias = "nameKr", alias = "name_kr")]
    name: Option<String>,
}

// Tool to convert a JSON catalog export into the compact format the server
// and `import` read. Usage: extract [input.json] [output.bin.zstd]
fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    std::env::set_var(
        "RUST_LOG",
        std::env::var("RUST_LOG").unwrap_or_else(|_| String::from("info")),
    );

    // initialize tracing
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let input = PathBuf::from(args.next().unwrap_or_else(|| "assets/items.json".into()));
    let output = PathBuf::from(args.next().unwrap_or_else(|| "assets/items.bin.zstd".into()));

    let now = Instant::now();

    let exported: Vec<ExportedItem> =
        serde_json::from_reader(std::io::BufReader::new(std::fs::File::open(&input)?))?;
    let total = exported.len();

    let mut items: Vec<CatalogItem> = exported
        .into_iter()
        .filter_map(|item| {
            let name = item.name?.trim().to_string();
            (!name.is_empty()).then_some(CatalogItem {
                item_id: item.id,
                name,
            })
        })
        .collect();
    items.sort_by_key(|item| item.item_id);
    items.dedup_by_key(|item| item.item_id);

    info!(
        "Kept {} of {total} items in {:?}",
        items.len(),
        now.elapsed()
    );

    if let Some(dir) = output.parent() {
        std::fs::create_dir_all(dir).ok();
    }
    write_catalog_file(&output, &items)?;

    info!("Wrote {}", output.display());

    Ok(())
}
