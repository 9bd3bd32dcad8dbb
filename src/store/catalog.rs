use async_trait::async_trait;
use sqlx::PgPool;
use std::{
    io::Write,
    path::{Path, PathBuf},
};

use super::StoreError;
use crate::entities::CatalogItem;

/// Where the authoritative item catalog comes from.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn load(&self) -> Result<Vec<CatalogItem>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CatalogSource for PgCatalog {
    async fn load(&self) -> Result<Vec<CatalogItem>, StoreError> {
        let items = sqlx::query_as::<_, CatalogItem>(
            "SELECT item_id, name FROM item_catalog WHERE name <> '' ORDER BY item_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }
}

/// Catalog read from a bincode + zstd file produced by the `extract` tool.
#[derive(Debug, Clone)]
pub struct FileCatalog {
    path: PathBuf,
}

impl FileCatalog {
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl CatalogSource for FileCatalog {
    async fn load(&self) -> Result<Vec<CatalogItem>, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_catalog_file(&path)).await?
    }
}

pub fn read_catalog_file(path: &Path) -> Result<Vec<CatalogItem>, StoreError> {
    let file = std::fs::File::open(path)?;
    let mut decoder = zstd::stream::Decoder::new(file)?;
    Ok(bincode::deserialize_from(&mut decoder)?)
}

pub fn write_catalog_file(path: &Path, items: &[CatalogItem]) -> Result<(), StoreError> {
    let file = std::fs::File::create(path)?;
    let mut enc = zstd::stream::Encoder::new(file, 10)?;
    bincode::serialize_into(&mut enc, items)?;
    enc.flush()?;
    enc.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_catalog_reads_what_extract_writes() {
        let path = std::env::temp_dir().join(format!("catalog-{}.bin.zstd", uuid::Uuid::new_v4()));
        let items = vec![
            CatalogItem {
                item_id: 501,
                name: "Red Potion".to_string(),
            },
            CatalogItem {
                item_id: 2357,
                name: "Valkyrie Armor".to_string(),
            },
        ];

        write_catalog_file(&path, &items).unwrap();
        let loaded = FileCatalog::new(path.clone()).load().await.unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded, items);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let catalog = FileCatalog::new(PathBuf::from("/nonexistent/items.bin.zstd"));
        assert!(matches!(catalog.load().await, Err(StoreError::Io(_))));
    }
}
