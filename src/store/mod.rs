//! Persistence. Every store is a trait with a Postgres implementation and an
//! in-memory one, picked at startup depending on whether a database is
//! configured.

use thiserror::Error;

pub mod catalog;
pub mod listings;
pub mod snapshots;

pub use catalog::{CatalogSource, FileCatalog, PgCatalog};
pub use listings::{ListingPage, ListingStore, MemoryListingStore, PgListingStore, Upserted};
pub use snapshots::{MemorySnapshotStore, PgSnapshotStore, SnapshotStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("catalog file: {0}")]
    Io(#[from] std::io::Error),
    #[error("catalog decode: {0}")]
    Decode(#[from] bincode::Error),
    #[error("cached result is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("invalid cache entry: {0}")]
    Invalid(String),
}
