//! Catalog persistence contract

use async_trait::async_trait;
use serde::Serialize;

use super::CatalogRecord;
use crate::error::Result;

/// What an upsert did to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Catalog storage keyed by `(provenance_source, provenance_id)`
///
/// Implementations must make [`CatalogStore::upsert`] idempotent: writing the
/// same record twice leaves exactly one row holding the last written values.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Insert the record, or overwrite the pipeline-owned fields of the row
    /// with the same provenance key. Marks the row as fetched now.
    async fn upsert(&self, record: &CatalogRecord) -> Result<UpsertOutcome>;

    async fn get(&self, source: &str, provenance_id: &str) -> Result<Option<CatalogRecord>>;

    /// Provenance ids of incomplete records from `source`, least recently
    /// fetched first, ties broken by provenance id ascending
    async fn incomplete_records(&self, source: &str, limit: u32) -> Result<Vec<String>>;

    async fn count_incomplete(&self, source: &str) -> Result<u64>;

    async fn count_records(&self, source: &str) -> Result<u64>;
}
