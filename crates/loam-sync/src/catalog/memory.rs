//! In-memory catalog and run state store
//!
//! Used by the pipeline tests and by `loam-sync run --in-memory` for dry runs
//! against the live provider. Fetch recency is a logical sequence number
//! rather than a timestamp so ordering stays deterministic.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{CatalogRecord, CatalogStore, UpsertOutcome};
use crate::error::Result;
use crate::sync::retry::PendingRetry;
use crate::sync::state::{Claim, RunState, RunStateStore};

#[derive(Debug, Clone)]
struct StoredRecord {
    record: CatalogRecord,
    fetched_seq: u64,
    writes: u32,
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<(String, String), StoredRecord>,
    runs: HashMap<String, RunState>,
    retries: HashMap<String, PendingRetry>,
    seq: u64,
}

/// Store backed by process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times a record has been written
    pub async fn write_count(&self, source: &str, provenance_id: &str) -> u32 {
        let inner = self.inner.lock().await;
        inner
            .records
            .get(&(source.to_string(), provenance_id.to_string()))
            .map_or(0, |stored| stored.writes)
    }

    /// Install a run state row directly
    pub async fn put_run(&self, state: RunState) {
        self.inner
            .lock()
            .await
            .runs
            .insert(state.pipeline.clone(), state);
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn upsert(&self, record: &CatalogRecord) -> Result<UpsertOutcome> {
        let mut inner = self.inner.lock().await;
        inner.seq += 1;
        let seq = inner.seq;
        let key = (
            record.provenance_source.clone(),
            record.provenance_id.clone(),
        );

        match inner.records.get_mut(&key) {
            Some(stored) => {
                stored.record = record.clone();
                stored.fetched_seq = seq;
                stored.writes += 1;
                Ok(UpsertOutcome::Updated)
            },
            None => {
                inner.records.insert(
                    key,
                    StoredRecord {
                        record: record.clone(),
                        fetched_seq: seq,
                        writes: 1,
                    },
                );
                Ok(UpsertOutcome::Inserted)
            },
        }
    }

    async fn get(&self, source: &str, provenance_id: &str) -> Result<Option<CatalogRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .get(&(source.to_string(), provenance_id.to_string()))
            .map(|stored| stored.record.clone()))
    }

    async fn incomplete_records(&self, source: &str, limit: u32) -> Result<Vec<String>> {
        let inner = self.inner.lock().await;
        let mut candidates: Vec<&StoredRecord> = inner
            .records
            .values()
            .filter(|s| s.record.provenance_source == source && !s.record.is_complete())
            .collect();

        // Numeric ids sort naturally: shorter first, then lexically
        candidates.sort_by(|a, b| {
            a.fetched_seq
                .cmp(&b.fetched_seq)
                .then(a.record.provenance_id.len().cmp(&b.record.provenance_id.len()))
                .then(a.record.provenance_id.cmp(&b.record.provenance_id))
        });

        Ok(candidates
            .into_iter()
            .take(limit as usize)
            .map(|s| s.record.provenance_id.clone())
            .collect())
    }

    async fn count_incomplete(&self, source: &str) -> Result<u64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .values()
            .filter(|s| s.record.provenance_source == source && !s.record.is_complete())
            .count() as u64)
    }

    async fn count_records(&self, source: &str) -> Result<u64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .values()
            .filter(|s| s.record.provenance_source == source)
            .count() as u64)
    }
}

#[async_trait]
impl RunStateStore for MemoryStore {
    async fn load(&self, pipeline: &str) -> Result<Option<RunState>> {
        Ok(self.inner.lock().await.runs.get(pipeline).cloned())
    }

    async fn try_begin(
        &self,
        pipeline: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Claim> {
        let mut inner = self.inner.lock().await;
        let claim = RunState::claim(inner.runs.get(pipeline), pipeline, now, stale_after);
        if let Claim::Started { state, .. } = &claim {
            inner.runs.insert(pipeline.to_string(), state.clone());
        }
        Ok(claim)
    }

    async fn save(&self, state: &RunState) -> Result<()> {
        self.inner
            .lock()
            .await
            .runs
            .insert(state.pipeline.clone(), state.clone());
        Ok(())
    }

    async fn restore(&self, pipeline: &str, snapshot: Option<&RunState>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match snapshot {
            Some(previous) => {
                inner.runs.insert(pipeline.to_string(), previous.clone());
            },
            None => {
                inner.runs.remove(pipeline);
            },
        }
        Ok(())
    }

    async fn pending_retry(&self, pipeline: &str) -> Result<Option<PendingRetry>> {
        Ok(self.inner.lock().await.retries.get(pipeline).copied())
    }

    async fn set_retry(&self, pipeline: &str, retry: Option<&PendingRetry>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match retry {
            Some(retry) => {
                inner.retries.insert(pipeline.to_string(), *retry);
            },
            None => {
                inner.retries.remove(pipeline);
            },
        }
        Ok(())
    }
}
