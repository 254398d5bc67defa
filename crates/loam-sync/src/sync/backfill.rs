//! Backfill planner
//!
//! Re-fetches detail for records stored with missing core fields. Runs ahead
//! of pagination so known gaps are repaired before new pages are discovered.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use super::{halt_on, Halt};
use crate::catalog::CatalogStore;
use crate::error::Result;
use crate::provider::BudgetedClient;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    /// Incomplete records found when the sweep started
    pub candidates: u32,
    /// Candidates that came back complete
    pub repaired: u32,
    /// Candidates refetched but still missing core fields
    pub still_incomplete: u32,
    pub halt: Option<Halt>,
}

pub struct BackfillPlanner {
    store: Arc<dyn CatalogStore>,
    batch_size: u32,
}

impl BackfillPlanner {
    pub fn new(store: Arc<dyn CatalogStore>, batch_size: u32) -> Self {
        Self { store, batch_size }
    }

    /// Candidates for the next sweep, in the order they will be fetched
    pub async fn plan(&self, source: &str) -> Result<Vec<String>> {
        self.store.incomplete_records(source, self.batch_size).await
    }

    /// Refetch candidates until they run out or the budget does
    pub async fn run(&self, client: &mut BudgetedClient) -> Result<BackfillReport> {
        let candidates = self.plan(client.source()).await?;
        let mut report = BackfillReport {
            candidates: candidates.len() as u32,
            ..BackfillReport::default()
        };

        if candidates.is_empty() {
            debug!("No incomplete records to backfill");
            return Ok(report);
        }

        info!(
            candidates = report.candidates,
            remaining_budget = client.remaining(),
            "Backfilling incomplete records"
        );

        for provenance_id in &candidates {
            let mut record = match client.fetch_detail(provenance_id).await {
                Ok(record) => record,
                Err(e) => {
                    let halt = halt_on(e)?;
                    info!(?halt, requests_used = client.used(), "Backfill stopped early");
                    report.halt = Some(halt);
                    break;
                },
            };

            record.name_or_unknown();
            self.store.upsert(&record).await?;

            if record.is_complete() {
                report.repaired += 1;
            } else {
                debug!(
                    provenance_id = %provenance_id,
                    missing = ?record.missing_core_fields(),
                    "Record still incomplete after refetch"
                );
                report.still_incomplete += 1;
            }
        }

        info!(
            repaired = report.repaired,
            still_incomplete = report.still_incomplete,
            requests_used = client.used(),
            "Backfill sweep finished"
        );

        Ok(report)
    }
}
