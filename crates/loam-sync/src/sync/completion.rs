//! Completion detector

use serde::Serialize;
use std::sync::Arc;

use super::{BackfillReport, PaginationReport};
use crate::catalog::CatalogStore;
use crate::error::Result;

/// Inputs of the completion decision for one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompletionCheck {
    pub reached_last_page: bool,
    /// Incomplete records found when this invocation's backfill sweep began
    pub backfill_candidates: u32,
    /// Incomplete records left after this invocation
    pub incomplete_remaining: u64,
    pub budget_exhausted: bool,
}

impl CompletionCheck {
    /// Complete only when every condition holds at once
    pub fn is_complete(&self) -> bool {
        self.reached_last_page
            && self.backfill_candidates == 0
            && self.incomplete_remaining == 0
            && !self.budget_exhausted
    }

    /// Conditions still preventing completion
    pub fn blockers(&self) -> Vec<&'static str> {
        let mut blockers = Vec::new();
        if !self.reached_last_page {
            blockers.push("pages_remaining");
        }
        if self.backfill_candidates > 0 {
            blockers.push("backfill_found_gaps");
        }
        if self.incomplete_remaining > 0 {
            blockers.push("incomplete_records");
        }
        if self.budget_exhausted {
            blockers.push("budget_exhausted");
        }
        blockers
    }
}

pub struct CompletionDetector {
    store: Arc<dyn CatalogStore>,
}

impl CompletionDetector {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    pub async fn evaluate(
        &self,
        source: &str,
        backfill: &BackfillReport,
        pagination: &PaginationReport,
    ) -> Result<CompletionCheck> {
        Ok(CompletionCheck {
            reached_last_page: pagination.reached_last_page,
            backfill_candidates: backfill.candidates,
            incomplete_remaining: self.store.count_incomplete(source).await?,
            budget_exhausted: backfill.halt.is_some() || pagination.halt.is_some(),
        })
    }
}
