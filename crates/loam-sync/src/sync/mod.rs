//! Catalog sync pipeline
//!
//! Backfill runs first and pagination gets whatever budget is left. The
//! completion check runs last, once both have stopped.

use serde::Serialize;

use crate::error::{ProviderError, Result};

pub mod backfill;
pub mod completion;
pub mod orchestrator;
pub mod pagination;
pub mod retry;
pub mod state;

pub use backfill::{BackfillPlanner, BackfillReport};
pub use completion::{CompletionCheck, CompletionDetector};
pub use orchestrator::{CatalogSync, InvocationReport, RunOutcome, SkipReason, Trigger};
pub use pagination::{PaginationDriver, PaginationReport};
pub use retry::PendingRetry;
pub use state::{Claim, RunState, RunStateStore, RunStatus};

/// Why a component stopped issuing provider calls early
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "message", rename_all = "snake_case")]
pub enum Halt {
    BudgetExhausted,
    QuotaRejected(String),
}

/// Turn budget and quota errors into a halt; everything else is a failure
pub(crate) fn halt_on(err: ProviderError) -> Result<Halt> {
    match err {
        ProviderError::BudgetExhausted { .. } => Ok(Halt::BudgetExhausted),
        ProviderError::QuotaExceeded(message) => Ok(Halt::QuotaRejected(message)),
        other => Err(other.into()),
    }
}
