//! Catalog sync orchestrator
//!
//! Single entry point for every trigger. One call of [`CatalogSync::run`] is
//! one invocation: claim the run, backfill, paginate, check completion,
//! persist, notify. Failures and panics are caught here and recorded on the
//! run state; `run` itself never errors. A notifier that panics loses its
//! message but never the invocation.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::backfill::{BackfillPlanner, BackfillReport};
use super::completion::{CompletionCheck, CompletionDetector};
use super::pagination::{PaginationDriver, PaginationReport};
use super::retry::{self, PendingRetry};
use super::state::{Claim, RunState, RunStateStore, RunStatus};
use super::Halt;
use crate::catalog::CatalogStore;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::notify::{Notifier, ProgressSummary, SyncEvent};
use crate::provider::{BudgetedClient, CatalogProvider};

/// What started an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Daily cron
    Scheduled,
    /// CLI or HTTP request
    Manual,
    /// One-off retry after the quota was not yet reset
    QuotaRetry { attempt: u32 },
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Scheduled => f.write_str("scheduled"),
            Trigger::Manual => f.write_str("manual"),
            Trigger::QuotaRetry { attempt } => write!(f, "quota_retry_{}", attempt),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyRunning,
    AlreadyComplete,
}

/// Summary of an invocation that ran to the end
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvocationReport {
    pub status: RunStatus,
    pub requests_used: u32,
    pub budget: u32,
    pub backfill_candidates: u32,
    pub records_repaired: u32,
    pub records_written: u64,
    pub pages_committed: u32,
    pub current_page: u32,
    pub total_pages: Option<u32>,
    pub budget_exhausted: bool,
    pub incomplete_remaining: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Skipped {
        reason: SkipReason,
    },
    /// First call hit the upstream quota; run state was left as it was
    QuotaNotReset {
        attempt: u32,
        retry_at: Option<DateTime<Utc>>,
    },
    Finished(InvocationReport),
    Failed {
        error: String,
    },
}

struct Execution {
    backfill: BackfillReport,
    pagination: PaginationReport,
    completion: CompletionCheck,
}

/// The catalog sync pipeline
pub struct CatalogSync {
    config: SyncConfig,
    provider: Arc<dyn CatalogProvider>,
    catalog: Arc<dyn CatalogStore>,
    runs: Arc<dyn RunStateStore>,
    notifier: Arc<dyn Notifier>,
    backfill: BackfillPlanner,
    pagination: PaginationDriver,
    completion: CompletionDetector,
}

impl CatalogSync {
    pub fn new(
        config: SyncConfig,
        provider: Arc<dyn CatalogProvider>,
        catalog: Arc<dyn CatalogStore>,
        runs: Arc<dyn RunStateStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let backfill = BackfillPlanner::new(catalog.clone(), config.backfill_batch_size);
        let pagination = PaginationDriver::new(catalog.clone(), runs.clone(), config.page_size);
        let completion = CompletionDetector::new(catalog.clone());

        Self {
            config,
            provider,
            catalog,
            runs,
            notifier,
            backfill,
            pagination,
            completion,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Current run state of this pipeline
    pub async fn status(&self) -> Result<Option<RunState>> {
        self.runs.load(&self.config.pipeline).await
    }

    /// Quota retry waiting to run, if any
    pub async fn pending_retry(&self) -> Result<Option<PendingRetry>> {
        self.runs.pending_retry(&self.config.pipeline).await
    }

    /// Drop the pending quota retry before it is run or superseded
    pub async fn clear_retry(&self) -> Result<()> {
        self.runs.set_retry(&self.config.pipeline, None).await
    }

    /// Run one invocation
    pub async fn run(&self, trigger: Trigger) -> RunOutcome {
        let invocation_id = Uuid::new_v4();
        let span = info_span!(
            "catalog_sync",
            %invocation_id,
            %trigger,
            pipeline = %self.config.pipeline
        );

        async {
            match AssertUnwindSafe(self.invoke(trigger)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => {
                    let error = format!("panic: {}", panic_message(panic.as_ref()));
                    error!(error = %error, "Invocation panicked outside a claimed run");
                    self.notify(SyncEvent::UnexpectedError, &format!("Error: {}", error))
                        .await;
                    RunOutcome::Failed { error }
                },
            }
        }
        .instrument(span)
        .await
    }

    async fn invoke(&self, trigger: Trigger) -> RunOutcome {
        let pipeline = self.config.pipeline.as_str();

        let claim = match self
            .runs
            .try_begin(pipeline, Utc::now(), self.config.stale_after())
            .await
        {
            Ok(claim) => claim,
            Err(e) => {
                let error = e.to_string();
                error!(error = %error, "Could not claim run state");
                self.notify(SyncEvent::UnexpectedError, &format!("Error: {}", error))
                    .await;
                return RunOutcome::Failed { error };
            },
        };

        let (mut state, previous) = match claim {
            Claim::Started { state, previous } => (state, previous),
            Claim::AlreadyComplete(_) => {
                info!("Catalog already complete, nothing to do");
                return RunOutcome::Skipped {
                    reason: SkipReason::AlreadyComplete,
                };
            },
            Claim::AlreadyRunning(current) => {
                warn!(
                    started_at = ?current.started_at,
                    "Another invocation is running, skipping"
                );
                return RunOutcome::Skipped {
                    reason: SkipReason::AlreadyRunning,
                };
            },
        };

        if previous.as_ref().is_some_and(|p| p.status == RunStatus::Running) {
            warn!("Taking over a stale run");
        }

        info!(
            current_page = state.current_page,
            total_pages = ?state.total_pages,
            budget = self.config.request_budget,
            "Catalog sync started"
        );

        let mut client = BudgetedClient::new(self.provider.clone(), self.config.request_budget);

        // Everything that touches the claimed row runs under this guard
        let guarded = AssertUnwindSafe(async {
            let execution = self.execute(&mut client, &mut state).await?;
            self.conclude(trigger, &client, &mut state, previous.as_ref(), execution)
                .await
        })
        .catch_unwind()
        .await;

        let error = match guarded {
            Ok(Ok(outcome)) => return outcome,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => format!("panic: {}", panic_message(panic.as_ref())),
        };

        match AssertUnwindSafe(self.fail(&client, &mut state, error.clone()))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                error!(
                    error = %error,
                    panic = %panic_message(panic.as_ref()),
                    "Recording the failed run panicked; the row is left to go stale"
                );
                RunOutcome::Failed { error }
            },
        }
    }

    async fn execute(
        &self,
        client: &mut BudgetedClient,
        state: &mut RunState,
    ) -> Result<Execution> {
        let backfill = self.backfill.run(client).await?;

        let pagination = if backfill.halt.is_none() {
            self.pagination.run(client, state).await?
        } else {
            PaginationReport::not_started(state)
        };

        let completion = self
            .completion
            .evaluate(client.source(), &backfill, &pagination)
            .await?;

        Ok(Execution {
            backfill,
            pagination,
            completion,
        })
    }

    async fn conclude(
        &self,
        trigger: Trigger,
        client: &BudgetedClient,
        state: &mut RunState,
        previous: Option<&RunState>,
        execution: Execution,
    ) -> Result<RunOutcome> {
        let halt = execution
            .backfill
            .halt
            .as_ref()
            .or(execution.pagination.halt.as_ref());

        if let Some(Halt::QuotaRejected(message)) = halt {
            if client.used() == 1 {
                return self.quota_not_reset(trigger, previous, message).await;
            }
            warn!(
                requests_used = client.used(),
                error = %message,
                "Quota rejected mid-invocation, stopping"
            );
        }

        let complete = execution.completion.is_complete();

        // Work on a copy so a failed save leaves `state` running for `fail`
        let mut finished = state.clone();
        finished.transition(RunStatus::Success)?;
        if complete {
            finished.transition(RunStatus::Complete)?;
        }
        finished.requests_used = client.used();
        finished.finished_at = Some(Utc::now());
        finished.error_message = None;
        self.runs.save(&finished).await?;
        *state = finished;

        // This invocation got past the quota, so an older retry is moot
        self.clear_retry().await?;

        let report = InvocationReport {
            status: state.status,
            requests_used: client.used(),
            budget: self.config.request_budget,
            backfill_candidates: execution.backfill.candidates,
            records_repaired: execution.backfill.repaired,
            records_written: execution.pagination.records_written,
            pages_committed: execution.pagination.pages_committed,
            current_page: state.current_page,
            total_pages: state.total_pages,
            budget_exhausted: execution.completion.budget_exhausted,
            incomplete_remaining: execution.completion.incomplete_remaining,
        };

        if complete {
            info!(
                current_page = state.current_page,
                records_synced = state.records_synced,
                "Catalog fully seeded"
            );
            let details = format!(
                "The catalog sync has finished.\n\n{}",
                self.summary(state).await
            );
            self.notify(SyncEvent::CatalogSeeded, &details).await;
        } else if report.budget_exhausted {
            info!(
                requests_used = report.requests_used,
                pages_committed = report.pages_committed,
                "Daily budget reached"
            );
            let details = format!(
                "Today's catalog sync reached its request budget.\n\n{}",
                self.summary(state).await
            );
            self.notify(SyncEvent::BudgetReached, &details).await;
        } else {
            info!(
                blockers = ?execution.completion.blockers(),
                requests_used = report.requests_used,
                "Invocation finished, catalog not yet complete"
            );
        }

        Ok(RunOutcome::Finished(report))
    }

    async fn quota_not_reset(
        &self,
        trigger: Trigger,
        previous: Option<&RunState>,
        message: &str,
    ) -> Result<RunOutcome> {
        let attempt = match trigger {
            Trigger::QuotaRetry { attempt } => attempt + 1,
            Trigger::Scheduled | Trigger::Manual => 1,
        };

        // Only a scheduling deployment will ever pick a stored retry up
        let retry = if self.config.enabled {
            retry::retry_at(Utc::now(), &self.config.retry_hours_utc, attempt)
                .map(|at| PendingRetry { attempt, at })
        } else {
            None
        };
        let retry_at = retry.map(|r| r.at);

        self.runs.set_retry(&self.config.pipeline, retry.as_ref()).await?;
        self.runs.restore(&self.config.pipeline, previous).await?;

        warn!(attempt, ?retry_at, error = %message, "Provider quota not reset");

        let next = match retry_at {
            Some(at) => format!("Retry {} scheduled for {}", attempt, at.format("%Y-%m-%d %H:%M UTC")),
            None if !self.config.enabled => {
                "Scheduled sync is disabled, so no retry was scheduled; trigger a run once the quota resets"
                    .to_string()
            },
            None => "No retries left today; the next daily run will try again".to_string(),
        };
        let state = previous.cloned().unwrap_or_else(|| RunState {
            status: RunStatus::Success,
            ..RunState::fresh(self.config.pipeline.clone(), Utc::now())
        });
        let details = format!(
            "The provider quota was not yet available.\n\nProvider said: {}\n{}\n\n{}",
            message,
            next,
            self.summary(&state).await
        );
        self.notify(SyncEvent::QuotaNotReset, &details).await;

        Ok(RunOutcome::QuotaNotReset { attempt, retry_at })
    }

    async fn fail(&self, client: &BudgetedClient, state: &mut RunState, error: String) -> RunOutcome {
        error!(
            error = %error,
            current_page = state.current_page,
            requests_used = client.used(),
            "Catalog sync failed"
        );

        match state.transition(RunStatus::Failed) {
            Ok(()) => {
                state.requests_used = client.used();
                state.finished_at = Some(Utc::now());
                state.error_message = Some(error.clone());

                if let Err(e) = self.runs.save(state).await {
                    error!("Failed to record failed run state: {}", e);
                }
            },
            Err(e) => error!("Run state left as it was: {}", e),
        }

        let details = format!(
            "The catalog sync encountered an unexpected error.\n\nError: {}\n\n{}",
            error,
            self.summary(state).await
        );
        self.notify(SyncEvent::UnexpectedError, &details).await;

        RunOutcome::Failed { error }
    }

    async fn notify(&self, event: SyncEvent, details: &str) {
        if let Err(panic) = AssertUnwindSafe(self.notifier.notify(event, details))
            .catch_unwind()
            .await
        {
            error!(
                ?event,
                panic = %panic_message(panic.as_ref()),
                "Notifier panicked, notification dropped"
            );
        }
    }

    async fn summary(&self, state: &RunState) -> ProgressSummary {
        let total_records = self
            .catalog
            .count_records(self.provider.source())
            .await
            .unwrap_or_else(|e| {
                warn!("Could not count catalog records: {}", e);
                0
            });

        ProgressSummary {
            current_page: state.current_page,
            total_pages: state.total_pages,
            records_synced: state.records_synced,
            requests_used: state.requests_used,
            budget: self.config.request_budget,
            page_size: self.config.page_size,
            total_records,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
