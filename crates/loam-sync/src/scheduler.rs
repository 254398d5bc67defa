//! Sync scheduler
//!
//! Runs the daily invocation at `CATALOG_SYNC_CRON_HOUR_UTC` and the one-off
//! quota retry stored by the orchestrator. Retries live in the run state
//! store, so one stored by `loam-sync run`, by another worker or before a
//! restart is picked up on the next poll. Manual triggers go through a
//! [`SchedulerHandle`] so the loop notices a new retry straight away.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::sync::retry::next_at_hour;
use crate::sync::{CatalogSync, PendingRetry, RunOutcome, Trigger};

/// How often the store is checked for retries stored elsewhere
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);

/// Cheap clonable entry point for triggering invocations
#[derive(Clone)]
pub struct SchedulerHandle {
    sync: Arc<CatalogSync>,
    wake: Arc<Notify>,
}

impl SchedulerHandle {
    pub fn sync(&self) -> &Arc<CatalogSync> {
        &self.sync
    }

    /// Run one invocation and wake the scheduler if it stored a retry
    pub async fn run(&self, trigger: Trigger) -> RunOutcome {
        let outcome = self.sync.run(trigger).await;

        if matches!(
            outcome,
            RunOutcome::QuotaNotReset {
                retry_at: Some(_),
                ..
            }
        ) {
            self.wake.notify_one();
        }

        outcome
    }
}

/// Daily scheduler
pub struct SyncScheduler {
    handle: SchedulerHandle,
    cron_hour_utc: u32,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl SyncScheduler {
    pub fn new(sync: Arc<CatalogSync>, shutdown: CancellationToken) -> Self {
        let cron_hour_utc = sync.config().cron_hour_utc;

        Self {
            handle: SchedulerHandle {
                sync,
                wake: Arc::new(Notify::new()),
            },
            cron_hour_utc,
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Start the scheduler in background
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run_loop())
    }

    async fn run_loop(self) {
        info!(cron_hour_utc = self.cron_hour_utc, "Sync scheduler started");
        let sync = self.handle.sync().clone();

        loop {
            let pending = match sync.pending_retry().await {
                Ok(pending) => pending,
                Err(e) => {
                    warn!("Could not read pending quota retry: {}", e);
                    None
                },
            };

            let now = Utc::now();
            let (wake_at, trigger) = next_wake(now, self.cron_hour_utc, pending);
            let until_wake = (wake_at - now).to_std().unwrap_or_default();
            let due = until_wake <= self.poll_interval;
            debug!(%wake_at, %trigger, "Next sync invocation scheduled");

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.handle.wake.notified() => continue,
                _ = tokio::time::sleep(until_wake.min(self.poll_interval)) => {
                    if !due || Utc::now() < wake_at {
                        continue;
                    }

                    // Taken before running: the daily run supersedes it, and
                    // a retry that is skipped or fails must not fire again
                    if pending.is_some() {
                        if let Err(e) = sync.clear_retry().await {
                            warn!("Could not clear pending quota retry: {}", e);
                        }
                    }

                    info!(%trigger, "Starting scheduled invocation");
                    let outcome = self.handle.run(trigger).await;
                    info!(?outcome, "Scheduled invocation finished");
                },
            }
        }

        info!("Sync scheduler stopped");
    }
}

/// Pick the earlier of the next daily run and a pending retry
pub fn next_wake(
    now: DateTime<Utc>,
    cron_hour_utc: u32,
    pending: Option<PendingRetry>,
) -> (DateTime<Utc>, Trigger) {
    let daily = next_at_hour(now, cron_hour_utc).unwrap_or(now + chrono::Duration::days(1));

    match pending {
        Some(retry) if retry.at < daily => (
            retry.at,
            Trigger::QuotaRetry {
                attempt: retry.attempt,
            },
        ),
        _ => (daily, Trigger::Scheduled),
    }
}
