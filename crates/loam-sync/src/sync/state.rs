//! Persistent run state
//!
//! One [`RunState`] row per pipeline, mutated only by the orchestrator:
//!
//! ```text
//! running -> success | failed
//! success -> running | complete
//! failed  -> running
//! complete (terminal)
//! ```
//!
//! A claim may also take over a stale `running` row. A finished invocation
//! that completes the catalog passes through `success` on its way to
//! `complete` before the row is written.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::retry::PendingRetry;
use crate::error::{Result, SyncError};

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Complete,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Complete => "complete",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Running, RunStatus::Success)
                | (RunStatus::Running, RunStatus::Failed)
                | (RunStatus::Success, RunStatus::Running)
                | (RunStatus::Success, RunStatus::Complete)
                | (RunStatus::Failed, RunStatus::Running)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            "complete" => Ok(RunStatus::Complete),
            _ => Err(SyncError::invalid_state(format!("unknown run status {:?}", s))),
        }
    }
}

/// Progress of one logical run, carried across invocations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub pipeline: String,
    pub status: RunStatus,
    /// Last fully committed page (0 before the first page)
    pub current_page: u32,
    pub total_pages: Option<u32>,
    /// Records written by pagination across all invocations
    pub records_synced: u64,
    /// Provider calls made by the latest invocation
    pub requests_used: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Result of trying to claim the pipeline for a new invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The invocation owns the run; `previous` is the row as it was before
    Started {
        state: RunState,
        previous: Option<RunState>,
    },
    AlreadyRunning(RunState),
    AlreadyComplete(RunState),
}

impl RunState {
    /// The state a brand new pipeline starts from
    pub fn fresh(pipeline: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            pipeline: pipeline.into(),
            status: RunStatus::Running,
            current_page: 0,
            total_pages: None,
            records_synced: 0,
            requests_used: 0,
            started_at: Some(now),
            finished_at: None,
            error_message: None,
        }
    }

    /// A `running` row whose invocation started before the cutoff
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.status == RunStatus::Running
            && self
                .started_at
                .map_or(true, |started| started < now - stale_after)
    }

    /// Every known page has been committed
    pub fn at_last_page(&self) -> bool {
        self.total_pages
            .is_some_and(|total| self.current_page >= total)
    }

    /// Move to `next`, refusing moves the state machine does not allow
    pub fn transition(&mut self, next: RunStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(SyncError::invalid_state(format!(
                "run state for {} cannot move from {} to {}",
                self.pipeline, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn pages_remaining(&self) -> Option<u32> {
        self.total_pages
            .map(|total| total.saturating_sub(self.current_page))
    }

    /// Decide whether a new invocation may take over this pipeline
    ///
    /// Pure so that every [`RunStateStore`] applies the same rules; stores
    /// only have to make the read-decide-write step atomic.
    pub fn claim(
        existing: Option<&RunState>,
        pipeline: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Claim {
        let Some(existing) = existing else {
            return Claim::Started {
                state: RunState::fresh(pipeline, now),
                previous: None,
            };
        };

        match existing.status {
            RunStatus::Complete => Claim::AlreadyComplete(existing.clone()),
            RunStatus::Running if !existing.is_stale(now, stale_after) => {
                Claim::AlreadyRunning(existing.clone())
            },
            _ => Claim::Started {
                state: RunState {
                    status: RunStatus::Running,
                    requests_used: 0,
                    started_at: Some(now),
                    finished_at: None,
                    error_message: None,
                    ..existing.clone()
                },
                previous: Some(existing.clone()),
            },
        }
    }
}

/// Persistence for [`RunState`], one row per pipeline
#[async_trait]
pub trait RunStateStore: Send + Sync {
    async fn load(&self, pipeline: &str) -> Result<Option<RunState>>;

    /// Atomically claim the pipeline following [`RunState::claim`]
    async fn try_begin(
        &self,
        pipeline: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Claim>;

    async fn save(&self, state: &RunState) -> Result<()>;

    /// Put the row back as it was before a claim; `None` removes it
    async fn restore(&self, pipeline: &str, snapshot: Option<&RunState>) -> Result<()>;

    async fn pending_retry(&self, pipeline: &str) -> Result<Option<PendingRetry>>;

    /// Replace the pipeline's pending quota retry; `None` clears it
    async fn set_retry(&self, pipeline: &str, retry: Option<&PendingRetry>) -> Result<()>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn state(status: RunStatus, started_hours_ago: i64, now: DateTime<Utc>) -> RunState {
        RunState {
            status,
            current_page: 3,
            total_pages: Some(10),
            records_synced: 90,
            requests_used: 93,
            started_at: Some(now - Duration::hours(started_hours_ago)),
            finished_at: None,
            ..RunState::fresh("perenual_catalog", now)
        }
    }

    #[test]
    fn test_claim_without_row_starts_fresh() {
        let now = Utc::now();
        match RunState::claim(None, "perenual_catalog", now, Duration::hours(2)) {
            Claim::Started { state, previous } => {
                assert_eq!(state.status, RunStatus::Running);
                assert_eq!(state.current_page, 0);
                assert!(previous.is_none());
            },
            other => panic!("unexpected claim: {:?}", other),
        }
    }

    #[test]
    fn test_claim_resumes_from_committed_page() {
        let now = Utc::now();
        let existing = RunState {
            error_message: Some("timeout".into()),
            ..state(RunStatus::Failed, 20, now)
        };

        let Claim::Started { state, previous } =
            RunState::claim(Some(&existing), "perenual_catalog", now, Duration::hours(2))
        else {
            panic!("expected the run to start");
        };

        assert_eq!(state.current_page, 3);
        assert_eq!(state.records_synced, 90);
        assert_eq!(state.requests_used, 0);
        assert_eq!(state.error_message, None);
        assert_eq!(previous, Some(existing));
    }

    #[test]
    fn test_claim_refuses_live_running_row() {
        let now = Utc::now();
        let existing = state(RunStatus::Running, 1, now);
        assert!(matches!(
            RunState::claim(Some(&existing), "perenual_catalog", now, Duration::hours(2)),
            Claim::AlreadyRunning(_)
        ));
    }

    #[test]
    fn test_claim_takes_over_stale_running_row() {
        let now = Utc::now();
        let existing = state(RunStatus::Running, 3, now);
        assert!(matches!(
            RunState::claim(Some(&existing), "perenual_catalog", now, Duration::hours(2)),
            Claim::Started { .. }
        ));
    }

    #[test]
    fn test_complete_is_terminal() {
        let now = Utc::now();
        let existing = state(RunStatus::Complete, 48, now);
        assert!(matches!(
            RunState::claim(Some(&existing), "perenual_catalog", now, Duration::hours(2)),
            Claim::AlreadyComplete(_)
        ));
        for next in [RunStatus::Running, RunStatus::Success, RunStatus::Failed] {
            assert!(!RunStatus::Complete.can_transition_to(next));
        }
    }

    #[test]
    fn test_transition_follows_state_machine() {
        let now = Utc::now();
        let mut s = state(RunStatus::Running, 0, now);

        assert!(s.transition(RunStatus::Complete).is_err());
        assert_eq!(s.status, RunStatus::Running);

        s.transition(RunStatus::Success).unwrap();
        s.transition(RunStatus::Complete).unwrap();
        assert!(s.transition(RunStatus::Failed).is_err());
        assert_eq!(s.status, RunStatus::Complete);
    }

    #[test]
    fn test_pages_remaining() {
        let now = Utc::now();
        let mut s = state(RunStatus::Success, 0, now);
        assert_eq!(s.pages_remaining(), Some(7));
        assert!(!s.at_last_page());

        s.current_page = 10;
        assert!(s.at_last_page());
        assert_eq!(s.pages_remaining(), Some(0));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("complete".parse::<RunStatus>().unwrap(), RunStatus::Complete);
        assert!("paused".parse::<RunStatus>().is_err());
    }
}
