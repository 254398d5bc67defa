//! Quota retry schedule (UTC wall clock)

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A quota retry waiting for its slot, persisted next to the run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRetry {
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

/// The next time strictly after `now` that falls on `hour`:00 UTC
pub fn next_at_hour(now: DateTime<Utc>, hour: u32) -> Option<DateTime<Utc>> {
    let candidate = now.date_naive().and_hms_opt(hour, 0, 0)?.and_utc();
    Some(if candidate <= now {
        candidate + Duration::days(1)
    } else {
        candidate
    })
}

/// When quota retry `attempt` (1-based) should run, if one is left
pub fn retry_at(now: DateTime<Utc>, retry_hours: &[u32], attempt: u32) -> Option<DateTime<Utc>> {
    let index = usize::try_from(attempt.checked_sub(1)?).ok()?;
    next_at_hour(now, *retry_hours.get(index)?)
}
