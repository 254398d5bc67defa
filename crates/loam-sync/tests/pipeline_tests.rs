//! End-to-end pipeline tests over the in-memory store
//!
//! Every test drives [`CatalogSync::run`] the way the scheduler, CLI and ops
//! router do, against a scripted provider whose calls are counted.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use chrono::{Duration, Utc};
use common::{sync_config, Harness, PIPELINE, SOURCE};
use loam_sync::catalog::{CatalogRecord, CatalogStore};
use loam_sync::config::SyncConfig;
use loam_sync::notify::SyncEvent;
use loam_sync::sync::{
    PendingRetry, RunOutcome, RunState, RunStateStore, RunStatus, SkipReason, Trigger,
};

async fn mark_incomplete(h: &Harness, ids: impl IntoIterator<Item = u32>) {
    for id in ids {
        h.store
            .upsert(&CatalogRecord::new(SOURCE, id.to_string()))
            .await
            .unwrap();
    }
}

// ============================================================================
// Daily progression
// ============================================================================

#[tokio::test]
async fn test_catalog_seeds_over_several_days() {
    let h = Harness::new(10, 30, 95);

    // Day 1: three whole pages, remainder of two calls left unused
    let day1 = h.finish(Trigger::Scheduled).await;
    assert_eq!(day1.requests_used, 93);
    assert_eq!(day1.pages_committed, 3);
    assert_eq!(day1.records_written, 90);
    assert_eq!(day1.status, RunStatus::Success);
    assert!(day1.budget_exhausted);
    let after_day1 = h.state().await;
    assert_eq!(after_day1.current_page, 3);
    assert_eq!(after_day1.records_synced, 90);
    assert_eq!(after_day1.total_pages, Some(10));
    assert_eq!(h.notifier.events(), vec![SyncEvent::BudgetReached]);

    // Day 2: quota has not reset, first call rejected
    h.provider.reject_next_calls(1);
    let (outcome, calls) = h.run(Trigger::Scheduled).await;
    assert_eq!(calls, 1);
    match outcome {
        RunOutcome::QuotaNotReset { attempt, retry_at } => {
            assert_eq!(attempt, 1);
            assert!(retry_at.is_some());
        },
        other => panic!("expected quota not reset, got {:?}", other),
    }
    assert_eq!(h.state().await, after_day1);
    assert_eq!(h.notifier.events().last(), Some(&SyncEvent::QuotaNotReset));

    // An upstream defect blanks five page 1 rows before the retry
    mark_incomplete(&h, 1..=5).await;

    // Retry: backfill first, then as many pages as the rest of the budget covers
    let detail_calls_before = h.provider.detail_calls().len();
    let retry = h.finish(Trigger::QuotaRetry { attempt: 1 }).await;
    assert_eq!(retry.backfill_candidates, 5);
    assert_eq!(retry.records_repaired, 5);
    assert_eq!(retry.pages_committed, 2);
    assert_eq!(retry.requests_used, 5 + 2 * 31);
    assert_eq!(retry.current_page, 5);
    assert_eq!(retry.status, RunStatus::Success);
    assert_eq!(
        h.provider.detail_calls()[detail_calls_before..detail_calls_before + 5],
        ["1", "2", "3", "4", "5"]
    );
    assert_eq!(h.store.count_incomplete(SOURCE).await.unwrap(), 0);

    // Day 3: pages 6 to 8
    let day3 = h.finish(Trigger::Scheduled).await;
    assert_eq!(day3.current_page, 8);
    assert_eq!(day3.requests_used, 93);

    // Day 4: pages 9 and 10, then complete
    h.notifier.clear();
    let day4 = h.finish(Trigger::Scheduled).await;
    assert_eq!(day4.pages_committed, 2);
    assert_eq!(day4.requests_used, 62);
    assert!(!day4.budget_exhausted);
    assert_eq!(day4.status, RunStatus::Complete);
    assert_eq!(h.notifier.events(), vec![SyncEvent::CatalogSeeded]);

    let done = h.state().await;
    assert_eq!(done.status, RunStatus::Complete);
    assert_eq!(done.current_page, 10);
    assert_eq!(done.records_synced, 300);
    assert!(done.finished_at.is_some());
    assert_eq!(h.store.count_records(SOURCE).await.unwrap(), 300);

    // Day 5: nothing to do
    h.notifier.clear();
    let (outcome, calls) = h.run(Trigger::Scheduled).await;
    assert_eq!(calls, 0);
    assert_eq!(
        outcome,
        RunOutcome::Skipped {
            reason: SkipReason::AlreadyComplete
        }
    );
    assert!(h.notifier.events().is_empty());
}

#[tokio::test]
async fn test_budget_smaller_than_a_page_makes_no_calls() {
    let h = Harness::new(3, 30, 20);

    let report = h.finish(Trigger::Manual).await;

    assert_eq!(report.requests_used, 0);
    assert_eq!(report.current_page, 0);
    assert!(report.budget_exhausted);
    assert_eq!(h.provider.calls(), 0);
    assert_eq!(h.state().await.status, RunStatus::Success);
}

#[tokio::test]
async fn test_backfill_can_consume_the_whole_budget() {
    let h = Harness::new(10, 30, 95);
    mark_incomplete(&h, 1..=120).await;

    let report = h.finish(Trigger::Scheduled).await;

    // Sweep is capped at the batch size, budget at 95
    assert_eq!(report.backfill_candidates, 100);
    assert_eq!(report.records_repaired, 95);
    assert_eq!(report.requests_used, 95);
    assert_eq!(report.pages_committed, 0);
    assert!(report.budget_exhausted);
    assert_eq!(h.provider.calls(), 95);
    assert!(h.provider.list_calls().is_empty());
    assert_eq!(h.store.count_incomplete(SOURCE).await.unwrap(), 25);
    assert_eq!(h.notifier.events(), vec![SyncEvent::BudgetReached]);
}

// ============================================================================
// Completion
// ============================================================================

#[tokio::test]
async fn test_last_page_with_gaps_is_not_complete() {
    let h = Harness::new(2, 5, 95);
    h.provider.set_incomplete("3");

    let first = h.finish(Trigger::Manual).await;
    assert_eq!(first.current_page, 2);
    assert_eq!(first.incomplete_remaining, 1);
    assert_eq!(first.status, RunStatus::Success);
    assert!(!first.budget_exhausted);
    assert!(h.notifier.events().is_empty());

    // Gap repaired, but this sweep found a candidate
    h.provider.set_complete("3");
    let second = h.finish(Trigger::Manual).await;
    assert_eq!(second.backfill_candidates, 1);
    assert_eq!(second.records_repaired, 1);
    assert_eq!(second.requests_used, 1);
    assert_eq!(second.status, RunStatus::Success);

    // Clean sweep at the last page
    let third = h.finish(Trigger::Manual).await;
    assert_eq!(third.requests_used, 0);
    assert_eq!(third.status, RunStatus::Complete);
    assert_eq!(h.notifier.events(), vec![SyncEvent::CatalogSeeded]);
}

#[tokio::test]
async fn test_persistent_defect_never_completes() {
    let h = Harness::new(1, 5, 95);
    h.provider.set_incomplete("4");

    for _ in 0..3 {
        let report = h.finish(Trigger::Scheduled).await;
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.incomplete_remaining, 1);
    }

    // One detail call per later invocation, no list calls after the first
    assert_eq!(h.provider.list_calls(), vec![1]);
    assert_eq!(h.provider.calls(), 6 + 1 + 1);
    assert!(!h.notifier.events().contains(&SyncEvent::CatalogSeeded));
}

#[tokio::test]
async fn test_empty_page_before_the_end_does_not_complete() {
    let h = Harness::new(3, 5, 95);
    h.provider.blank_page(2);

    let (outcome, _) = h.run(Trigger::Scheduled).await;
    match outcome {
        RunOutcome::Failed { error } => assert!(error.contains("no usable items")),
        other => panic!("expected failure, got {:?}", other),
    }

    let state = h.state().await;
    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.current_page, 1);
    assert_eq!(state.total_pages, Some(3));

    // Still open: the next invocation lists page 2 again
    let (again, calls) = h.run(Trigger::Scheduled).await;
    assert!(matches!(again, RunOutcome::Failed { .. }));
    assert_eq!(calls, 1);
    assert_eq!(h.provider.list_calls(), vec![1, 2, 2]);
    assert!(!h.notifier.events().contains(&SyncEvent::CatalogSeeded));
}

// ============================================================================
// Resume safety
// ============================================================================

#[tokio::test]
async fn test_quota_mid_page_resumes_from_uncommitted_page() {
    let h = Harness::new(10, 30, 95);
    // Page 1 takes calls 1..=31, page 2 is cut off after seven details
    h.provider.reject_from_call(40);

    let first = h.finish(Trigger::Scheduled).await;
    assert_eq!(first.requests_used, 40);
    assert_eq!(first.current_page, 1);
    assert_eq!(first.status, RunStatus::Success);
    assert!(first.budget_exhausted);
    assert_eq!(h.state().await.records_synced, 30);
    assert_eq!(h.store.count_records(SOURCE).await.unwrap(), 37);
    assert_eq!(h.notifier.events(), vec![SyncEvent::BudgetReached]);

    h.provider.reset_quota();
    let second = h.finish(Trigger::Scheduled).await;
    assert_eq!(second.current_page, 4);
    assert_eq!(second.requests_used, 93);

    // Page 2 was listed twice and its early items written twice, never duplicated
    assert_eq!(h.provider.list_calls(), vec![1, 2, 2, 3, 4]);
    assert_eq!(h.store.write_count(SOURCE, "31").await, 2);
    assert_eq!(h.store.write_count(SOURCE, "40").await, 1);
    assert_eq!(h.store.count_records(SOURCE).await.unwrap(), 120);
    assert_eq!(h.state().await.records_synced, 120);
}

#[tokio::test]
async fn test_transport_failure_marks_failed_then_resumes() {
    let h = Harness::new(10, 30, 95);
    h.provider.fail_detail("35");

    let (outcome, calls) = h.run(Trigger::Scheduled).await;
    assert!(matches!(outcome, RunOutcome::Failed { .. }));
    assert_eq!(calls, 31 + 1 + 5);

    let failed = h.state().await;
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(failed.current_page, 1);
    assert_eq!(failed.requests_used, 37);
    assert!(failed.error_message.as_deref().unwrap().contains("500"));
    assert_eq!(h.notifier.events(), vec![SyncEvent::UnexpectedError]);

    h.provider.clear_failures();
    let resumed = h.finish(Trigger::Scheduled).await;
    assert_eq!(resumed.current_page, 4);
    assert_eq!(h.state().await.error_message, None);
}

#[tokio::test]
async fn test_panic_is_recorded_as_failure() {
    let h = Harness::new(2, 5, 95);
    h.provider.panic_on_detail("2");

    let (outcome, _) = h.run(Trigger::Manual).await;
    match outcome {
        RunOutcome::Failed { error } => assert!(error.contains("scripted panic for 2")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(h.state().await.status, RunStatus::Failed);
    assert_eq!(h.notifier.events(), vec![SyncEvent::UnexpectedError]);

    // The run is not left claimed
    h.provider.clear_failures();
    let report = h.finish(Trigger::Manual).await;
    assert_eq!(report.status, RunStatus::Complete);
}

#[tokio::test]
async fn test_panicking_notifier_does_not_strand_the_run() {
    let h = Harness::new(10, 30, 95);
    h.notifier.panic_on(SyncEvent::BudgetReached);

    let report = h.finish(Trigger::Scheduled).await;

    assert_eq!(report.current_page, 3);
    let state = h.state().await;
    assert_eq!(state.status, RunStatus::Success);
    assert!(state.finished_at.is_some());
    assert_eq!(h.notifier.events(), vec![SyncEvent::BudgetReached]);

    // Not left running, so the next invocation is not skipped
    let next = h.finish(Trigger::Scheduled).await;
    assert_eq!(next.current_page, 6);
}

#[tokio::test]
async fn test_panicking_error_notifier_still_reports_failure() {
    let h = Harness::new(2, 5, 95);
    h.provider.fail_detail("2");
    h.notifier.panic_on(SyncEvent::UnexpectedError);

    let (outcome, _) = h.run(Trigger::Manual).await;

    assert!(matches!(outcome, RunOutcome::Failed { .. }));
    assert_eq!(h.state().await.status, RunStatus::Failed);
}

// ============================================================================
// Quota retries
// ============================================================================

#[tokio::test]
async fn test_quota_on_first_ever_call_leaves_no_run_state() {
    let h = Harness::new(3, 5, 95);
    h.provider.reject_next_calls(1);

    let (outcome, calls) = h.run(Trigger::Scheduled).await;

    assert_eq!(calls, 1);
    assert!(matches!(outcome, RunOutcome::QuotaNotReset { attempt: 1, .. }));
    assert_eq!(h.store.load(PIPELINE).await.unwrap(), None);
    let details = h.notifier.details(SyncEvent::QuotaNotReset);
    assert_eq!(details.len(), 1);
    assert!(details[0].contains("Retry 1 scheduled"));

    // The retry outlives this process's memory of it
    let RunOutcome::QuotaNotReset {
        retry_at: Some(at), ..
    } = outcome
    else {
        unreachable!()
    };
    assert_eq!(h.pending_retry().await, Some(PendingRetry { attempt: 1, at }));
}

#[tokio::test]
async fn test_finished_run_drops_pending_retry() {
    let h = Harness::new(3, 5, 95);
    h.provider.reject_next_calls(1);
    h.run(Trigger::Scheduled).await;
    assert!(h.pending_retry().await.is_some());

    let report = h.finish(Trigger::Manual).await;

    assert_eq!(report.status, RunStatus::Complete);
    assert_eq!(h.pending_retry().await, None);
}

#[tokio::test]
async fn test_no_retry_promised_when_schedule_disabled() {
    let h = Harness::with_config(
        3,
        SyncConfig {
            enabled: false,
            ..sync_config(95, 5)
        },
    );
    h.provider.reject_next_calls(1);

    let (outcome, _) = h.run(Trigger::Manual).await;

    assert_eq!(
        outcome,
        RunOutcome::QuotaNotReset {
            attempt: 1,
            retry_at: None
        }
    );
    assert_eq!(h.pending_retry().await, None);
    let details = h.notifier.details(SyncEvent::QuotaNotReset);
    assert!(!details[0].contains("scheduled for"));
    assert!(details[0].contains("no retry was scheduled"));
}

#[tokio::test]
async fn test_quota_retries_run_out_after_last_slot() {
    let h = Harness::new(3, 5, 95);
    h.provider.reject_next_calls(4);

    let (first, _) = h.run(Trigger::Scheduled).await;
    assert!(matches!(first, RunOutcome::QuotaNotReset { attempt: 1, retry_at: Some(_) }));

    for attempt in 1..=2 {
        let (outcome, _) = h.run(Trigger::QuotaRetry { attempt }).await;
        assert!(matches!(
            outcome,
            RunOutcome::QuotaNotReset { attempt: next, retry_at: Some(_) } if next == attempt + 1
        ));
    }

    let (last, _) = h.run(Trigger::QuotaRetry { attempt: 3 }).await;
    assert_eq!(
        last,
        RunOutcome::QuotaNotReset {
            attempt: 4,
            retry_at: None
        }
    );
    assert_eq!(h.notifier.events(), vec![SyncEvent::QuotaNotReset; 4]);
    assert_eq!(h.pending_retry().await, None);
}

// ============================================================================
// Concurrency guard
// ============================================================================

#[tokio::test]
async fn test_running_invocation_blocks_another() {
    let h = Harness::new(3, 5, 95);
    h.store
        .put_run(RunState::fresh(PIPELINE, Utc::now() - Duration::minutes(10)))
        .await;

    let (outcome, calls) = h.run(Trigger::Manual).await;

    assert_eq!(calls, 0);
    assert_eq!(
        outcome,
        RunOutcome::Skipped {
            reason: SkipReason::AlreadyRunning
        }
    );
}

#[tokio::test]
async fn test_stale_running_invocation_is_taken_over() {
    let h = Harness::new(3, 5, 95);
    let crashed = RunState {
        current_page: 1,
        records_synced: 5,
        ..RunState::fresh(PIPELINE, Utc::now() - Duration::hours(3))
    };
    h.store.put_run(crashed).await;

    let report = h.finish(Trigger::Scheduled).await;

    assert_eq!(report.status, RunStatus::Complete);
    assert_eq!(h.provider.list_calls(), vec![2, 3]);
    assert_eq!(h.state().await.records_synced, 15);
}
