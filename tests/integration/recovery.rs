//! Failure and recovery: bead-granular retry, Work restart, and session
//! liveness.

use crate::fixtures::{bead, TestHarness};
use braid::core::batch::{BatchStatus, BeadState};
use braid::core::work::WorkStatus;
use braid::orchestration::plan;
use chrono::{Duration, Utc};
use std::sync::atomic::Ordering;

async fn two_bead_work(h: &TestHarness) -> braid::core::work::WorkId {
    let work = h.lifecycle.create_work("braid/fix", None).unwrap();
    let beads = [bead("a"), bead("b")];
    h.cache.estimate_batch(&work, &beads, false).await.unwrap();
    let estimates = h.cache.resolve_all(&beads).unwrap();
    let plan = plan(&beads, &[], &estimates, 120_000).unwrap();
    h.lifecycle.attach_plan(work.id, &plan).unwrap();
    h.lifecycle.start_work(work.id).unwrap();
    h.plane.tick().await.unwrap();
    work.id
}

#[tokio::test]
async fn test_failed_bead_restart_reruns_only_unfinished() {
    let h = TestHarness::new();
    let work_id = two_bead_work(&h).await;
    let batch = h.lifecycle.next_batch(work_id).unwrap().unwrap();

    // The session completes a, then b fails.
    h.lifecycle.start_batch(batch.id).unwrap();
    h.lifecycle.complete_bead(batch.id, "a").unwrap();
    h.lifecycle.fail_bead(batch.id, "b", "tests regressed").unwrap();

    let work = h.lifecycle.get_work(work_id).unwrap();
    assert_eq!(work.status, WorkStatus::Failed);
    assert_eq!(work.last_error.as_deref(), Some("tests regressed"));

    // Failed Works never resume on their own.
    assert!(h.lifecycle.next_batch(work_id).unwrap().is_none());

    h.lifecycle.restart_work(work_id).unwrap();
    h.lifecycle
        .execute_next_batch(work_id, h.executor.as_ref(), h.tracker.as_ref())
        .await
        .unwrap();

    // Only b was re-run; a kept its completed state throughout.
    assert_eq!(*h.executor.runs.lock().unwrap(), vec![vec!["b"]]);
    assert_eq!(h.lifecycle.get_work(work_id).unwrap().status, WorkStatus::Idle);
}

#[tokio::test]
async fn test_session_crash_reported_without_bead() {
    let h = TestHarness::new();
    let work_id = two_bead_work(&h).await;
    let batch = h.lifecycle.next_batch(work_id).unwrap().unwrap();
    h.lifecycle.start_batch(batch.id).unwrap();

    h.lifecycle
        .report_batch_failure(batch.id, "session terminated unexpectedly")
        .unwrap();

    let batch = h.lifecycle.get_batch(batch.id).unwrap();
    assert_eq!(batch.status, BatchStatus::Failed);
    // No bead was singled out; all members are still due after reset.
    assert_eq!(batch.member_state("a"), Some(BeadState::Pending));
    assert_eq!(batch.member_state("b"), Some(BeadState::Pending));

    h.lifecycle.restart_work(work_id).unwrap();
    h.lifecycle
        .execute_next_batch(work_id, h.executor.as_ref(), h.tracker.as_ref())
        .await
        .unwrap();
    assert_eq!(*h.executor.runs.lock().unwrap(), vec![vec!["a", "b"]]);
}

#[tokio::test]
async fn test_executor_failure_path_end_to_end() {
    let h = TestHarness::new();
    let work_id = two_bead_work(&h).await;
    h.executor.fail_on("b");

    h.lifecycle
        .execute_next_batch(work_id, h.executor.as_ref(), h.tracker.as_ref())
        .await
        .unwrap();
    assert_eq!(h.lifecycle.get_work(work_id).unwrap().status, WorkStatus::Failed);

    h.executor.heal();
    h.lifecycle.restart_work(work_id).unwrap();
    h.lifecycle
        .execute_next_batch(work_id, h.executor.as_ref(), h.tracker.as_ref())
        .await
        .unwrap();

    assert_eq!(h.lifecycle.get_work(work_id).unwrap().status, WorkStatus::Idle);
    h.lifecycle.finalize_work(work_id).unwrap();
    assert_eq!(
        h.lifecycle.get_work(work_id).unwrap().status,
        WorkStatus::Completed
    );
}

#[tokio::test]
async fn test_restart_schedules_fresh_session() {
    let h = TestHarness::new();
    let work_id = two_bead_work(&h).await;
    let spawns_before = h.sessions.spawns.load(Ordering::SeqCst);
    h.executor.fail_on("a");
    h.lifecycle
        .execute_next_batch(work_id, h.executor.as_ref(), h.tracker.as_ref())
        .await
        .unwrap();

    h.lifecycle.restart_work(work_id).unwrap();
    h.plane.tick().await.unwrap();

    assert!(h.sessions.spawns.load(Ordering::SeqCst) > spawns_before);
}

#[tokio::test]
async fn test_stale_session_recycled_by_sweep() {
    let h = TestHarness::new();
    let work_id = two_bead_work(&h).await;
    assert!(h.sessions.alive.load(Ordering::SeqCst));

    // The orchestrator goes quiet well past the staleness threshold.
    let stale = Utc::now() - Duration::seconds(h.config.heartbeat_staleness_secs * 4);
    h.store.record_heartbeat(work_id, stale).unwrap();

    h.plane.tick().await.unwrap();

    assert_eq!(h.sessions.stops.load(Ordering::SeqCst), 1);
    assert_eq!(h.sessions.spawns.load(Ordering::SeqCst), 2);

    // The replacement session stays up on later passes even though it has
    // not heartbeated yet.
    h.plane.tick().await.unwrap();
    h.plane.tick().await.unwrap();
    assert_eq!(h.sessions.stops.load(Ordering::SeqCst), 1);
    assert_eq!(h.sessions.spawns.load(Ordering::SeqCst), 2);
    assert!(h.sessions.alive.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_live_heartbeat_left_alone() {
    let h = TestHarness::new();
    let work_id = two_bead_work(&h).await;
    h.lifecycle.record_heartbeat(work_id).unwrap();

    h.plane.tick().await.unwrap();
    assert_eq!(h.sessions.stops.load(Ordering::SeqCst), 0);
}
