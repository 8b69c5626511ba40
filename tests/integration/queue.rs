//! Scheduled task queue behavior: idempotency, retry with backoff,
//! permanent failure surfacing, and durability across reopen.

use crate::fixtures::TestHarness;
use braid::config::Config;
use braid::core::queue::{EntryStatus, ScheduledTask, SideEffectKind};
use braid::core::work::WorkStatus;
use braid::store::Store;
use chrono::Utc;
use std::sync::atomic::Ordering;

#[tokio::test]
async fn test_infrastructure_scheduled_once_across_paths() {
    let h = TestHarness::new();
    let work = h.lifecycle.create_work("braid/feature", None).unwrap();

    // Both the estimate flow and start_work want provisioning; the
    // idempotency key collapses them into one entry each.
    h.cache
        .estimate_batch(&work, &[crate::fixtures::bead("a")], false)
        .await
        .unwrap();
    h.lifecycle.start_work(work.id).unwrap();

    let tasks = h.store.tasks_for_work(work.id).unwrap();
    let provisions = tasks
        .iter()
        .filter(|t| t.kind == SideEffectKind::ProvisionWorkspace)
        .count();
    let spawns = tasks
        .iter()
        .filter(|t| t.kind == SideEffectKind::SpawnOrchestrator)
        .count();
    assert_eq!(provisions, 1);
    assert_eq!(spawns, 1);
}

#[tokio::test]
async fn test_retry_until_success() {
    // Zero backoff so the retried entry is immediately due again.
    let config = Config {
        backoff_base_secs: 0,
        ..Config::default()
    };
    let h = TestHarness::with(config, 2);
    let work = h.lifecycle.create_work("braid/feature", None).unwrap();
    h.lifecycle.start_work(work.id).unwrap();

    h.plane.tick().await.unwrap(); // fails, attempt 1
    h.plane.tick().await.unwrap(); // fails, attempt 2
    h.plane.tick().await.unwrap(); // succeeds

    assert_eq!(h.provisioner.calls.load(Ordering::SeqCst), 3);
    let work = h.lifecycle.get_work(work.id).unwrap();
    assert!(work.workspace_path.is_some());
    assert_eq!(work.status, WorkStatus::Processing);
}

#[tokio::test]
async fn test_backoff_delays_next_attempt() {
    let h = TestHarness::with(Config::default(), 5);
    let work = h.lifecycle.create_work("braid/feature", None).unwrap();
    h.lifecycle.start_work(work.id).unwrap();

    h.plane.tick().await.unwrap();
    h.plane.tick().await.unwrap();

    // The second pass found nothing due: only one provision attempt ran.
    assert_eq!(h.provisioner.calls.load(Ordering::SeqCst), 1);
    let provision = h
        .store
        .tasks_for_work(work.id)
        .unwrap()
        .into_iter()
        .find(|t| t.kind == SideEffectKind::ProvisionWorkspace)
        .unwrap();
    assert_eq!(provision.status, EntryStatus::Pending);
    assert!(provision.run_at > Utc::now());
}

#[tokio::test]
async fn test_exhausted_entry_fails_work() {
    let config = Config {
        backoff_base_secs: 0,
        max_attempts: 2,
        ..Config::default()
    };
    let h = TestHarness::with(config, 99);
    let work = h.lifecycle.create_work("braid/feature", None).unwrap();
    h.lifecycle.start_work(work.id).unwrap();

    h.plane.tick().await.unwrap();
    h.plane.tick().await.unwrap();

    let provision = h
        .store
        .tasks_for_work(work.id)
        .unwrap()
        .into_iter()
        .find(|t| t.kind == SideEffectKind::ProvisionWorkspace)
        .unwrap();
    assert_eq!(provision.status, EntryStatus::Failed);
    assert_eq!(provision.attempts, 2);

    let work = h.lifecycle.get_work(work.id).unwrap();
    assert_eq!(work.status, WorkStatus::Failed);
    assert_eq!(work.last_error.as_deref(), Some("Execution failed: no capacity"));

    // A restart clears the error and lets operations continue.
    h.lifecycle.restart_work(work.id).unwrap();
    assert_eq!(h.lifecycle.get_work(work.id).unwrap().status, WorkStatus::Processing);
}

#[tokio::test]
async fn test_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("braid.db");
    let work_id;

    {
        let h = TestHarness::over(Store::open(&path).unwrap(), Config::default(), 0);
        let work = h.lifecycle.create_work("braid/feature", None).unwrap();
        h.lifecycle.start_work(work.id).unwrap();
        work_id = work.id;
        // Dropped without ever running the control plane.
    }

    let h = TestHarness::over(Store::open(&path).unwrap(), Config::default(), 0);
    let due = h.store.due_tasks(Utc::now()).unwrap();
    assert_eq!(due.len(), 2);

    // The reopened control plane picks the entries up and finishes them.
    h.plane.tick().await.unwrap();
    assert!(h.lifecycle.get_work(work_id).unwrap().workspace_path.is_some());
}

#[tokio::test]
async fn test_completed_entry_never_rerun() {
    let h = TestHarness::new();
    let work = h.lifecycle.create_work("braid/feature", None).unwrap();
    h.lifecycle.start_work(work.id).unwrap();

    h.plane.tick().await.unwrap();
    h.plane.tick().await.unwrap();

    assert_eq!(h.provisioner.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.sessions.spawns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_feedback_poll_chain() {
    let h = TestHarness::new();
    let work = h.lifecycle.create_work("braid/feature", None).unwrap();
    h.store
        .schedule_task(&ScheduledTask::new(work.id, SideEffectKind::PollFeedback, "poll"))
        .unwrap();

    // Empty poll reschedules itself for later.
    h.plane.tick().await.unwrap();
    let polls: Vec<_> = h
        .store
        .tasks_for_work(work.id)
        .unwrap()
        .into_iter()
        .filter(|t| t.kind == SideEffectKind::PollFeedback)
        .collect();
    assert_eq!(polls.len(), 2);
    assert!(polls.iter().any(|t| t.status == EntryStatus::Pending));
}
