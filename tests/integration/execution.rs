//! Happy-path execution: a Work from creation through provisioning, batch
//! execution, idle, and finalization.

use crate::fixtures::{bead, blocks, TestHarness};
use braid::core::work::WorkStatus;
use braid::orchestration::plan;
use std::sync::atomic::Ordering;

/// Run the estimate/plan/attach preamble and return the harness plus the
/// started Work's id.
async fn planned_work(h: &TestHarness) -> braid::core::work::WorkId {
    let work = h.lifecycle.create_work("braid/feature", Some("bd-root")).unwrap();
    let beads = [bead("a"), bead("b"), bead("c")];
    let relations = [blocks("a", "b")];
    h.estimator.script("a", 5, 60_000);
    h.estimator.script("b", 5, 70_000);
    h.estimator.script("c", 2, 10_000);
    h.cache.estimate_batch(&work, &beads, false).await.unwrap();

    let estimates = h.cache.resolve_all(&beads).unwrap();
    let plan = plan(&beads, &relations, &estimates, 120_000).unwrap();
    h.lifecycle.attach_plan(work.id, &plan).unwrap();
    h.lifecycle.start_work(work.id).unwrap();
    work.id
}

#[tokio::test]
async fn test_full_happy_path() {
    let h = TestHarness::new();
    let work_id = planned_work(&h).await;

    // The control plane provisions the workspace and spawns the session.
    h.plane.tick().await.unwrap();
    let work = h.lifecycle.get_work(work_id).unwrap();
    assert!(work.workspace_path.is_some());
    assert_eq!(h.sessions.spawns.load(Ordering::SeqCst), 1);

    // The session drains the batch line.
    while h
        .lifecycle
        .execute_next_batch(work_id, h.executor.as_ref(), h.tracker.as_ref())
        .await
        .unwrap()
        .is_some()
    {}

    let work = h.lifecycle.get_work(work_id).unwrap();
    assert_eq!(work.status, WorkStatus::Idle);
    for batch in h.lifecycle.list_batches(work_id).unwrap() {
        if batch.kind == braid::core::batch::BatchKind::Work {
            assert!(batch.all_beads_completed());
        }
    }

    // Finalize tears the workspace down and stops the session.
    h.lifecycle.finalize_work(work_id).unwrap();
    h.plane.tick().await.unwrap();

    assert_eq!(h.lifecycle.get_work(work_id).unwrap().status, WorkStatus::Completed);
    assert_eq!(h.provisioner.teardowns.load(Ordering::SeqCst), 1);
    assert_eq!(h.sessions.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_batches_run_in_dependency_order() {
    let h = TestHarness::new();
    let work_id = planned_work(&h).await;
    h.plane.tick().await.unwrap();

    while h
        .lifecycle
        .execute_next_batch(work_id, h.executor.as_ref(), h.tracker.as_ref())
        .await
        .unwrap()
        .is_some()
    {}

    let runs = h.executor.runs.lock().unwrap();
    let position = |bead: &str| {
        runs.iter()
            .position(|batch| batch.iter().any(|b| b == bead))
            .unwrap()
    };
    // a precedes b across the whole run.
    assert!(position("a") <= position("b"));
}

#[tokio::test]
async fn test_idle_work_accepts_more_batches() {
    let h = TestHarness::new();
    let work_id = planned_work(&h).await;
    h.plane.tick().await.unwrap();
    while h
        .lifecycle
        .execute_next_batch(work_id, h.executor.as_ref(), h.tracker.as_ref())
        .await
        .unwrap()
        .is_some()
    {}
    assert_eq!(h.lifecycle.get_work(work_id).unwrap().status, WorkStatus::Idle);

    // Follow-up beads arrive (review feedback, new scope).
    let work = h.lifecycle.get_work(work_id).unwrap();
    let more = [bead("d")];
    h.cache.estimate_batch(&work, &more, false).await.unwrap();
    let estimates = h.cache.resolve_all(&more).unwrap();
    let plan = plan(&more, &[], &estimates, 120_000).unwrap();
    h.lifecycle.attach_plan(work_id, &plan).unwrap();

    assert_eq!(h.lifecycle.get_work(work_id).unwrap().status, WorkStatus::Processing);
    h.lifecycle
        .execute_next_batch(work_id, h.executor.as_ref(), h.tracker.as_ref())
        .await
        .unwrap();
    assert_eq!(h.lifecycle.get_work(work_id).unwrap().status, WorkStatus::Idle);
}

#[tokio::test]
async fn test_executed_beads_closed_in_tracker() {
    let h = TestHarness::new();
    let beads = [bead("a"), bead("b"), bead("c")];
    h.tracker.seed(&beads, &[blocks("a", "b")]);
    let work_id = planned_work(&h).await;
    h.plane.tick().await.unwrap();

    while h
        .lifecycle
        .execute_next_batch(work_id, h.executor.as_ref(), h.tracker.as_ref())
        .await
        .unwrap()
        .is_some()
    {}

    for b in &beads {
        assert_eq!(
            h.tracker.status_of(&b.id),
            Some(braid::core::bead::BeadStatus::Closed)
        );
    }
}

#[tokio::test]
async fn test_merged_work_tears_down() {
    let h = TestHarness::new();
    let work_id = planned_work(&h).await;
    h.plane.tick().await.unwrap();

    h.lifecycle.mark_merged(work_id).unwrap();
    h.plane.tick().await.unwrap();

    assert_eq!(h.lifecycle.get_work(work_id).unwrap().status, WorkStatus::Merged);
    assert_eq!(h.provisioner.teardowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_sync_remote_pushes_branch() {
    let h = TestHarness::new();
    let work_id = planned_work(&h).await;
    h.store
        .schedule_task(&braid::core::queue::ScheduledTask::new(
            work_id,
            braid::core::queue::SideEffectKind::SyncRemote,
            "sync",
        ))
        .unwrap();

    h.plane.tick().await.unwrap();
    assert_eq!(h.remote.pushes.load(Ordering::SeqCst), 1);
}
