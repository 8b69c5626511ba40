//! Estimate-then-plan flows: the path from tracker beads to persisted
//! batches on a Work.

use crate::fixtures::{bead, blocks, TestHarness};
use braid::core::batch::{BatchKind, BatchStatus};
use braid::error::Error;
use braid::orchestration::{plan, EstimateCache, EstimateOutcome};
use braid::store::Store;
use std::sync::Arc;

#[tokio::test]
async fn test_estimate_plan_attach_flow() {
    let h = TestHarness::new();
    let work = h.lifecycle.create_work("braid/feature", None).unwrap();

    let beads = [bead("a"), bead("b"), bead("c")];
    let relations = [blocks("a", "b"), blocks("b", "c")];
    h.estimator.script("a", 3, 2000);
    h.estimator.script("b", 4, 3000);
    h.estimator.script("c", 2, 1500);

    // First request misses and dispatches; the instant estimator answers
    // within the call, so the cache is warm afterwards.
    let outcome = h.cache.estimate_batch(&work, &beads, false).await.unwrap();
    assert!(matches!(outcome, EstimateOutcome::Spawned(_)));

    let estimates = h.cache.resolve_all(&beads).unwrap();
    let plan = plan(&beads, &relations, &estimates, 120_000).unwrap();
    assert_eq!(plan.batches.len(), 1);
    assert_eq!(plan.batches[0].bead_ids, vec!["a", "b", "c"]);
    assert_eq!(plan.batches[0].tokens, 6500);

    let batches = h.lifecycle.attach_plan(work.id, &plan).unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].kind, BatchKind::Work);
    assert_eq!(batches[0].tokens, 6500);
}

#[tokio::test]
async fn test_second_estimate_round_is_cached() {
    let h = TestHarness::new();
    let work = h.lifecycle.create_work("braid/feature", None).unwrap();
    let beads = [bead("a"), bead("b")];

    h.cache.estimate_batch(&work, &beads, false).await.unwrap();
    let outcome = h.cache.estimate_batch(&work, &beads, false).await.unwrap();

    assert_eq!(outcome, EstimateOutcome::AllCached);
    assert_eq!(
        h.estimator.dispatches.load(std::sync::atomic::Ordering::SeqCst),
        1
    );
}

#[tokio::test]
async fn test_plan_blocked_on_unanswered_estimates() {
    let h = TestHarness::new();
    let work = h.lifecycle.create_work("braid/feature", None).unwrap();
    let beads = [bead("a")];

    // A silent estimator leaves the pending sentinel in the cache.
    let silent = EstimateCache::new(h.store.clone(), Arc::new(crate::fixtures::SilentEstimator));
    silent.estimate_batch(&work, &beads, false).await.unwrap();

    let estimates = silent.resolve_all(&beads).unwrap();
    let err = plan(&beads, &[], &estimates, 120_000).unwrap_err();
    assert!(matches!(err, Error::EstimationPending { bead } if bead == "a"));

    // Once the result lands, planning goes through and the estimate batch
    // that carried the request closes.
    silent.record("a", &beads[0].content_hash(), 3, 3000).unwrap();
    let estimates = silent.resolve_all(&beads).unwrap();
    assert!(plan(&beads, &[], &estimates, 120_000).is_ok());

    let estimate_batches: Vec<_> = h
        .lifecycle
        .list_batches(work.id)
        .unwrap()
        .into_iter()
        .filter(|b| b.kind == BatchKind::Estimate)
        .collect();
    assert!(!estimate_batches.is_empty());
    assert!(estimate_batches
        .iter()
        .all(|b| b.status == BatchStatus::Completed));
}

#[tokio::test]
async fn test_cross_batch_dependencies_persisted() {
    let h = TestHarness::new();
    let work = h.lifecycle.create_work("braid/feature", None).unwrap();
    let beads = [bead("a"), bead("b")];
    let relations = [blocks("a", "b")];
    h.estimator.script("a", 5, 80_000);
    h.estimator.script("b", 5, 80_000);
    h.cache.estimate_batch(&work, &beads, false).await.unwrap();

    let estimates = h.cache.resolve_all(&beads).unwrap();
    let plan = plan(&beads, &relations, &estimates, 120_000).unwrap();
    assert_eq!(plan.batches.len(), 2);
    assert_eq!(plan.deps, vec![(1, 0)]);

    let batches = h.lifecycle.attach_plan(work.id, &plan).unwrap();
    assert_eq!(
        h.store.batch_dependencies(batches[1].id).unwrap(),
        vec![batches[0].id]
    );

    // The dependent batch is not runnable until its dependency completes.
    h.lifecycle.start_work(work.id).unwrap();
    assert_eq!(
        h.lifecycle.next_batch(work.id).unwrap().unwrap().id,
        batches[0].id
    );
}

#[tokio::test]
async fn test_oversized_bead_flagged_in_storage() {
    let h = TestHarness::new();
    let work = h.lifecycle.create_work("braid/feature", None).unwrap();
    let beads = [bead("huge"), bead("tiny")];
    h.estimator.script("huge", 10, 100_000);
    h.estimator.script("tiny", 1, 1000);
    h.cache.estimate_batch(&work, &beads, false).await.unwrap();

    let estimates = h.cache.resolve_all(&beads).unwrap();
    let plan = plan(&beads, &[], &estimates, 50_000).unwrap();
    let batches = h.lifecycle.attach_plan(work.id, &plan).unwrap();

    let oversized: Vec<_> = batches.iter().filter(|b| b.oversized).collect();
    assert_eq!(oversized.len(), 1);
    assert_eq!(oversized[0].bead_ids(), vec!["huge"]);
}

#[tokio::test]
async fn test_cycle_rejected_before_any_persistence() {
    let h = TestHarness::new();
    let work = h.lifecycle.create_work("braid/feature", None).unwrap();
    let beads = [bead("a"), bead("b")];
    let relations = [blocks("a", "b"), blocks("b", "a")];
    h.cache.estimate_batch(&work, &beads, false).await.unwrap();

    let estimates = h.cache.resolve_all(&beads).unwrap();
    let err = plan(&beads, &relations, &estimates, 120_000).unwrap_err();
    assert!(matches!(err, Error::Cycle { .. }));

    // No work batches were created.
    assert!(h.lifecycle.next_batch(work.id).unwrap().is_none());
}

#[tokio::test]
async fn test_estimates_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("braid.db");

    {
        let store = Store::open(&path).unwrap();
        store.put_estimate("a", "hash-a", 5, 8000).unwrap();
    }

    let store = Store::open(&path).unwrap();
    assert_eq!(store.get_estimate("a", "hash-a").unwrap(), Some((5, 8000)));
}
