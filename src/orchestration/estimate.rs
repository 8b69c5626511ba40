//! Estimation cache: persisted per-bead cost estimates keyed by content
//! hash, with deferred estimation through the Estimator capability.
//!
//! An estimate is a (score, tokens) pair produced by an agent reading the
//! bead. Estimation is expensive, so results are cached against the bead's
//! description hash; editing a bead invalidates its cached estimate. A
//! cache miss never blocks the caller: the uncached beads are handed to an
//! estimate-kind batch and the call returns immediately with a pending
//! sentinel in place.

use crate::caps::Estimator;
use crate::core::batch::{Batch, BatchId, BatchKind, BatchStatus, BeadState};
use crate::core::bead::Bead;
use crate::core::queue::{ScheduledTask, SideEffectKind};
use crate::core::work::Work;
use crate::error::Result;
use crate::store::Store;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Valid complexity score range; agent output is clamped into it.
pub const MIN_SCORE: u8 = 1;
pub const MAX_SCORE: u8 = 10;
/// Valid token estimate range; agent output is clamped into it.
pub const MIN_TOKENS: u32 = 1_000;
pub const MAX_TOKENS: u32 = 100_000;

/// A cached cost estimate for one bead.
///
/// The all-zero value is the pending sentinel: estimation has been
/// dispatched but no result has arrived yet. Recorded results are clamped
/// to the valid ranges, so a real estimate is never all-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Estimate {
    pub score: u8,
    pub tokens: u32,
}

impl Estimate {
    pub const PENDING: Estimate = Estimate { score: 0, tokens: 0 };

    pub fn is_pending(&self) -> bool {
        *self == Self::PENDING
    }
}

/// What an estimate request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimateOutcome {
    /// Every requested bead already had a cached estimate.
    AllCached,
    /// Uncached beads were dispatched in this estimate batch.
    Spawned(BatchId),
}

/// Store-backed estimation cache with deferred miss handling.
pub struct EstimateCache {
    store: Store,
    estimator: Arc<dyn Estimator>,
}

impl EstimateCache {
    pub fn new(store: Store, estimator: Arc<dyn Estimator>) -> Self {
        Self { store, estimator }
    }

    /// Pure cache read. Never triggers estimation.
    pub fn lookup(&self, bead: &Bead) -> Result<Option<Estimate>> {
        let hash = bead.content_hash();
        Ok(self
            .store
            .get_estimate(&bead.id, &hash)?
            .map(|(score, tokens)| Estimate { score, tokens }))
    }

    /// Estimate one bead. A cache hit returns the stored value; a miss
    /// dispatches estimation and returns the pending sentinel.
    pub async fn estimate(&self, work: &Work, bead: &Bead) -> Result<Estimate> {
        if let Some(estimate) = self.lookup(bead)? {
            return Ok(estimate);
        }
        self.estimate_batch(work, std::slice::from_ref(bead), false)
            .await?;
        Ok(self.lookup(bead)?.unwrap_or(Estimate::PENDING))
    }

    /// Dispatch estimation for every bead without a cached estimate.
    ///
    /// With `force`, cached values are ignored and everything is
    /// re-estimated. Dispatch writes the pending sentinel for each bead,
    /// creates an estimate-kind batch outside the Work's execution line,
    /// and schedules workspace provisioning and orchestrator spawn through
    /// the queue (both idempotent, so repeated calls are no-ops there).
    pub async fn estimate_batch(
        &self,
        work: &Work,
        beads: &[Bead],
        force: bool,
    ) -> Result<EstimateOutcome> {
        let mut uncached = Vec::new();
        for bead in beads {
            if force || self.lookup(bead)?.is_none() {
                uncached.push(bead.clone());
            }
        }
        if uncached.is_empty() {
            debug!(work = %work.id.short(), beads = beads.len(), "all estimates cached");
            return Ok(EstimateOutcome::AllCached);
        }

        let ids: Vec<String> = uncached.iter().map(|b| b.id.clone()).collect();
        let batch = Batch::new(
            work.id,
            &format!("estimate-{}", work.id.short()),
            BatchKind::Estimate,
            0,
            &ids,
        );
        self.store.insert_batch(&batch)?;
        for bead in &uncached {
            self.store.put_estimate(
                &bead.id,
                &bead.content_hash(),
                Estimate::PENDING.score,
                Estimate::PENDING.tokens,
            )?;
        }

        self.store.schedule_task(&ScheduledTask::new(
            work.id,
            SideEffectKind::ProvisionWorkspace,
            "provision",
        ))?;
        self.store.schedule_task(&ScheduledTask::new(
            work.id,
            SideEffectKind::SpawnOrchestrator,
            "spawn",
        ))?;

        info!(
            work = %work.id.short(),
            batch = %batch.id.short(),
            beads = uncached.len(),
            "dispatched estimation"
        );
        if let Err(e) = self.estimator.estimate_beads(work, batch.id, &uncached).await {
            // No run exists behind these sentinels; left in place they
            // would block every future dispatch for the same beads.
            for bead in &uncached {
                self.store.delete_estimate(&bead.id, &bead.content_hash())?;
            }
            self.store.update_batch_status(
                batch.id,
                &[BatchStatus::Pending],
                BatchStatus::Failed,
                Some(&e.to_string()),
                "fail",
            )?;
            return Err(e);
        }
        Ok(EstimateOutcome::Spawned(batch.id))
    }

    /// Resolve cached estimates for a whole working set, as the planner
    /// consumes them. Beads without a cache entry are absent from the map;
    /// pending sentinels are included as-is.
    pub fn resolve_all(
        &self,
        beads: &[Bead],
    ) -> Result<std::collections::HashMap<String, Estimate>> {
        let mut map = std::collections::HashMap::with_capacity(beads.len());
        for bead in beads {
            if let Some(estimate) = self.lookup(bead)? {
                map.insert(bead.id.clone(), estimate);
            }
        }
        Ok(map)
    }

    /// Record an estimate reported by the agent, clamped into the valid
    /// ranges. Recording under a new description hash replaces the bead's
    /// prior estimate. The bead is marked done in any open estimate batch
    /// carrying it, and a batch whose last bead reports in completes.
    pub fn record(&self, bead_id: &str, descr_hash: &str, score: u8, tokens: u32) -> Result<()> {
        let score = score.clamp(MIN_SCORE, MAX_SCORE);
        let tokens = tokens.clamp(MIN_TOKENS, MAX_TOKENS);
        self.store.put_estimate(bead_id, descr_hash, score, tokens)?;
        debug!(bead = bead_id, score, tokens, "recorded estimate");

        for batch_id in self.store.open_estimate_batches_for_bead(bead_id)? {
            self.store
                .set_bead_state(batch_id, bead_id, BeadState::Completed)?;
            if self.store.get_batch(batch_id)?.all_beads_completed() {
                self.store.update_batch_status(
                    batch_id,
                    &[BatchStatus::Pending, BatchStatus::Processing],
                    BatchStatus::Completed,
                    None,
                    "complete",
                )?;
                debug!(batch = %batch_id.short(), "estimate batch completed");
            }
        }
        Ok(())
    }
}
