//! Work and batch lifecycle: every state transition in the system, each
//! one a guarded store update.
//!
//! The transition table lives on [`WorkStatus`]; this module turns it into
//! operations. A Work executes its batches strictly in sequence: beads
//! complete one by one, the batch completes when its last bead does, and
//! the Work goes idle when its last batch does. Failure is sticky at every
//! level until an explicit reset or restart.

use crate::core::batch::{Batch, BatchId, BatchKind, BatchStatus, BeadState};
use crate::core::bead::BeadStatus;
use crate::core::queue::{ScheduledTask, SideEffectKind};
use crate::core::work::{Work, WorkId, WorkStatus};
use crate::error::{Error, Result};
use crate::orchestration::planner::Plan;
use crate::store::Store;
use chrono::Utc;
use tracing::{info, warn};

/// Store-backed lifecycle operations for Works and batches.
#[derive(Clone)]
pub struct Lifecycle {
    store: Store,
}

impl Lifecycle {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    // ========== Work Operations ==========

    /// Create a Work in pending status. Nothing runs until
    /// [`Self::start_work`].
    pub fn create_work(&self, branch: &str, root_bead: Option<&str>) -> Result<Work> {
        let work = Work::new(branch, root_bead);
        self.store.insert_work(&work)?;
        info!(work = %work.id.short(), branch, "created work");
        Ok(work)
    }

    /// Persist a plan's batches onto a Work, appending after any existing
    /// batches and carrying the plan's cross-batch dependencies over.
    ///
    /// Attaching to an idle Work puts it back into processing; a pending
    /// Work stays pending until started. Failed and terminal Works reject
    /// attachment.
    pub fn attach_plan(&self, work_id: WorkId, plan: &Plan) -> Result<Vec<Batch>> {
        let work = self.store.get_work(work_id)?;
        if !matches!(
            work.status,
            WorkStatus::Pending | WorkStatus::Idle | WorkStatus::Processing
        ) {
            return Err(Error::Precondition {
                entity: "work",
                action: "attach plan",
                status: work.status.to_string(),
            });
        }
        let existing = self.store.list_batches(work_id)?;
        let base_seq = existing
            .iter()
            .filter(|b| b.kind == BatchKind::Work)
            .map(|b| b.seq + 1)
            .max()
            .unwrap_or(0);

        let mut batches = Vec::with_capacity(plan.batches.len());
        for (i, planned) in plan.batches.iter().enumerate() {
            let seq = base_seq + i as u32;
            let mut batch = Batch::new(
                work_id,
                &format!("batch-{seq}"),
                BatchKind::Work,
                seq,
                &planned.bead_ids,
            );
            batch.score = planned.score;
            batch.tokens = planned.tokens;
            batch.oversized = planned.oversized;
            self.store.insert_batch(&batch)?;
            batches.push(batch);
        }
        for &(dependent, dependency) in &plan.deps {
            self.store
                .insert_batch_dep(batches[dependent].id, batches[dependency].id)?;
        }

        if work.status == WorkStatus::Idle {
            self.store.update_work_status(
                work_id,
                &[WorkStatus::Idle],
                WorkStatus::Processing,
                "attach plan",
            )?;
        }
        info!(
            work = %work_id.short(),
            batches = batches.len(),
            "attached plan"
        );
        Ok(batches)
    }

    /// Start a pending Work: moves it to processing and schedules its
    /// workspace provisioning and orchestrator spawn.
    pub fn start_work(&self, work_id: WorkId) -> Result<()> {
        self.store.update_work_status(
            work_id,
            &[WorkStatus::Pending],
            WorkStatus::Processing,
            "start",
        )?;
        self.store.schedule_task(&ScheduledTask::new(
            work_id,
            SideEffectKind::ProvisionWorkspace,
            "provision",
        ))?;
        self.store.schedule_task(&ScheduledTask::new(
            work_id,
            SideEffectKind::SpawnOrchestrator,
            "spawn",
        ))?;
        Ok(())
    }

    /// The next runnable batch: lowest-sequence pending work batch whose
    /// cross-batch dependencies are completed. Estimate batches never
    /// appear here.
    pub fn next_batch(&self, work_id: WorkId) -> Result<Option<Batch>> {
        self.store.next_pending_batch(work_id)
    }

    /// Restart a failed Work. Its failed batches are reset (completed
    /// beads keep their state) and a fresh orchestrator spawn is
    /// scheduled, so execution re-enters at the first unfinished batch.
    pub fn restart_work(&self, work_id: WorkId) -> Result<()> {
        self.store.update_work_status(
            work_id,
            &[WorkStatus::Failed],
            WorkStatus::Processing,
            "restart",
        )?;
        self.store.set_work_error(work_id, None)?;
        for batch in self.store.list_batches(work_id)? {
            if batch.status == BatchStatus::Failed {
                self.reset_batch(batch.id)?;
            }
        }
        self.store.schedule_task(&ScheduledTask::new(
            work_id,
            SideEffectKind::SpawnOrchestrator,
            &format!("respawn:{}", Utc::now().timestamp()),
        ))?;
        info!(work = %work_id.short(), "restarted work");
        Ok(())
    }

    /// Finalize an idle Work as completed and schedule workspace teardown.
    pub fn finalize_work(&self, work_id: WorkId) -> Result<()> {
        self.store.update_work_status(
            work_id,
            &[WorkStatus::Idle],
            WorkStatus::Completed,
            "finalize",
        )?;
        self.store.schedule_task(&ScheduledTask::new(
            work_id,
            SideEffectKind::TeardownWorkspace,
            "teardown",
        ))?;
        Ok(())
    }

    /// Mark a Work merged: its change was detected as integrated upstream.
    /// Legal from idle or processing; schedules teardown.
    pub fn mark_merged(&self, work_id: WorkId) -> Result<()> {
        self.store.update_work_status(
            work_id,
            &[WorkStatus::Idle, WorkStatus::Processing],
            WorkStatus::Merged,
            "mark merged",
        )?;
        self.store.schedule_task(&ScheduledTask::new(
            work_id,
            SideEffectKind::TeardownWorkspace,
            "teardown",
        ))?;
        info!(work = %work_id.short(), "work merged");
        Ok(())
    }

    /// Record an orchestrator heartbeat.
    pub fn record_heartbeat(&self, work_id: WorkId) -> Result<()> {
        self.store.record_heartbeat(work_id, Utc::now())
    }

    /// Delete a Work and all of its batches, members, dependencies, and
    /// queue entries. Tear the workspace down first if it matters.
    pub fn delete_work(&self, work_id: WorkId) -> Result<()> {
        self.store.delete_work(work_id)?;
        info!(work = %work_id.short(), "deleted work");
        Ok(())
    }

    pub fn get_work(&self, work_id: WorkId) -> Result<Work> {
        self.store.get_work(work_id)
    }

    // ========== Batch Operations ==========

    /// Move a pending batch into processing as its session picks it up.
    pub fn start_batch(&self, batch_id: BatchId) -> Result<()> {
        self.store.update_batch_status(
            batch_id,
            &[BatchStatus::Pending],
            BatchStatus::Processing,
            None,
            "start",
        )
    }

    /// Record one bead of a processing batch as done. When it was the
    /// batch's last open bead the batch completes; when that was the
    /// Work's last unfinished batch the Work goes idle.
    pub fn complete_bead(&self, batch_id: BatchId, bead_id: &str) -> Result<()> {
        self.store.set_bead_state(batch_id, bead_id, BeadState::Completed)?;
        let batch = self.store.get_batch(batch_id)?;
        if batch.status != BatchStatus::Processing || !batch.all_beads_completed() {
            return Ok(());
        }
        self.store.update_batch_status(
            batch_id,
            &[BatchStatus::Processing],
            BatchStatus::Completed,
            None,
            "complete",
        )?;
        info!(batch = %batch_id.short(), "batch completed");

        if batch.kind == BatchKind::Work
            && self.store.count_unfinished_batches(batch.work_id)? == 0
        {
            let work = self.store.get_work(batch.work_id)?;
            if work.status == WorkStatus::Processing {
                self.store.update_work_status(
                    batch.work_id,
                    &[WorkStatus::Processing],
                    WorkStatus::Idle,
                    "drain",
                )?;
                info!(work = %batch.work_id.short(), "work idle, all batches done");
            }
        }
        Ok(())
    }

    /// Record one bead as failed. The whole batch fails and the owning
    /// Work fails with it; other batches are left untouched for the
    /// eventual restart.
    pub fn fail_bead(&self, batch_id: BatchId, bead_id: &str, error: &str) -> Result<()> {
        self.store.set_bead_state(batch_id, bead_id, BeadState::Failed)?;
        self.fail_batch(batch_id, error)
    }

    /// Fail a processing batch without bead granularity, for session-level
    /// failures (crash, timeout) where no per-bead report exists.
    pub fn report_batch_failure(&self, batch_id: BatchId, error: &str) -> Result<()> {
        self.fail_batch(batch_id, error)
    }

    fn fail_batch(&self, batch_id: BatchId, error: &str) -> Result<()> {
        self.store.update_batch_status(
            batch_id,
            &[BatchStatus::Processing],
            BatchStatus::Failed,
            Some(error),
            "fail",
        )?;
        let batch = self.store.get_batch(batch_id)?;
        warn!(batch = %batch_id.short(), error, "batch failed");

        if batch.kind == BatchKind::Work {
            self.store.update_work_status(
                batch.work_id,
                &[WorkStatus::Processing],
                WorkStatus::Failed,
                "fail",
            )?;
            self.store.set_work_error(batch.work_id, Some(error))?;
        }
        Ok(())
    }

    /// Reset a failed batch to pending for a re-run. Completed beads keep
    /// their state; only failed members return to pending.
    pub fn reset_batch(&self, batch_id: BatchId) -> Result<()> {
        self.store.update_batch_status(
            batch_id,
            &[BatchStatus::Failed],
            BatchStatus::Pending,
            None,
            "reset",
        )?;
        self.store.reset_failed_members(batch_id)
    }

    /// Run the Work's next runnable batch through an executor, as the
    /// orchestrator session does. Only beads not already completed are
    /// handed over, so a reset batch re-runs just its unfinished members.
    /// Bead status is mirrored to the tracker: in_progress while the batch
    /// runs, closed as each bead completes.
    ///
    /// Returns the batch that ran, or None when nothing is runnable.
    pub async fn execute_next_batch(
        &self,
        work_id: WorkId,
        executor: &dyn crate::caps::Executor,
        tracker: &dyn crate::caps::IssueTracker,
    ) -> Result<Option<BatchId>> {
        let Some(batch) = self.next_batch(work_id)? else {
            return Ok(None);
        };
        self.start_batch(batch.id)?;
        let work = self.get_work(work_id)?;
        let beads: Vec<String> = batch
            .incomplete_beads()
            .iter()
            .map(|s| s.to_string())
            .collect();
        for bead in &beads {
            tracker.set_status(bead, BeadStatus::InProgress).await?;
        }

        match executor.run_batch(&work, batch.id, &beads).await {
            Ok(outcome) if outcome.completed => {
                for bead in &beads {
                    self.complete_bead(batch.id, bead)?;
                    tracker.set_status(bead, BeadStatus::Closed).await?;
                }
                Ok(Some(batch.id))
            }
            Ok(outcome) => {
                let error = outcome
                    .error
                    .unwrap_or_else(|| "batch execution failed".to_string());
                self.report_batch_failure(batch.id, &error)?;
                Ok(Some(batch.id))
            }
            Err(e) => {
                self.report_batch_failure(batch.id, &e.to_string())?;
                Err(e)
            }
        }
    }

    pub fn get_batch(&self, batch_id: BatchId) -> Result<Batch> {
        self.store.get_batch(batch_id)
    }

    pub fn list_batches(&self, work_id: WorkId) -> Result<Vec<Batch>> {
        self.store.list_batches(work_id)
    }
}
