//! Control plane: drains the scheduled task queue and keeps orchestrator
//! sessions alive.
//!
//! The loop is reactive. Every store mutation raises the change signal, so
//! new queue entries are picked up immediately; a poll interval acts as a
//! fallback for entries whose run_at lies in the future and as the pace of
//! the heartbeat liveness sweep. Entry failures retry with exponential
//! backoff until attempts are exhausted, at which point the failure is
//! surfaced on the owning Work.

use crate::caps::Capabilities;
use crate::config::Config;
use crate::core::queue::{ScheduledTask, SideEffectKind};
use crate::core::work::{Work, WorkStatus};
use crate::error::{Error, Result};
use crate::store::Store;
use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The queue-driven side-effect executor.
pub struct ControlPlane {
    store: Store,
    caps: Capabilities,
    config: Config,
}

impl ControlPlane {
    pub fn new(store: Store, caps: Capabilities, config: Config) -> Self {
        Self { store, caps, config }
    }

    /// Run until cancelled. Wakes on the store's change signal or the
    /// poll interval, whichever fires first.
    pub async fn run(&self, cancel: CancellationToken) {
        let changed = self.store.change_signal();
        let mut poll = tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("control plane running");
        loop {
            if let Err(e) = self.tick().await {
                warn!(error = %e, "control plane pass failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = changed.notified() => {}
                _ = poll.tick() => {}
            }
        }
        info!("control plane stopped");
    }

    /// One full pass: liveness sweep, then every due queue entry.
    pub async fn tick(&self) -> Result<()> {
        self.sweep_stale_sessions().await?;
        for task in self.store.due_tasks(Utc::now())? {
            // The claim can lose to a concurrent pass; skip silently.
            if self.store.claim_task(task.id)? {
                self.execute(&task).await?;
            }
        }
        Ok(())
    }

    async fn execute(&self, task: &ScheduledTask) -> Result<()> {
        let work = match self.store.get_work(task.work_id) {
            Ok(work) => work,
            Err(Error::NotFound { .. }) => {
                // The Work was deleted out from under its queue entry.
                debug!(task = task.id, "work gone, dropping entry");
                return self.store.complete_task(task.id);
            }
            Err(e) => return Err(e),
        };

        debug!(task = task.id, kind = task.kind.as_str(), work = %work.id.short(), "dispatching");
        match self.dispatch(task, &work).await {
            Ok(()) => self.store.complete_task(task.id),
            Err(e) => self.handle_failure(task, &work, &e.to_string()),
        }
    }

    async fn dispatch(&self, task: &ScheduledTask, work: &Work) -> Result<()> {
        match task.kind {
            SideEffectKind::ProvisionWorkspace => {
                let path = self.caps.workspaces.provision(work).await?;
                self.store.set_workspace_path(work.id, &path)?;
                Ok(())
            }
            SideEffectKind::SpawnOrchestrator => self.caps.sessions.spawn(work).await,
            SideEffectKind::TeardownWorkspace => {
                if self.caps.sessions.is_alive(work).await? {
                    self.caps.sessions.stop(work).await?;
                }
                self.caps.workspaces.teardown(work).await
            }
            SideEffectKind::PollFeedback => {
                let feedback = self.caps.remote.poll_feedback(work).await?;
                if feedback.is_empty() {
                    // Nothing yet; keep polling.
                    let next = Utc::now()
                        + ChronoDuration::seconds(self.config.poll_interval_secs as i64);
                    self.store.schedule_task(
                        &ScheduledTask::new(
                            work.id,
                            SideEffectKind::PollFeedback,
                            &format!("poll:{}", next.timestamp()),
                        )
                        .with_run_at(next),
                    )?;
                } else {
                    info!(
                        work = %work.id.short(),
                        items = feedback.len(),
                        "review feedback received"
                    );
                }
                Ok(())
            }
            SideEffectKind::SyncRemote => self.caps.remote.push_branch(work).await,
        }
    }

    /// Retry with exponential backoff, or fail permanently once attempts
    /// run out and surface the error on the Work.
    fn handle_failure(&self, task: &ScheduledTask, work: &Work, error: &str) -> Result<()> {
        let attempts = task.attempts + 1;
        if attempts >= task.max_attempts {
            warn!(
                task = task.id,
                kind = task.kind.as_str(),
                attempts,
                error,
                "queue entry failed permanently"
            );
            self.store.fail_task(task.id, error)?;
            self.store.set_work_error(work.id, Some(error))?;
            match self.store.update_work_status(
                work.id,
                &[WorkStatus::Processing],
                WorkStatus::Failed,
                "fail",
            ) {
                Ok(()) | Err(Error::Precondition { .. }) => Ok(()),
                Err(e) => Err(e),
            }
        } else {
            let delay = self
                .config
                .backoff_base_secs
                .saturating_mul(1i64 << task.attempts.min(20));
            let run_at = Utc::now() + ChronoDuration::seconds(delay);
            warn!(
                task = task.id,
                kind = task.kind.as_str(),
                attempts,
                delay_secs = delay,
                error,
                "queue entry failed, retrying"
            );
            self.store.retry_task(task.id, run_at, error)
        }
    }

    /// Stop and respawn the session of any processing Work whose heartbeat
    /// has gone stale. The respawn key is derived from the stale heartbeat,
    /// so one stall schedules exactly one respawn.
    async fn sweep_stale_sessions(&self) -> Result<()> {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.config.heartbeat_staleness_secs);
        for work in self.store.stale_processing_works(cutoff)? {
            let Some(heartbeat) = work.heartbeat_at else {
                continue;
            };
            warn!(
                work = %work.id.short(),
                heartbeat = %heartbeat,
                "stale heartbeat, recycling session"
            );
            if self.caps.sessions.is_alive(&work).await? {
                self.caps.sessions.stop(&work).await?;
            }
            self.store.schedule_task(&ScheduledTask::new(
                work.id,
                SideEffectKind::SpawnOrchestrator,
                &format!("respawn:{}", heartbeat.timestamp()),
            ))?;
            // Refresh the heartbeat so the replacement session gets a full
            // staleness window before it has to report in. Without this the
            // next pass still sees the old timestamp and stops the session
            // it just spawned.
            self.store.record_heartbeat(work.id, Utc::now())?;
        }
        Ok(())
    }
}
