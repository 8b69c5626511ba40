//! Capability traits: the seams between the orchestration engine and the
//! outside world (tracker, agent sessions, workspaces, remote).
//!
//! The engine owns state and sequencing; everything that touches an
//! external system goes through one of these traits so tests can swap in
//! in-memory doubles.

use crate::core::batch::BatchId;
use crate::core::bead::{Bead, BeadStatus, Relation};
use crate::core::work::Work;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Outcome of one batch execution session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Whether the session finished every bead it was handed.
    pub completed: bool,
    /// Failure detail when `completed` is false.
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn success() -> Self {
        Self {
            completed: true,
            error: None,
        }
    }

    pub fn failure(error: &str) -> Self {
        Self {
            completed: false,
            error: Some(error.to_string()),
        }
    }
}

/// Dispatches beads to an agent for cost estimation.
///
/// Estimation is fire-and-return: the call hands the batch off and comes
/// back immediately. Results arrive later through
/// [`EstimateCache::record`](crate::orchestration::estimate::EstimateCache::record).
#[async_trait]
pub trait Estimator: Send + Sync {
    async fn estimate_beads(&self, work: &Work, batch: BatchId, beads: &[Bead]) -> Result<()>;
}

/// Runs a batch of beads in an agent session inside the Work's workspace.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run_batch(&self, work: &Work, batch: BatchId, bead_ids: &[String])
        -> Result<ExecutionOutcome>;
}

/// Creates and removes isolated per-Work workspaces.
#[async_trait]
pub trait WorkspaceProvisioner: Send + Sync {
    /// Create the workspace and branch, returning the workspace path.
    /// Must be idempotent: re-provisioning an existing workspace returns
    /// its path without error.
    async fn provision(&self, work: &Work) -> Result<String>;

    /// Remove the workspace. Removing one that does not exist is not an
    /// error.
    async fn teardown(&self, work: &Work) -> Result<()>;
}

/// Manages the long-running orchestrator session attached to a Work.
#[async_trait]
pub trait SessionSupervisor: Send + Sync {
    async fn spawn(&self, work: &Work) -> Result<()>;
    async fn stop(&self, work: &Work) -> Result<()>;
    async fn is_alive(&self, work: &Work) -> Result<bool>;
}

/// Pushes branches and collects review feedback from the remote.
#[async_trait]
pub trait Remote: Send + Sync {
    async fn push_branch(&self, work: &Work) -> Result<()>;

    /// New feedback items since the last poll, if any.
    async fn poll_feedback(&self, work: &Work) -> Result<Vec<String>>;
}

/// Read/write access to the issue tracker's beads and relations.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn beads(&self, ids: &[String]) -> Result<Vec<Bead>>;
    async fn relations(&self, ids: &[String]) -> Result<Vec<Relation>>;
    async fn list_by_status(&self, status: BeadStatus) -> Result<Vec<Bead>>;
    async fn set_status(&self, id: &str, status: BeadStatus) -> Result<()>;
}

/// The full capability set the control plane dispatches through.
#[derive(Clone)]
pub struct Capabilities {
    pub estimator: Arc<dyn Estimator>,
    pub executor: Arc<dyn Executor>,
    pub workspaces: Arc<dyn WorkspaceProvisioner>,
    pub sessions: Arc<dyn SessionSupervisor>,
    pub remote: Arc<dyn Remote>,
    pub tracker: Arc<dyn IssueTracker>,
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities").finish_non_exhaustive()
    }
}
