//! Work: the top-level execution context.
//!
//! A Work owns a branch, an isolated workspace, and an ordered sequence of
//! batches executed strictly one at a time. Independent Works progress
//! concurrently; each one is a single sequential execution line.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a Work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle status of a Work.
///
/// `Merged` is terminal and reachable only from `Idle` or `Processing`,
/// when the Work's change is detected as integrated upstream; it bypasses
/// `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Processing,
    Idle,
    Completed,
    Failed,
    Merged,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::Processing => "processing",
            WorkStatus::Idle => "idle",
            WorkStatus::Completed => "completed",
            WorkStatus::Failed => "failed",
            WorkStatus::Merged => "merged",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(WorkStatus::Pending),
            "processing" => Some(WorkStatus::Processing),
            "idle" => Some(WorkStatus::Idle),
            "completed" => Some(WorkStatus::Completed),
            "failed" => Some(WorkStatus::Failed),
            "merged" => Some(WorkStatus::Merged),
            _ => None,
        }
    }

    /// Whether a transition to `target` is legal.
    ///
    /// Only the enumerated transitions exist:
    /// - Pending -> Processing (start)
    /// - Processing -> Idle (all batches done)
    /// - Processing -> Failed (batch failure)
    /// - Idle -> Processing (new batches attached)
    /// - Idle -> Completed (finalize)
    /// - Failed -> Processing (explicit restart only)
    /// - Idle | Processing -> Merged
    pub fn can_transition(&self, target: WorkStatus) -> bool {
        matches!(
            (self, target),
            (WorkStatus::Pending, WorkStatus::Processing)
                | (WorkStatus::Processing, WorkStatus::Idle)
                | (WorkStatus::Processing, WorkStatus::Failed)
                | (WorkStatus::Idle, WorkStatus::Processing)
                | (WorkStatus::Idle, WorkStatus::Completed)
                | (WorkStatus::Failed, WorkStatus::Processing)
                | (WorkStatus::Idle, WorkStatus::Merged)
                | (WorkStatus::Processing, WorkStatus::Merged)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkStatus::Completed | WorkStatus::Merged)
    }
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The top-level execution context: branch, workspace, sequential batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Work {
    pub id: WorkId,
    /// Branch this Work commits to.
    pub branch: String,
    /// Isolated workspace, set once provisioning completes.
    pub workspace_path: Option<String>,
    /// Tracker bead this Work was created for, if any.
    pub root_bead: Option<String>,
    pub status: WorkStatus,
    /// Last surfaced failure (batch failure or exhausted queue entry).
    pub last_error: Option<String>,
    /// Last orchestrator heartbeat; drives the liveness sweep.
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Work {
    pub fn new(branch: &str, root_bead: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: WorkId::new(),
            branch: branch.to_string(),
            workspace_path: None,
            root_bead: root_bead.map(str::to_string),
            status: WorkStatus::Pending,
            last_error: None,
            heartbeat_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
