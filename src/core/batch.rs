//! Batch: a budget-bounded group of beads executed in one agent session.
//!
//! Batches are produced by the planner (or by explicit manual grouping) and
//! owned exclusively by their parent Work. Within a batch the executing
//! agent chooses bead order; the batch completes only when every member
//! bead reports completion, and retry after failure is bead-granular.

use crate::core::work::WorkId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for BatchId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// What a batch is for.
///
/// `Estimate` batches carry uncached beads to the Estimator for costing and
/// never enter the Work's sequential execution line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    Work,
    Estimate,
}

impl BatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchKind::Work => "work",
            BatchKind::Estimate => "estimate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "work" => Some(BatchKind::Work),
            "estimate" => Some(BatchKind::Estimate),
            _ => None,
        }
    }
}

/// Batch lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BatchStatus::Pending),
            "processing" => Some(BatchStatus::Processing),
            "completed" => Some(BatchStatus::Completed),
            "failed" => Some(BatchStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-bead completion sub-status inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeadState {
    Pending,
    Completed,
    Failed,
}

impl BeadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BeadState::Pending => "pending",
            BeadState::Completed => "completed",
            BeadState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BeadState::Pending),
            "completed" => Some(BeadState::Completed),
            "failed" => Some(BeadState::Failed),
            _ => None,
        }
    }
}

/// An ordered batch member with its completion sub-status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMember {
    pub bead_id: String,
    pub state: BeadState,
}

impl BatchMember {
    pub fn new(bead_id: &str) -> Self {
        Self {
            bead_id: bead_id.to_string(),
            state: BeadState::Pending,
        }
    }
}

/// A named, ordered group of beads assigned to one execution session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub work_id: WorkId,
    pub name: String,
    pub kind: BatchKind,
    /// Position in the owning Work's sequential line.
    pub seq: u32,
    /// Member beads in assignment order.
    pub members: Vec<BatchMember>,
    /// Sum of member complexity scores.
    pub score: u32,
    /// Sum of member token estimates.
    pub tokens: u32,
    /// A single bead whose estimate alone exceeds the planning budget.
    pub oversized: bool,
    pub status: BatchStatus,
    /// Failure message from the executor, if any.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(work_id: WorkId, name: &str, kind: BatchKind, seq: u32, bead_ids: &[String]) -> Self {
        let now = Utc::now();
        Self {
            id: BatchId::new(),
            work_id,
            name: name.to_string(),
            kind,
            seq,
            members: bead_ids.iter().map(|id| BatchMember::new(id)).collect(),
            score: 0,
            tokens: 0,
            oversized: false,
            status: BatchStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn bead_ids(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.bead_id.as_str()).collect()
    }

    pub fn member_state(&self, bead_id: &str) -> Option<BeadState> {
        self.members
            .iter()
            .find(|m| m.bead_id == bead_id)
            .map(|m| m.state)
    }

    pub fn all_beads_completed(&self) -> bool {
        self.members.iter().all(|m| m.state == BeadState::Completed)
    }

    pub fn any_bead_failed(&self) -> bool {
        self.members.iter().any(|m| m.state == BeadState::Failed)
    }

    /// Beads still needing work on a re-run (everything not completed).
    pub fn incomplete_beads(&self) -> Vec<&str> {
        self.members
            .iter()
            .filter(|m| m.state != BeadState::Completed)
            .map(|m| m.bead_id.as_str())
            .collect()
    }
}
