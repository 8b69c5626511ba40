//! Bead data model: the atomic units of trackable work.
//!
//! Beads are created by an external issue tracker and flow through the
//! planner as the raw material for execution batches. This core mutates
//! their status through the tracker capability but never deletes them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Lifecycle status of a bead in the issue tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeadStatus {
    Open,
    InProgress,
    Blocked,
    Deferred,
    Closed,
}

impl std::fmt::Display for BeadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BeadStatus::Open => write!(f, "open"),
            BeadStatus::InProgress => write!(f, "in_progress"),
            BeadStatus::Blocked => write!(f, "blocked"),
            BeadStatus::Deferred => write!(f, "deferred"),
            BeadStatus::Closed => write!(f, "closed"),
        }
    }
}

/// Kind of work a bead represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeadKind {
    Task,
    Bug,
    Feature,
    Epic,
}

impl Default for BeadKind {
    fn default() -> Self {
        Self::Task
    }
}

/// An atomic piece of work from the issue tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bead {
    /// Tracker-assigned identifier (e.g. "bd-42").
    pub id: String,
    /// Short human-readable title.
    pub title: String,
    /// Detailed description of what the bead requires.
    pub description: String,
    /// Current tracker status.
    pub status: BeadStatus,
    /// Priority, 0 (highest) through 4.
    pub priority: u8,
    /// Kind of work.
    pub kind: BeadKind,
    /// Cached complexity score (1-10), if previously estimated.
    pub score: Option<u8>,
    /// Cached token estimate, if previously estimated.
    pub tokens: Option<u32>,
}

impl Bead {
    /// Create a bead with default status and kind.
    pub fn new(id: &str, title: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            status: BeadStatus::Open,
            priority: 2,
            kind: BeadKind::Task,
            score: None,
            tokens: None,
        }
    }

    /// Content hash over title and description.
    ///
    /// Keys the estimation cache: editing either field invalidates the
    /// cached estimate for this bead.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.title.as_bytes());
        hasher.update(self.description.as_bytes());
        hex_encode(&hasher.finalize())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Direction/kind of a relation between two beads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// `from` blocks `to`: `to` depends on `from`.
    Blocks,
    /// `from` is blocked by `to`: `from` depends on `to`.
    BlockedBy,
    /// Hierarchical grouping; carries no execution ordering.
    ParentChild,
}

/// A directed relation between two beads, as reported by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub from: String,
    pub to: String,
    pub kind: RelationKind,
}

impl Relation {
    pub fn new(from: &str, to: &str, kind: RelationKind) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            kind,
        }
    }

    /// Resolve the dependency direction, if this relation expresses one.
    ///
    /// Returns `(dependent, dependency)`: the first bead cannot start until
    /// the second completes. Parent-child relations carry no ordering.
    pub fn dependency(&self) -> Option<(&str, &str)> {
        match self.kind {
            RelationKind::Blocks => Some((self.to.as_str(), self.from.as_str())),
            RelationKind::BlockedBy => Some((self.from.as_str(), self.to.as_str())),
            RelationKind::ParentChild => None,
        }
    }
}
