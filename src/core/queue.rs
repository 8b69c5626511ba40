//! Scheduled task queue entries: persisted units of asynchronous side
//! effects executed by the control plane.

use crate::core::work::WorkId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The side effect a queue entry performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectKind {
    /// Create the Work's isolated workspace and branch.
    ProvisionWorkspace,
    /// Start the Work's long-running orchestrator session.
    SpawnOrchestrator,
    /// Remove the Work's workspace (idempotent).
    TeardownWorkspace,
    /// Poll the remote for review feedback.
    PollFeedback,
    /// Push the Work's branch to the remote.
    SyncRemote,
}

impl SideEffectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SideEffectKind::ProvisionWorkspace => "provision_workspace",
            SideEffectKind::SpawnOrchestrator => "spawn_orchestrator",
            SideEffectKind::TeardownWorkspace => "teardown_workspace",
            SideEffectKind::PollFeedback => "poll_feedback",
            SideEffectKind::SyncRemote => "sync_remote",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "provision_workspace" => Some(SideEffectKind::ProvisionWorkspace),
            "spawn_orchestrator" => Some(SideEffectKind::SpawnOrchestrator),
            "teardown_workspace" => Some(SideEffectKind::TeardownWorkspace),
            "poll_feedback" => Some(SideEffectKind::PollFeedback),
            "sync_remote" => Some(SideEffectKind::SyncRemote),
            _ => None,
        }
    }
}

/// Queue entry status.
///
/// `Failed` is permanent: attempts are exhausted and the error has been
/// surfaced on the owning Work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Running => "running",
            EntryStatus::Completed => "completed",
            EntryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EntryStatus::Pending),
            "running" => Some(EntryStatus::Running),
            "completed" => Some(EntryStatus::Completed),
            "failed" => Some(EntryStatus::Failed),
            _ => None,
        }
    }
}

/// A persisted unit of asynchronous work for the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// Row id; 0 until persisted.
    pub id: i64,
    pub work_id: WorkId,
    pub kind: SideEffectKind,
    /// Earliest time this entry is due.
    pub run_at: DateTime<Utc>,
    /// Kind-specific payload.
    pub metadata: serde_json::Value,
    /// Stable key preventing duplicate scheduling of the same logical
    /// operation for the same Work.
    pub idempotency_key: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: EntryStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledTask {
    pub fn new(work_id: WorkId, kind: SideEffectKind, idempotency_key: &str) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            work_id,
            kind,
            run_at: now,
            metadata: serde_json::Value::Null,
            idempotency_key: idempotency_key.to_string(),
            attempts: 0,
            max_attempts: crate::config::DEFAULT_MAX_ATTEMPTS,
            status: EntryStatus::Pending,
            last_error: None,
            created_at: now,
        }
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = run_at;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}
