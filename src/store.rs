//! SQLite-backed persistence for Works, batches, estimates, and the
//! scheduled task queue.
//!
//! All state transitions are expressed as guarded UPDATE statements that
//! name the expected current status in the WHERE clause, so concurrent
//! callers cannot double-apply a transition. Every mutation raises the
//! change signal that wakes the control plane.

use crate::core::batch::{Batch, BatchId, BatchKind, BatchMember, BatchStatus, BeadState};
use crate::core::queue::{EntryStatus, ScheduledTask, SideEffectKind};
use crate::core::work::{Work, WorkId, WorkStatus};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS works (
    id              TEXT PRIMARY KEY,
    branch          TEXT NOT NULL,
    workspace_path  TEXT,
    root_bead       TEXT,
    status          TEXT NOT NULL,
    last_error      TEXT,
    heartbeat_at    TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS batches (
    id          TEXT PRIMARY KEY,
    work_id     TEXT NOT NULL REFERENCES works(id) ON DELETE CASCADE,
    name        TEXT NOT NULL,
    kind        TEXT NOT NULL,
    seq         INTEGER NOT NULL,
    score       INTEGER NOT NULL DEFAULT 0,
    tokens      INTEGER NOT NULL DEFAULT 0,
    oversized   INTEGER NOT NULL DEFAULT 0,
    status      TEXT NOT NULL,
    error       TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS batch_beads (
    batch_id  TEXT NOT NULL REFERENCES batches(id) ON DELETE CASCADE,
    bead_id   TEXT NOT NULL,
    position  INTEGER NOT NULL,
    state     TEXT NOT NULL,
    PRIMARY KEY (batch_id, bead_id)
);

CREATE TABLE IF NOT EXISTS batch_deps (
    batch_id             TEXT NOT NULL REFERENCES batches(id) ON DELETE CASCADE,
    depends_on_batch_id  TEXT NOT NULL REFERENCES batches(id) ON DELETE CASCADE,
    PRIMARY KEY (batch_id, depends_on_batch_id)
);

CREATE TABLE IF NOT EXISTS estimates (
    bead_id     TEXT NOT NULL,
    descr_hash  TEXT NOT NULL,
    score       INTEGER NOT NULL,
    tokens      INTEGER NOT NULL,
    created_at  TEXT NOT NULL,
    PRIMARY KEY (bead_id, descr_hash)
);

CREATE TABLE IF NOT EXISTS scheduled_tasks (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    work_id          TEXT NOT NULL,
    kind             TEXT NOT NULL,
    run_at           TEXT NOT NULL,
    metadata         TEXT,
    idempotency_key  TEXT NOT NULL,
    attempts         INTEGER NOT NULL DEFAULT 0,
    max_attempts     INTEGER NOT NULL,
    status           TEXT NOT NULL,
    last_error       TEXT,
    created_at       TEXT NOT NULL,
    UNIQUE (work_id, idempotency_key)
);

CREATE INDEX IF NOT EXISTS idx_batches_work ON batches(work_id, seq);
CREATE INDEX IF NOT EXISTS idx_tasks_due ON scheduled_tasks(status, run_at);
";

fn conv_err(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conv_err(idx, format!("invalid timestamp {s:?}: {e}")))
}

fn row_to_work(row: &rusqlite::Row<'_>) -> rusqlite::Result<Work> {
    let id: String = row.get("id")?;
    let status: String = row.get("status")?;
    let heartbeat: Option<String> = row.get("heartbeat_at")?;
    Ok(Work {
        id: id
            .parse()
            .map_err(|e: uuid::Error| conv_err(0, e.to_string()))?,
        branch: row.get("branch")?,
        workspace_path: row.get("workspace_path")?,
        root_bead: row.get("root_bead")?,
        status: WorkStatus::parse(&status)
            .ok_or_else(|| conv_err(4, format!("unknown work status {status:?}")))?,
        last_error: row.get("last_error")?,
        heartbeat_at: heartbeat.map(|s| parse_ts(6, &s)).transpose()?,
        created_at: parse_ts(7, &row.get::<_, String>("created_at")?)?,
        updated_at: parse_ts(8, &row.get::<_, String>("updated_at")?)?,
    })
}

fn row_to_batch(row: &rusqlite::Row<'_>) -> rusqlite::Result<Batch> {
    let id: String = row.get("id")?;
    let work_id: String = row.get("work_id")?;
    let kind: String = row.get("kind")?;
    let status: String = row.get("status")?;
    Ok(Batch {
        id: id
            .parse()
            .map_err(|e: uuid::Error| conv_err(0, e.to_string()))?,
        work_id: work_id
            .parse()
            .map_err(|e: uuid::Error| conv_err(1, e.to_string()))?,
        name: row.get("name")?,
        kind: BatchKind::parse(&kind)
            .ok_or_else(|| conv_err(3, format!("unknown batch kind {kind:?}")))?,
        seq: row.get("seq")?,
        members: Vec::new(),
        score: row.get("score")?,
        tokens: row.get("tokens")?,
        oversized: row.get("oversized")?,
        status: BatchStatus::parse(&status)
            .ok_or_else(|| conv_err(8, format!("unknown batch status {status:?}")))?,
        error: row.get("error")?,
        created_at: parse_ts(10, &row.get::<_, String>("created_at")?)?,
        updated_at: parse_ts(11, &row.get::<_, String>("updated_at")?)?,
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledTask> {
    let work_id: String = row.get("work_id")?;
    let kind: String = row.get("kind")?;
    let status: String = row.get("status")?;
    let metadata: Option<String> = row.get("metadata")?;
    Ok(ScheduledTask {
        id: row.get("id")?,
        work_id: work_id
            .parse()
            .map_err(|e: uuid::Error| conv_err(1, e.to_string()))?,
        kind: SideEffectKind::parse(&kind)
            .ok_or_else(|| conv_err(2, format!("unknown task kind {kind:?}")))?,
        run_at: parse_ts(3, &row.get::<_, String>("run_at")?)?,
        metadata: match metadata {
            Some(s) => serde_json::from_str(&s).map_err(|e| conv_err(4, e.to_string()))?,
            None => serde_json::Value::Null,
        },
        idempotency_key: row.get("idempotency_key")?,
        attempts: row.get("attempts")?,
        max_attempts: row.get("max_attempts")?,
        status: EntryStatus::parse(&status)
            .ok_or_else(|| conv_err(8, format!("unknown task status {status:?}")))?,
        last_error: row.get("last_error")?,
        created_at: parse_ts(10, &row.get::<_, String>("created_at")?)?,
    })
}

/// Handle to the braid database.
///
/// Cheap to clone; all clones share one connection behind a mutex and one
/// change signal.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    changed: Arc<Notify>,
}

impl Store {
    /// Open (creating if needed) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "opened database");
        Self::from_connection(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            changed: Arc::new(Notify::new()),
        })
    }

    /// Signal raised after every mutation. The control plane awaits it to
    /// react to new queue entries without polling.
    pub fn change_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.changed)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn mark_changed(&self) {
        self.changed.notify_one();
    }

    /// Run `f` inside a transaction. The transaction commits when `f`
    /// returns Ok and rolls back on Err or panic.
    pub fn transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        drop(conn);
        self.mark_changed();
        Ok(value)
    }

    // ========== Works ==========

    pub fn insert_work(&self, work: &Work) -> Result<()> {
        self.conn().execute(
            "INSERT INTO works (id, branch, workspace_path, root_bead, status, last_error,
                                heartbeat_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                work.id.to_string(),
                work.branch,
                work.workspace_path,
                work.root_bead,
                work.status.as_str(),
                work.last_error,
                work.heartbeat_at.map(|t| t.to_rfc3339()),
                work.created_at.to_rfc3339(),
                work.updated_at.to_rfc3339(),
            ],
        )?;
        self.mark_changed();
        Ok(())
    }

    pub fn get_work(&self, id: WorkId) -> Result<Work> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM works WHERE id = ?1")?;
        let mut rows = stmt.query_map([id.to_string()], row_to_work)?;
        match rows.next() {
            Some(work) => Ok(work?),
            None => Err(Error::NotFound {
                kind: "work",
                id: id.to_string(),
            }),
        }
    }

    pub fn list_works(&self) -> Result<Vec<Work>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM works ORDER BY created_at")?;
        let works = stmt.query_map([], row_to_work)?.collect::<rusqlite::Result<_>>()?;
        Ok(works)
    }

    pub fn list_works_by_status(&self, status: WorkStatus) -> Result<Vec<Work>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT * FROM works WHERE status = ?1 ORDER BY created_at")?;
        let works = stmt
            .query_map([status.as_str()], row_to_work)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(works)
    }

    /// Apply a guarded status transition.
    ///
    /// The UPDATE only matches when the Work currently holds one of the
    /// `from` statuses. On zero rows the Work is re-read to distinguish a
    /// missing Work from a precondition failure; `action` names the
    /// attempted operation in that error.
    pub fn update_work_status(
        &self,
        id: WorkId,
        from: &[WorkStatus],
        to: WorkStatus,
        action: &'static str,
    ) -> Result<()> {
        let guard = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let changed = self.conn().execute(
            &format!(
                "UPDATE works SET status = ?1, updated_at = ?2
                 WHERE id = ?3 AND status IN ({guard})"
            ),
            rusqlite::params![to.as_str(), Utc::now().to_rfc3339(), id.to_string()],
        )?;
        if changed == 0 {
            let current = self.get_work(id)?;
            return Err(Error::Precondition {
                entity: "work",
                action,
                status: current.status.to_string(),
            });
        }
        debug!(work = %id.short(), to = %to, "work transition");
        self.mark_changed();
        Ok(())
    }

    pub fn set_work_error(&self, id: WorkId, error: Option<&str>) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE works SET last_error = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![error, Utc::now().to_rfc3339(), id.to_string()],
        )?;
        if changed == 0 {
            return Err(Error::NotFound {
                kind: "work",
                id: id.to_string(),
            });
        }
        self.mark_changed();
        Ok(())
    }

    pub fn set_workspace_path(&self, id: WorkId, path: &str) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE works SET workspace_path = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![path, Utc::now().to_rfc3339(), id.to_string()],
        )?;
        if changed == 0 {
            return Err(Error::NotFound {
                kind: "work",
                id: id.to_string(),
            });
        }
        self.mark_changed();
        Ok(())
    }

    pub fn record_heartbeat(&self, id: WorkId, at: DateTime<Utc>) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE works SET heartbeat_at = ?1, updated_at = ?1 WHERE id = ?2",
            rusqlite::params![at.to_rfc3339(), id.to_string()],
        )?;
        if changed == 0 {
            return Err(Error::NotFound {
                kind: "work",
                id: id.to_string(),
            });
        }
        self.mark_changed();
        Ok(())
    }

    /// Processing Works whose last heartbeat is older than `cutoff`.
    /// Works that never heartbeat are not reported.
    pub fn stale_processing_works(&self, cutoff: DateTime<Utc>) -> Result<Vec<Work>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM works
             WHERE status = 'processing' AND heartbeat_at IS NOT NULL AND heartbeat_at < ?1
             ORDER BY heartbeat_at",
        )?;
        let works = stmt
            .query_map([cutoff.to_rfc3339()], row_to_work)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(works)
    }

    /// Delete a Work and everything hanging off it: batches, batch members
    /// and dependencies via foreign keys, plus its queue entries.
    pub fn delete_work(&self, id: WorkId) -> Result<()> {
        let deleted = self.transaction(|conn| {
            conn.execute(
                "DELETE FROM scheduled_tasks WHERE work_id = ?1",
                [id.to_string()],
            )?;
            Ok(conn.execute("DELETE FROM works WHERE id = ?1", [id.to_string()])?)
        })?;
        if deleted == 0 {
            return Err(Error::NotFound {
                kind: "work",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    // ========== Batches ==========

    pub fn insert_batch(&self, batch: &Batch) -> Result<()> {
        self.transaction(|conn| {
            conn.execute(
                "INSERT INTO batches (id, work_id, name, kind, seq, score, tokens, oversized,
                                      status, error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                rusqlite::params![
                    batch.id.to_string(),
                    batch.work_id.to_string(),
                    batch.name,
                    batch.kind.as_str(),
                    batch.seq,
                    batch.score,
                    batch.tokens,
                    batch.oversized,
                    batch.status.as_str(),
                    batch.error,
                    batch.created_at.to_rfc3339(),
                    batch.updated_at.to_rfc3339(),
                ],
            )?;
            for (position, member) in batch.members.iter().enumerate() {
                conn.execute(
                    "INSERT INTO batch_beads (batch_id, bead_id, position, state)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![
                        batch.id.to_string(),
                        member.bead_id,
                        position as i64,
                        member.state.as_str(),
                    ],
                )?;
            }
            Ok(())
        })
    }

    pub fn insert_batch_dep(&self, batch: BatchId, depends_on: BatchId) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO batch_deps (batch_id, depends_on_batch_id) VALUES (?1, ?2)",
            rusqlite::params![batch.to_string(), depends_on.to_string()],
        )?;
        self.mark_changed();
        Ok(())
    }

    pub fn batch_dependencies(&self, batch: BatchId) -> Result<Vec<BatchId>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT depends_on_batch_id FROM batch_deps WHERE batch_id = ?1",
        )?;
        let ids = stmt
            .query_map([batch.to_string()], |row| {
                let id: String = row.get(0)?;
                id.parse()
                    .map_err(|e: uuid::Error| conv_err(0, e.to_string()))
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(ids)
    }

    fn load_members(conn: &Connection, batch: BatchId) -> Result<Vec<BatchMember>> {
        let mut stmt = conn.prepare(
            "SELECT bead_id, state FROM batch_beads WHERE batch_id = ?1 ORDER BY position",
        )?;
        let members = stmt
            .query_map([batch.to_string()], |row| {
                let bead_id: String = row.get(0)?;
                let state: String = row.get(1)?;
                Ok(BatchMember {
                    bead_id,
                    state: BeadState::parse(&state)
                        .ok_or_else(|| conv_err(1, format!("unknown bead state {state:?}")))?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(members)
    }

    pub fn get_batch(&self, id: BatchId) -> Result<Batch> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM batches WHERE id = ?1")?;
        let mut rows = stmt.query_map([id.to_string()], row_to_batch)?;
        match rows.next() {
            Some(batch) => {
                let mut batch = batch?;
                batch.members = Self::load_members(&conn, batch.id)?;
                Ok(batch)
            }
            None => Err(Error::NotFound {
                kind: "batch",
                id: id.to_string(),
            }),
        }
    }

    /// All batches of a Work in sequence order, members included.
    pub fn list_batches(&self, work_id: WorkId) -> Result<Vec<Batch>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT * FROM batches WHERE work_id = ?1 ORDER BY seq")?;
        let mut batches: Vec<Batch> = stmt
            .query_map([work_id.to_string()], row_to_batch)?
            .collect::<rusqlite::Result<_>>()?;
        for batch in &mut batches {
            batch.members = Self::load_members(&conn, batch.id)?;
        }
        Ok(batches)
    }

    pub fn update_batch_status(
        &self,
        id: BatchId,
        from: &[BatchStatus],
        to: BatchStatus,
        error: Option<&str>,
        action: &'static str,
    ) -> Result<()> {
        let guard = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let changed = self.conn().execute(
            &format!(
                "UPDATE batches SET status = ?1, error = ?2, updated_at = ?3
                 WHERE id = ?4 AND status IN ({guard})"
            ),
            rusqlite::params![to.as_str(), error, Utc::now().to_rfc3339(), id.to_string()],
        )?;
        if changed == 0 {
            let current = self.get_batch(id)?;
            return Err(Error::Precondition {
                entity: "batch",
                action,
                status: current.status.to_string(),
            });
        }
        debug!(batch = %id.short(), to = %to, "batch transition");
        self.mark_changed();
        Ok(())
    }

    pub fn set_bead_state(&self, batch: BatchId, bead_id: &str, state: BeadState) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE batch_beads SET state = ?1 WHERE batch_id = ?2 AND bead_id = ?3",
            rusqlite::params![state.as_str(), batch.to_string(), bead_id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound {
                kind: "batch bead",
                id: format!("{}/{bead_id}", batch.short()),
            });
        }
        self.mark_changed();
        Ok(())
    }

    /// Reset a batch's failed members to pending. Completed members keep
    /// their state so a re-run only redoes unfinished beads.
    pub fn reset_failed_members(&self, batch: BatchId) -> Result<()> {
        self.conn().execute(
            "UPDATE batch_beads SET state = 'pending' WHERE batch_id = ?1 AND state = 'failed'",
            [batch.to_string()],
        )?;
        self.mark_changed();
        Ok(())
    }

    /// The next runnable batch of a Work: lowest-sequence pending work-kind
    /// batch whose cross-batch dependencies are all completed.
    pub fn next_pending_batch(&self, work_id: WorkId) -> Result<Option<Batch>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM batches b
             WHERE b.work_id = ?1 AND b.kind = 'work' AND b.status = 'pending'
               AND NOT EXISTS (
                 SELECT 1 FROM batch_deps d
                 JOIN batches p ON p.id = d.depends_on_batch_id
                 WHERE d.batch_id = b.id AND p.status != 'completed'
               )
             ORDER BY b.seq LIMIT 1",
        )?;
        let mut rows = stmt.query_map([work_id.to_string()], row_to_batch)?;
        match rows.next() {
            Some(batch) => {
                let mut batch = batch?;
                batch.members = Self::load_members(&conn, batch.id)?;
                Ok(Some(batch))
            }
            None => Ok(None),
        }
    }

    /// Count of work-kind batches not yet completed. Zero means the Work's
    /// execution line is drained.
    pub fn count_unfinished_batches(&self, work_id: WorkId) -> Result<u32> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM batches
             WHERE work_id = ?1 AND kind = 'work' AND status != 'completed'",
            [work_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ========== Estimates ==========

    pub fn get_estimate(&self, bead_id: &str, descr_hash: &str) -> Result<Option<(u8, u32)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT score, tokens FROM estimates WHERE bead_id = ?1 AND descr_hash = ?2",
        )?;
        let mut rows = stmt.query_map(rusqlite::params![bead_id, descr_hash], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        match rows.next() {
            Some(pair) => Ok(Some(pair?)),
            None => Ok(None),
        }
    }

    /// Record an estimate. A new description hash replaces any estimate
    /// recorded under an older hash for the same bead.
    pub fn put_estimate(&self, bead_id: &str, descr_hash: &str, score: u8, tokens: u32) -> Result<()> {
        self.transaction(|conn| {
            conn.execute(
                "DELETE FROM estimates WHERE bead_id = ?1 AND descr_hash != ?2",
                rusqlite::params![bead_id, descr_hash],
            )?;
            conn.execute(
                "INSERT OR REPLACE INTO estimates (bead_id, descr_hash, score, tokens, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![bead_id, descr_hash, score, tokens, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Remove an estimate row. Used to roll a pending sentinel back when
    /// its dispatch never happened.
    pub fn delete_estimate(&self, bead_id: &str, descr_hash: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM estimates WHERE bead_id = ?1 AND descr_hash = ?2",
            rusqlite::params![bead_id, descr_hash],
        )?;
        self.mark_changed();
        Ok(())
    }

    /// Estimate-kind batches containing the bead that are still open.
    pub fn open_estimate_batches_for_bead(&self, bead_id: &str) -> Result<Vec<BatchId>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT b.id FROM batches b
             JOIN batch_beads m ON m.batch_id = b.id
             WHERE m.bead_id = ?1 AND b.kind = 'estimate'
               AND b.status IN ('pending', 'processing')",
        )?;
        let ids = stmt
            .query_map([bead_id], |row| {
                let id: String = row.get(0)?;
                id.parse()
                    .map_err(|e: uuid::Error| conv_err(0, e.to_string()))
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(ids)
    }

    // ========== Scheduled Tasks ==========

    /// Insert a queue entry unless one with the same (work, idempotency key)
    /// already exists. Returns whether a row was inserted.
    pub fn schedule_task(&self, task: &ScheduledTask) -> Result<bool> {
        let changed = self.conn().execute(
            "INSERT INTO scheduled_tasks (work_id, kind, run_at, metadata, idempotency_key,
                                          attempts, max_attempts, status, last_error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (work_id, idempotency_key) DO NOTHING",
            rusqlite::params![
                task.work_id.to_string(),
                task.kind.as_str(),
                task.run_at.to_rfc3339(),
                if task.metadata.is_null() {
                    None
                } else {
                    Some(task.metadata.to_string())
                },
                task.idempotency_key,
                task.attempts,
                task.max_attempts,
                task.status.as_str(),
                task.last_error,
                task.created_at.to_rfc3339(),
            ],
        )?;
        if changed > 0 {
            debug!(work = %task.work_id.short(), kind = task.kind.as_str(), "scheduled task");
            self.mark_changed();
        }
        Ok(changed > 0)
    }

    pub fn get_task(&self, id: i64) -> Result<ScheduledTask> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM scheduled_tasks WHERE id = ?1")?;
        let mut rows = stmt.query_map([id], row_to_task)?;
        match rows.next() {
            Some(task) => Ok(task?),
            None => Err(Error::NotFound {
                kind: "scheduled task",
                id: id.to_string(),
            }),
        }
    }

    pub fn tasks_for_work(&self, work_id: WorkId) -> Result<Vec<ScheduledTask>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT * FROM scheduled_tasks WHERE work_id = ?1 ORDER BY id")?;
        let tasks = stmt
            .query_map([work_id.to_string()], row_to_task)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(tasks)
    }

    /// Pending entries whose run_at has passed, oldest due first.
    pub fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM scheduled_tasks
             WHERE status = 'pending' AND run_at <= ?1
             ORDER BY run_at, id",
        )?;
        let tasks = stmt
            .query_map([now.to_rfc3339()], row_to_task)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(tasks)
    }

    /// Move a pending entry to running. Returns false when another claimer
    /// got there first or the entry is no longer pending.
    pub fn claim_task(&self, id: i64) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE scheduled_tasks SET status = 'running' WHERE id = ?1 AND status = 'pending'",
            [id],
        )?;
        Ok(changed > 0)
    }

    pub fn complete_task(&self, id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE scheduled_tasks SET status = 'completed', last_error = NULL WHERE id = ?1",
            [id],
        )?;
        self.mark_changed();
        Ok(())
    }

    /// Return a running entry to pending for a later retry, bumping its
    /// attempt count and recording the failure.
    pub fn retry_task(&self, id: i64, run_at: DateTime<Utc>, error: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE scheduled_tasks
             SET status = 'pending', attempts = attempts + 1, run_at = ?1, last_error = ?2
             WHERE id = ?3",
            rusqlite::params![run_at.to_rfc3339(), error, id],
        )?;
        self.mark_changed();
        Ok(())
    }

    /// Mark a running entry permanently failed.
    pub fn fail_task(&self, id: i64, error: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE scheduled_tasks
             SET status = 'failed', attempts = attempts + 1, last_error = ?1
             WHERE id = ?2",
            rusqlite::params![error, id],
        )?;
        self.mark_changed();
        Ok(())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}
