//! Core data model and algorithms: beads, the dependency graph, batches,
//! and Works.

pub mod batch;
pub mod bead;
pub mod graph;
pub mod queue;
pub mod work;

pub use batch::{Batch, BatchId, BatchKind, BatchMember, BatchStatus, BeadState};
pub use bead::{Bead, BeadKind, BeadStatus, Relation, RelationKind};
pub use graph::DependencyGraph;
pub use queue::{EntryStatus, ScheduledTask, SideEffectKind};
pub use work::{Work, WorkId, WorkStatus};
