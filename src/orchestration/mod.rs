//! Orchestration layer: estimation, planning, the lifecycle state machine,
//! and the control plane that executes side effects.

pub mod control;
pub mod estimate;
pub mod lifecycle;
pub mod planner;

pub use control::ControlPlane;
pub use estimate::{Estimate, EstimateCache, EstimateOutcome};
pub use lifecycle::Lifecycle;
pub use planner::{plan, Plan, PlannedBatch};
