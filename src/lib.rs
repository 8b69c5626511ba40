//! braid: a task orchestration engine for agent-driven software changes.
//!
//! Tracker issues ("beads") are grouped into budget-bounded batches by a
//! dependency-aware planner, attached to a Work (a branch plus an isolated
//! workspace), and executed batch by batch through agent sessions. A
//! persistent scheduled task queue carries every side effect with
//! idempotency and retry, and a reactive control plane drains it.
//!
//! The crate is a library: embed it by opening a [`store::Store`], wiring
//! real [`caps::Capabilities`], and running an
//! [`orchestration::ControlPlane`] alongside the
//! [`orchestration::Lifecycle`] operations.

pub mod caps;
pub mod config;
pub mod core;
pub mod error;
pub mod orchestration;
pub mod store;

pub use error::{Error, Result};
