//! Integration test suite for braid.
//!
//! These tests exercise the engine end to end over an in-memory store:
//! estimation through planning, plan attachment, batch execution, failure
//! and restart, and the scheduled task queue with its control plane.
//!
//! # Test Categories
//!
//! - `planning`: estimate-then-plan flows and plan persistence
//! - `execution`: the happy path from created Work to finalization
//! - `recovery`: bead failure, restart, and session liveness
//! - `queue`: idempotency, retry, and durability of scheduled tasks
//!
//! All agent and infrastructure capabilities are mocked; nothing talks to
//! a real tracker, workspace, or session.


mod execution;
mod planning;
mod queue;
mod recovery;
