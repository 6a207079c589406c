//! Desired-state reconciliation for the convoy scheduler.
//!
//! The reconciler diffs a job against the allocations it has and emits the
//! placements, stops and updates that converge the two. Key pieces:
//!
//! - [`AllocSet`]: allocations keyed by ID, with the classifications the
//!   reconciler applies (tainted node, reschedulable, deployment).
//! - [`AllocNameIndex`]: hands out `job.group[i]` names without reuse.
//! - [`reschedule`]: whether and when a failed allocation is replaced.
//! - [`AllocReconciler`]: the per-group decision procedure.
//! - [`SpecHash`]: tells in-place changes from destructive ones.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs, including `now`.
//! - No two allocations of a group ever share a name after the results
//!   are applied.
//! - Nothing in this crate reads the clock or mutates shared state.

mod allocs;
mod hash;
mod names;
mod reconciler;
pub mod reschedule;

use thiserror::Error;

pub use allocs::{
    AllocSet, DelayedReschedule, RescheduleSplit, TaintedNodes, TaintedSplit,
};
pub use hash::{tasks_updated, SpecHash};
pub use names::AllocNameIndex;
pub use reconciler::{
    update_by_spec, AllocDestructiveResult, AllocPlaceResult, AllocReconciler,
    AllocStopResult, ReconcileResults, UpdateFn, UpdateType,
};

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A spec could not be rendered for hashing.
    #[error("spec hash: {0}")]
    Hash(#[from] serde_json::Error),
}
