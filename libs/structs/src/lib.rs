//! # convoy-structs
//!
//! Data model shared by the reconciler and the scheduler.
//!
//! ## Shape
//!
//! - A [`Job`] declares task groups and how many instances of each to run.
//! - A [`Node`] advertises capacity, drivers, volumes and a computed class.
//! - An [`Allocation`] binds one task group instance to one node.
//! - An [`Evaluation`] is a unit of scheduling work for one job.
//! - A [`Plan`] is what one evaluation wants committed.
//!
//! Everything here is plain data plus pure helpers: resource arithmetic
//! ([`allocs_fit`], fit scores), constraint evaluation and port/device
//! accounting. Nothing reads the clock or touches shared state.

mod alloc;
mod config;
mod constraint;
mod deployment;
mod devices;
mod error;
mod eval;
mod funcs;
mod job;
mod metrics;
mod network;
mod node;
mod plan;
mod resources;
mod volume;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use alloc::*;
pub use config::*;
pub use constraint::*;
pub use deployment::*;
pub use devices::DeviceAccounter;
pub use error::{Result, StructsError};
pub use eval::*;
pub use funcs::*;
pub use job::*;
pub use metrics::*;
pub use network::{NetworkIndex, NetworkOffer};
pub use node::*;
pub use plan::*;
pub use resources::*;
pub use volume::*;

pub(crate) fn default_true() -> bool {
    true
}
