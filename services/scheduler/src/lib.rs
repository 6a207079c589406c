//! convoy scheduler library.
//!
//! This crate ships the `convoy-scheduler` binary, and exposes the drivers,
//! the in-memory store and the test harness as a library for integration
//! testing and embedding.

pub mod blocked;
pub mod broker;
pub mod config;
pub mod context;
pub mod error;
pub mod feasible;
pub mod fixture;
pub mod generic;
pub mod preemption;
pub mod rank;
pub mod scheduler;
pub mod server;
pub mod stack;
pub mod state;
pub mod system;
pub mod testing;
pub mod worker;

pub use error::{Result, SchedulerError};
pub use scheduler::{new_scheduler, Clock, Planner, Scheduler, SystemClock};
pub use server::Server;
pub use state::{MemStore, State};
