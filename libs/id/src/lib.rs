//! # convoy-id
//!
//! Typed identifiers for the scheduling engine.
//!
//! Every identifier renders as `{prefix}_{ulid}`:
//!
//! - `node_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `alloc_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `eval_01HV4Z4NYPLTRS0JTUA8XDME5F`
//! - `dep_01HV4Z5PZQMVST1KVWB9YENF6G`
//!
//! The prefix keeps node, allocation, evaluation and deployment IDs from
//! being mixed up, and the ULID gives a total order that the scheduler uses
//! to break score ties deterministically.
//!
//! Jobs are not listed here: a job is addressed by its user-chosen
//! `(namespace, id)` pair.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

pub use ulid::Ulid;
