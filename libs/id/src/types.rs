//! Identifier types used across the engine.

use crate::define_id;

define_id!(NodeId, "node");
define_id!(AllocId, "alloc");
define_id!(EvalId, "eval");
define_id!(DeploymentId, "dep");
