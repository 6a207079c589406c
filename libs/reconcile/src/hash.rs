//! Spec hashing used to tell in-place changes from destructive ones.

use serde::Serialize;
use sha2::{Digest, Sha256};

use convoy_structs::{Job, TaskGroup};

use crate::ReconcileError;

/// A spec hash for deterministic comparison.
///
/// Values go through `serde_json::Value` first, whose maps keep keys
/// sorted, so field and map ordering never affects the hash.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    pub fn from_json(json: &serde_json::Value) -> Result<Self, ReconcileError> {
        let bytes = serde_json::to_vec(json)?;
        let digest = Sha256::digest(&bytes);
        Ok(Self(format!("sha256:{}", hex::encode(&digest[..16]))))
    }

    /// Hash any serializable value.
    pub fn of<T: Serialize>(value: &T) -> Result<Self, ReconcileError> {
        Self::from_json(&serde_json::to_value(value)?)
    }

    /// Hash of the parts of a task group that can't change under a
    /// running allocation.
    pub fn destructive_view(job: &Job, group: &TaskGroup) -> Result<Self, ReconcileError> {
        Self::of(&DestructiveView {
            datacenters: &job.datacenters,
            node_pool: &job.node_pool,
            job_constraints: &job.constraints,
            job_affinities: &job.affinities,
            job_spreads: &job.spreads,
            group_constraints: &group.constraints,
            group_affinities: &group.affinities,
            group_spreads: &group.spreads,
            tasks: &group.tasks,
            ephemeral_disk: &group.ephemeral_disk,
            networks: &group.networks,
            volumes: &group.volumes,
            meta: &group.meta,
        })
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Serialize)]
struct DestructiveView<'a> {
    datacenters: &'a [String],
    node_pool: &'a str,
    job_constraints: &'a [convoy_structs::Constraint],
    job_affinities: &'a [convoy_structs::Affinity],
    job_spreads: &'a [convoy_structs::Spread],
    group_constraints: &'a [convoy_structs::Constraint],
    group_affinities: &'a [convoy_structs::Affinity],
    group_spreads: &'a [convoy_structs::Spread],
    tasks: &'a [convoy_structs::Task],
    ephemeral_disk: &'a convoy_structs::EphemeralDisk,
    networks: &'a [convoy_structs::NetworkResource],
    volumes: &'a std::collections::BTreeMap<String, convoy_structs::VolumeRequest>,
    meta: &'a std::collections::BTreeMap<String, String>,
}

/// Whether moving an allocation of `group` from `old` to `new` requires
/// replacing it. Count, update and reschedule settings never do.
///
/// A group that can't be hashed, or that is missing from either version,
/// is treated as changed.
pub fn tasks_updated(old: &Job, new: &Job, group: &str) -> bool {
    let (Some(old_tg), Some(new_tg)) = (old.lookup_task_group(group), new.lookup_task_group(group))
    else {
        return true;
    };
    match (
        SpecHash::destructive_view(old, old_tg),
        SpecHash::destructive_view(new, new_tg),
    ) {
        (Ok(a), Ok(b)) => a != b,
        _ => true,
    }
}
