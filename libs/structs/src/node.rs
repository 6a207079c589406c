//! Worker nodes and their scheduling-relevant identity.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use convoy_id::NodeId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{ComparableResources, NodeReservedResources, NodeResources, DEFAULT_NODE_POOL};

/// Liveness of a node as seen by the servers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Initializing,
    Ready,
    Down,
    Disconnected,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Initializing => "initializing",
            NodeStatus::Ready => "ready",
            NodeStatus::Down => "down",
            NodeStatus::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingEligibility {
    #[default]
    Eligible,
    Ineligible,
}

/// Present while a node is being drained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainStrategy {
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ignore_system_jobs: bool,
}

/// Task driver capability advertised by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverInfo {
    #[serde(default = "crate::default_true")]
    pub detected: bool,
    #[serde(default = "crate::default_true")]
    pub healthy: bool,
}

impl Default for DriverInfo {
    fn default() -> Self {
        Self {
            detected: true,
            healthy: true,
        }
    }
}

/// Directory exposed by the node for host volume mounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostVolume {
    pub path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// CSI node plugin fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsiNodeInfo {
    #[serde(default = "crate::default_true")]
    pub healthy: bool,
    /// Concurrent volume mount limit; zero means unlimited.
    #[serde(default)]
    pub max_volumes: u32,
    /// Topology segments this node can reach.
    #[serde(default)]
    pub segments: BTreeMap<String, String>,
}

/// A worker machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub datacenter: String,
    #[serde(default)]
    pub node_class: String,
    #[serde(default = "default_pool")]
    pub node_pool: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: NodeResources,
    #[serde(default)]
    pub reserved: NodeReservedResources,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub scheduling_eligibility: SchedulingEligibility,
    #[serde(default)]
    pub drain: Option<DrainStrategy>,
    #[serde(default)]
    pub drivers: BTreeMap<String, DriverInfo>,
    #[serde(default)]
    pub host_volumes: BTreeMap<String, HostVolume>,
    #[serde(default)]
    pub csi_node_plugins: BTreeMap<String, CsiNodeInfo>,
    /// Hash of the non-unique identity; see [`Node::compute_class`].
    #[serde(default)]
    pub computed_class: String,
    #[serde(default)]
    pub status_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

fn default_pool() -> String {
    DEFAULT_NODE_POOL.to_string()
}

impl Node {
    /// Whether new work may land on this node.
    pub fn ready(&self) -> bool {
        self.status == NodeStatus::Ready
            && self.drain.is_none()
            && self.scheduling_eligibility == SchedulingEligibility::Eligible
    }

    pub fn draining(&self) -> bool {
        self.drain.is_some()
    }

    pub fn terminal_status(&self) -> bool {
        self.status == NodeStatus::Down
    }

    /// Capacity left for allocations once the node's reservation is removed.
    pub fn comparable_capacity(&self) -> ComparableResources {
        let mut cores: std::collections::BTreeSet<u32> = (0..self.resources.total_cores).collect();
        for core in &self.reserved.cores {
            cores.remove(core);
        }
        ComparableResources {
            cpu_shares: self
                .resources
                .cpu_shares
                .saturating_sub(self.reserved.cpu_shares),
            reserved_cores: cores,
            memory_mb: self
                .resources
                .memory_mb
                .saturating_sub(self.reserved.memory_mb),
            memory_max_mb: 0,
            disk_mb: self.resources.disk_mb.saturating_sub(self.reserved.disk_mb),
        }
    }

    /// Recomputes `computed_class` from the node's non-unique identity.
    ///
    /// Nodes sharing a class are interchangeable for any constraint that
    /// does not read `unique.*` targets, which lets feasibility results be
    /// cached per class.
    pub fn compute_class(&mut self) {
        self.computed_class = self.class_hash();
    }

    fn class_hash(&self) -> String {
        let attributes: BTreeMap<&str, &str> = self
            .attributes
            .iter()
            .filter(|(k, _)| !k.starts_with("unique."))
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let meta: BTreeMap<&str, &str> = self
            .meta
            .iter()
            .filter(|(k, _)| !k.starts_with("unique."))
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let drivers: BTreeMap<&str, bool> = self
            .drivers
            .iter()
            .map(|(k, d)| (k.as_str(), d.detected && d.healthy))
            .collect();

        let identity = serde_json::json!({
            "datacenter": self.datacenter,
            "class": self.node_class,
            "pool": self.node_pool,
            "attributes": attributes,
            "meta": meta,
            "drivers": drivers,
        });

        let mut hasher = Sha256::new();
        hasher.update(identity.to_string().as_bytes());
        format!("v1:{}", hex::encode(&hasher.finalize()[..8]))
    }
}

/// Scheduler settings that apply to one node pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePoolSchedulerConfiguration {
    #[serde(default)]
    pub scheduler_algorithm: Option<crate::SchedulerAlgorithm>,
    #[serde(default)]
    pub memory_oversubscription_enabled: Option<bool>,
}

/// Named group of nodes jobs can target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub scheduler_configuration: Option<NodePoolSchedulerConfiguration>,
}
