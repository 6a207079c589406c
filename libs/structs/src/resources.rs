//! Resource vectors for tasks, nodes and allocations.
//!
//! Asks (`Resources`) are what a task requests, node capacity is described
//! by `NodeResources` minus `NodeReservedResources`, and what the scheduler
//! actually handed out lives in `AllocatedResources`. All three flatten into
//! `ComparableResources` for fit checks.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// A named port. `value == 0` on a dynamic ask means "pick one".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub label: String,
    #[serde(default)]
    pub value: u16,
}

impl Port {
    pub fn new(label: impl Into<String>, value: u16) -> Self {
        Self {
            label: label.into(),
            value,
        }
    }
}

/// Network ask for a task group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkResource {
    #[serde(default = "default_network_mode")]
    pub mode: String,
    #[serde(default)]
    pub mbits: u32,
    #[serde(default)]
    pub reserved_ports: Vec<Port>,
    #[serde(default)]
    pub dynamic_ports: Vec<Port>,
}

fn default_network_mode() -> String {
    "host".to_string()
}

/// A device request: `type`, `vendor/type` or `vendor/type/name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedDevice {
    pub name: String,
    #[serde(default = "default_device_count")]
    pub count: u32,
}

fn default_device_count() -> u32 {
    1
}

impl RequestedDevice {
    /// Splits the request into (vendor, type, name), any of which may be absent.
    pub fn id_parts(&self) -> (Option<&str>, &str, Option<&str>) {
        let parts: Vec<&str> = self.name.split('/').collect();
        match parts.as_slice() {
            [device_type] => (None, device_type, None),
            [vendor, device_type] => (Some(vendor), device_type, None),
            [vendor, device_type, name, ..] => (Some(vendor), device_type, Some(name)),
            [] => (None, "", None),
        }
    }
}

/// Resources requested by a single task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// CPU in MHz-equivalent shares.
    #[serde(default)]
    pub cpu: u64,
    /// Whole cores pinned to the task. Overrides `cpu` when non-zero.
    #[serde(default)]
    pub cores: u32,
    #[serde(default)]
    pub memory_mb: u64,
    /// Soft ceiling used when memory oversubscription is enabled.
    #[serde(default)]
    pub memory_max_mb: u64,
    #[serde(default)]
    pub devices: Vec<RequestedDevice>,
}

/// One fingerprinted device instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDevice {
    pub id: String,
    #[serde(default = "crate::default_true")]
    pub healthy: bool,
}

/// A homogeneous group of devices on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDeviceResource {
    pub vendor: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub name: String,
    #[serde(default)]
    pub instances: Vec<NodeDevice>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl NodeDeviceResource {
    /// Whether this group can serve the request's identifier.
    pub fn matches(&self, request: &RequestedDevice) -> bool {
        let (vendor, device_type, name) = request.id_parts();
        if device_type != self.device_type {
            return false;
        }
        if vendor.is_some_and(|v| v != self.vendor) {
            return false;
        }
        name.is_none_or(|n| n == self.name)
    }

    pub fn key(&self) -> DeviceKey {
        DeviceKey {
            vendor: self.vendor.clone(),
            device_type: self.device_type.clone(),
            name: self.name.clone(),
        }
    }

    pub fn healthy_ids(&self) -> impl Iterator<Item = &str> {
        self.instances
            .iter()
            .filter(|d| d.healthy)
            .map(|d| d.id.as_str())
    }
}

/// Fully qualified device group identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceKey {
    pub vendor: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub name: String,
}

impl std::fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.vendor, self.device_type, self.name)
    }
}

/// Total capacity a node advertises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResources {
    pub cpu_shares: u64,
    /// Number of schedulable cores, numbered `0..total_cores`.
    #[serde(default)]
    pub total_cores: u32,
    pub memory_mb: u64,
    pub disk_mb: u64,
    #[serde(default = "default_node_mbits")]
    pub network_mbits: u32,
    #[serde(default)]
    pub devices: Vec<NodeDeviceResource>,
    #[serde(default = "default_min_dynamic_port")]
    pub min_dynamic_port: u16,
    #[serde(default = "default_max_dynamic_port")]
    pub max_dynamic_port: u16,
}

fn default_node_mbits() -> u32 {
    1000
}

fn default_min_dynamic_port() -> u16 {
    20000
}

fn default_max_dynamic_port() -> u16 {
    32000
}

impl Default for NodeResources {
    fn default() -> Self {
        Self {
            cpu_shares: 4000,
            total_cores: 4,
            memory_mb: 8192,
            disk_mb: 100 * 1024,
            network_mbits: default_node_mbits(),
            devices: Vec::new(),
            min_dynamic_port: default_min_dynamic_port(),
            max_dynamic_port: default_max_dynamic_port(),
        }
    }
}

impl NodeResources {
    /// CPU shares backing one core.
    pub fn shares_per_core(&self) -> u64 {
        if self.total_cores == 0 {
            0
        } else {
            self.cpu_shares / u64::from(self.total_cores)
        }
    }
}

/// Capacity held back for the node's own processes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReservedResources {
    #[serde(default)]
    pub cpu_shares: u64,
    #[serde(default)]
    pub cores: Vec<u32>,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub disk_mb: u64,
    #[serde(default)]
    pub reserved_ports: Vec<u16>,
}

/// Device instances handed to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedDevice {
    #[serde(flatten)]
    pub key: DeviceKey,
    pub device_ids: Vec<String>,
}

/// Per-task share of an allocation's resources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedTaskResources {
    pub cpu_shares: u64,
    #[serde(default)]
    pub reserved_cores: Vec<u32>,
    pub memory_mb: u64,
    #[serde(default)]
    pub memory_max_mb: u64,
    #[serde(default)]
    pub devices: Vec<AllocatedDevice>,
}

/// A port bound on the node for the allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedPort {
    pub label: String,
    pub value: u16,
}

/// Group-wide allocated resources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedSharedResources {
    #[serde(default)]
    pub disk_mb: u64,
    #[serde(default)]
    pub ports: Vec<AllocatedPort>,
    #[serde(default)]
    pub mbits: u32,
}

/// Everything the scheduler assigned to one allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedResources {
    #[serde(default)]
    pub tasks: BTreeMap<String, AllocatedTaskResources>,
    #[serde(default)]
    pub shared: AllocatedSharedResources,
}

impl AllocatedResources {
    pub fn comparable(&self) -> ComparableResources {
        let mut c = ComparableResources {
            disk_mb: self.shared.disk_mb,
            ..Default::default()
        };
        for task in self.tasks.values() {
            c.cpu_shares += task.cpu_shares;
            c.memory_mb += task.memory_mb;
            c.memory_max_mb += task.memory_max_mb.max(task.memory_mb);
            c.reserved_cores.extend(task.reserved_cores.iter().copied());
        }
        c
    }

    pub fn reserved_cores(&self) -> impl Iterator<Item = u32> + '_ {
        self.tasks
            .values()
            .flat_map(|t| t.reserved_cores.iter().copied())
    }

    pub fn devices(&self) -> impl Iterator<Item = &AllocatedDevice> {
        self.tasks.values().flat_map(|t| t.devices.iter())
    }
}

/// Flattened resource vector used for arithmetic and fit checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparableResources {
    pub cpu_shares: u64,
    pub reserved_cores: BTreeSet<u32>,
    pub memory_mb: u64,
    pub memory_max_mb: u64,
    pub disk_mb: u64,
}

impl ComparableResources {
    pub fn add(&mut self, other: &ComparableResources) {
        self.cpu_shares += other.cpu_shares;
        self.memory_mb += other.memory_mb;
        self.memory_max_mb += other.memory_max_mb;
        self.disk_mb += other.disk_mb;
        self.reserved_cores
            .extend(other.reserved_cores.iter().copied());
    }

    pub fn subtract(&mut self, other: &ComparableResources) {
        self.cpu_shares = self.cpu_shares.saturating_sub(other.cpu_shares);
        self.memory_mb = self.memory_mb.saturating_sub(other.memory_mb);
        self.memory_max_mb = self.memory_max_mb.saturating_sub(other.memory_max_mb);
        self.disk_mb = self.disk_mb.saturating_sub(other.disk_mb);
        for core in &other.reserved_cores {
            self.reserved_cores.remove(core);
        }
    }

    /// Checks that `self` covers `other`, returning the first short dimension.
    pub fn superset(&self, other: &ComparableResources) -> Result<(), &'static str> {
        if self.cpu_shares < other.cpu_shares {
            return Err("cpu");
        }
        if !other.reserved_cores.is_subset(&self.reserved_cores) {
            return Err("cores");
        }
        if self.memory_mb < other.memory_mb {
            return Err("memory");
        }
        if self.disk_mb < other.disk_mb {
            return Err("disk");
        }
        Ok(())
    }

    /// Rough magnitude used to order preemption victims.
    pub fn size(&self) -> u64 {
        self.cpu_shares + self.memory_mb + self.disk_mb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_request_matching() {
        let gpu = NodeDeviceResource {
            vendor: "nvidia".into(),
            device_type: "gpu".into(),
            name: "1080ti".into(),
            instances: vec![],
            attributes: BTreeMap::new(),
        };

        let by_type = RequestedDevice { name: "gpu".into(), count: 1 };
        let by_vendor = RequestedDevice { name: "nvidia/gpu".into(), count: 1 };
        let by_name = RequestedDevice { name: "nvidia/gpu/1080ti".into(), count: 1 };
        let wrong = RequestedDevice { name: "amd/gpu".into(), count: 1 };
        let fpga = RequestedDevice { name: "fpga".into(), count: 1 };

        assert!(gpu.matches(&by_type));
        assert!(gpu.matches(&by_vendor));
        assert!(gpu.matches(&by_name));
        assert!(!gpu.matches(&wrong));
        assert!(!gpu.matches(&fpga));
    }

    #[test]
    fn test_superset_reports_dimension() {
        let capacity = ComparableResources {
            cpu_shares: 1000,
            memory_mb: 1024,
            disk_mb: 1000,
            ..Default::default()
        };
        let mut ask = capacity.clone();
        assert!(capacity.superset(&ask).is_ok());

        ask.memory_mb = 2048;
        assert_eq!(capacity.superset(&ask), Err("memory"));

        ask.memory_mb = 10;
        ask.reserved_cores.insert(3);
        assert_eq!(capacity.superset(&ask), Err("cores"));
    }

    #[test]
    fn test_comparable_uses_memory_floor_for_max() {
        let mut allocated = AllocatedResources::default();
        allocated.tasks.insert(
            "web".into(),
            AllocatedTaskResources {
                cpu_shares: 500,
                memory_mb: 256,
                memory_max_mb: 0,
                ..Default::default()
            },
        );
        let c = allocated.comparable();
        assert_eq!(c.memory_max_mb, 256);
        assert_eq!(c.cpu_shares, 500);
    }
}
