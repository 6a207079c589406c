//! Device instance accounting for a single node.

use std::collections::{BTreeMap, BTreeSet};

use crate::{Allocation, DeviceKey, Node, RequestedDevice};

/// Tracks which device instances on a node are already claimed.
#[derive(Debug, Clone, Default)]
pub struct DeviceAccounter {
    devices: BTreeMap<DeviceKey, DeviceInstances>,
}

#[derive(Debug, Clone, Default)]
struct DeviceInstances {
    healthy: Vec<String>,
    used: BTreeMap<String, u32>,
}

impl DeviceAccounter {
    pub fn new(node: &Node) -> Self {
        let devices = node
            .resources
            .devices
            .iter()
            .map(|group| {
                (
                    group.key(),
                    DeviceInstances {
                        healthy: group.healthy_ids().map(str::to_string).collect(),
                        used: BTreeMap::new(),
                    },
                )
            })
            .collect();
        Self { devices }
    }

    /// Claims every device held by live allocations. Returns `true` if any
    /// instance ends up claimed twice or is unknown to the node.
    pub fn add_allocs<'a, I>(&mut self, allocs: I) -> bool
    where
        I: IntoIterator<Item = &'a Allocation>,
    {
        let mut collision = false;
        for alloc in allocs {
            if alloc.client_terminal_status() {
                continue;
            }
            for device in alloc.allocated_resources.devices() {
                let Some(instances) = self.devices.get_mut(&device.key) else {
                    collision = true;
                    continue;
                };
                for id in &device.device_ids {
                    let count = instances.used.entry(id.clone()).or_insert(0);
                    *count += 1;
                    if *count > 1 {
                        collision = true;
                    }
                }
            }
        }
        collision
    }

    /// Picks free, healthy instances for a request, without claiming them.
    ///
    /// Groups are tried in key order so the choice is deterministic.
    pub fn offer(
        &self,
        node: &Node,
        request: &RequestedDevice,
        exclude: &BTreeSet<(DeviceKey, String)>,
    ) -> Option<(DeviceKey, Vec<String>)> {
        let count = request.count as usize;
        for group in node.resources.devices.iter().filter(|g| g.matches(request)) {
            let key = group.key();
            let Some(instances) = self.devices.get(&key) else {
                continue;
            };
            let free: Vec<String> = instances
                .healthy
                .iter()
                .filter(|id| !instances.used.contains_key(*id))
                .filter(|id| !exclude.contains(&(key.clone(), (*id).clone())))
                .take(count)
                .cloned()
                .collect();
            if free.len() == count {
                return Some((key, free));
            }
        }
        None
    }

    pub fn claim(&mut self, key: &DeviceKey, ids: &[String]) {
        if let Some(instances) = self.devices.get_mut(key) {
            for id in ids {
                *instances.used.entry(id.clone()).or_insert(0) += 1;
            }
        }
    }
}
