//! Port and bandwidth bookkeeping for a single node.

use std::collections::BTreeSet;

use crate::{AllocatedPort, Allocation, NetworkResource, Node};

/// Tracks ports and bandwidth in use on one node.
#[derive(Debug, Clone)]
pub struct NetworkIndex {
    used_ports: BTreeSet<u16>,
    used_mbits: u32,
    available_mbits: u32,
    min_dynamic_port: u16,
    max_dynamic_port: u16,
}

impl NetworkIndex {
    /// Seeds the index with the node's own reserved ports.
    pub fn new(node: &Node) -> Self {
        Self {
            used_ports: node.reserved.reserved_ports.iter().copied().collect(),
            used_mbits: 0,
            available_mbits: node.resources.network_mbits,
            min_dynamic_port: node.resources.min_dynamic_port,
            max_dynamic_port: node.resources.max_dynamic_port,
        }
    }

    /// Adds the ports of live allocations. Returns `true` on collision.
    pub fn add_allocs<'a, I>(&mut self, allocs: I) -> bool
    where
        I: IntoIterator<Item = &'a Allocation>,
    {
        let mut collide = false;
        for alloc in allocs {
            if alloc.client_terminal_status() {
                continue;
            }
            self.used_mbits += alloc.allocated_resources.shared.mbits;
            for port in &alloc.allocated_resources.shared.ports {
                if !self.used_ports.insert(port.value) {
                    collide = true;
                }
            }
        }
        collide
    }

    pub fn add_reserved(&mut self, ports: &[AllocatedPort]) -> bool {
        let mut collide = false;
        for port in ports {
            if !self.used_ports.insert(port.value) {
                collide = true;
            }
        }
        collide
    }

    pub fn overcommitted(&self) -> bool {
        self.used_mbits > self.available_mbits
    }

    pub fn is_port_used(&self, port: u16) -> bool {
        self.used_ports.contains(&port)
    }

    /// Assigns the group's static and dynamic ports without mutating the index.
    ///
    /// Dynamic ports are picked lowest-first from the node's dynamic range so
    /// repeated attempts produce the same offer.
    pub fn assign_ports(&self, asks: &[NetworkResource]) -> Result<NetworkOffer, &'static str> {
        let mut taken = self.used_ports.clone();
        let mut offer = NetworkOffer::default();

        for ask in asks {
            offer.mbits += ask.mbits;
            for port in &ask.reserved_ports {
                if !taken.insert(port.value) {
                    return Err("reserved port collision");
                }
                offer.ports.push(AllocatedPort {
                    label: port.label.clone(),
                    value: port.value,
                });
            }
        }

        for ask in asks {
            for port in &ask.dynamic_ports {
                let Some(value) = (self.min_dynamic_port..=self.max_dynamic_port)
                    .find(|candidate| !taken.contains(candidate))
                else {
                    return Err("dynamic port selection failed");
                };
                taken.insert(value);
                offer.ports.push(AllocatedPort {
                    label: port.label.clone(),
                    value,
                });
            }
        }

        if self.used_mbits + offer.mbits > self.available_mbits {
            return Err("bandwidth exceeded");
        }
        Ok(offer)
    }
}

/// Ports and bandwidth granted to a placement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkOffer {
    pub ports: Vec<AllocatedPort>,
    pub mbits: u32,
}
