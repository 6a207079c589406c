//! Resource fit checks and fit scores.

use crate::{Allocation, ComparableResources, DeviceAccounter, NetworkIndex, Node};

/// Upper bound of [`score_fit_binpack`] and [`score_fit_spread`].
pub const MAX_FIT_SCORE: f64 = 18.0;

/// Outcome of checking a set of allocations against a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FitResult {
    pub fit: bool,
    /// First exhausted dimension when `fit` is false.
    pub dimension: &'static str,
    /// Sum of the live allocations' resources.
    pub used: ComparableResources,
}

/// Checks whether `allocs` fit together on `node`. Client-terminal
/// allocations hold no resources and are skipped.
pub fn allocs_fit<'a, I>(node: &Node, allocs: I, check_devices: bool) -> FitResult
where
    I: IntoIterator<Item = &'a Allocation> + Clone,
{
    let mut used = ComparableResources::default();
    let mut cores_overlap = false;
    for alloc in allocs.clone() {
        if alloc.client_terminal_status() {
            continue;
        }
        let c = alloc.comparable_resources();
        if !used.reserved_cores.is_disjoint(&c.reserved_cores) {
            cores_overlap = true;
        }
        used.add(&c);
    }

    let fail = |dimension, used| FitResult {
        fit: false,
        dimension,
        used,
    };

    if cores_overlap {
        return fail("cores", used);
    }

    if let Err(dimension) = node.comparable_capacity().superset(&used) {
        return fail(dimension, used);
    }

    let mut net = NetworkIndex::new(node);
    if net.add_allocs(allocs.clone()) {
        return fail("network: port collision", used);
    }
    if net.overcommitted() {
        return fail("network: bandwidth exceeded", used);
    }

    if check_devices {
        let mut devices = DeviceAccounter::new(node);
        if devices.add_allocs(allocs) {
            return fail("device oversubscribed", used);
        }
    }

    FitResult {
        fit: true,
        dimension: "",
        used,
    }
}

/// Fraction of CPU and memory left free after `util`.
fn free_fractions(node: &Node, util: &ComparableResources) -> (f64, f64) {
    let cap = node.comparable_capacity();
    let frac = |used: u64, total: u64| {
        if total == 0 {
            0.0
        } else {
            1.0 - (used as f64 / total as f64)
        }
    };
    (
        frac(util.cpu_shares, cap.cpu_shares),
        frac(util.memory_mb, cap.memory_mb),
    )
}

/// Higher for fuller nodes, in `0..=18`.
///
/// Uses `10^free` per dimension so that a node near capacity in either
/// dimension scores well even if the other dimension is idle.
pub fn score_fit_binpack(node: &Node, util: &ComparableResources) -> f64 {
    let (free_cpu, free_mem) = free_fractions(node, util);
    let total = 10f64.powf(free_cpu) + 10f64.powf(free_mem);
    (20.0 - total).clamp(0.0, MAX_FIT_SCORE)
}

/// Inverse of [`score_fit_binpack`]: higher for emptier nodes.
pub fn score_fit_spread(node: &Node, util: &ComparableResources) -> f64 {
    let (free_cpu, free_mem) = free_fractions(node, util);
    let total = 10f64.powf(free_cpu) + 10f64.powf(free_mem);
    (total - 2.0).clamp(0.0, MAX_FIT_SCORE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mock, AllocatedPort, AllocatedTaskResources};

    fn sized(node: &Node, cpu: u64, mem: u64) -> Allocation {
        let mut alloc = mock::alloc();
        alloc.node_id = node.id;
        alloc.allocated_resources.tasks.insert(
            "web".into(),
            AllocatedTaskResources {
                cpu_shares: cpu,
                memory_mb: mem,
                ..Default::default()
            },
        );
        alloc.allocated_resources.shared.disk_mb = 0;
        alloc
    }

    #[test]
    fn test_allocs_fit_reports_dimension() {
        let node = mock::node();
        let a = sized(&node, 2000, 4096);
        let b = sized(&node, 2000, 4096);
        let fit = allocs_fit(&node, [&a, &b], false);
        assert!(fit.fit);
        assert_eq!(fit.used.cpu_shares, 4000);

        let c = sized(&node, 1, 1);
        let fit = allocs_fit(&node, [&a, &b, &c], false);
        assert!(!fit.fit);
        assert_eq!(fit.dimension, "cpu");
    }

    #[test]
    fn test_allocs_fit_detects_port_collision() {
        let node = mock::node();
        let mut a = sized(&node, 10, 10);
        let mut b = sized(&node, 10, 10);
        let port = AllocatedPort {
            label: "http".into(),
            value: 8080,
        };
        a.allocated_resources.shared.ports = vec![port.clone()];
        b.allocated_resources.shared.ports = vec![port];
        let fit = allocs_fit(&node, [&a, &b], false);
        assert_eq!(fit.dimension, "network: port collision");
    }

    #[test]
    fn test_binpack_prefers_fuller_nodes() {
        let node = mock::node();
        let empty = ComparableResources::default();
        let half = ComparableResources {
            cpu_shares: node.resources.cpu_shares / 2,
            memory_mb: node.resources.memory_mb / 2,
            ..Default::default()
        };
        let full = ComparableResources {
            cpu_shares: node.resources.cpu_shares,
            memory_mb: node.resources.memory_mb,
            ..Default::default()
        };

        assert!((score_fit_binpack(&node, &empty) - 0.0).abs() < 1e-9);
        assert!((score_fit_binpack(&node, &full) - 18.0).abs() < 1e-9);
        assert!(score_fit_binpack(&node, &half) > score_fit_binpack(&node, &empty));
        assert!(score_fit_spread(&node, &empty) > score_fit_spread(&node, &half));
    }
}
