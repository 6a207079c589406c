//! Victim selection for preemption.
//!
//! Runs only for a node that passed every filter but lacks free capacity.
//! Candidates are live allocations on the node belonging to other jobs with
//! strictly lower priority. They are taken lowest priority first, smallest
//! first, until the ask fits; the set is then pruned of any victim the rest
//! can do without. Only CPU, memory and disk are considered: ports and
//! devices are never freed by preemption.

use convoy_structs::{Allocation, ComparableResources, Node};

/// The allocation asking for room.
#[derive(Debug, Clone, Copy)]
pub struct PreemptionAsk<'a> {
    pub namespace: &'a str,
    pub job_id: &'a str,
    pub priority: u8,
    pub resources: &'a ComparableResources,
}

/// Picks allocations to evict from `node` so `ask` fits alongside the rest
/// of `proposed`. `None` when no eligible set frees enough.
pub fn select_victims(
    node: &Node,
    proposed: &[Allocation],
    ask: PreemptionAsk<'_>,
) -> Option<Vec<Allocation>> {
    let capacity = node.comparable_capacity();
    let fits = |used: &ComparableResources| {
        let mut total = used.clone();
        total.add(ask.resources);
        capacity.superset(&total).is_ok()
    };

    let mut remaining = ComparableResources::default();
    for alloc in proposed {
        remaining.add(&alloc.comparable_resources());
    }
    if fits(&remaining) {
        return Some(Vec::new());
    }

    let mut candidates: Vec<&Allocation> = proposed
        .iter()
        .filter(|a| a.job_priority() < ask.priority)
        .filter(|a| !(a.namespace == ask.namespace && a.job_id == ask.job_id))
        .collect();
    candidates.sort_by_key(|a| (a.job_priority(), a.comparable_resources().size(), a.id));

    let mut victims = Vec::new();
    for candidate in candidates {
        if fits(&remaining) {
            break;
        }
        remaining.subtract(&candidate.comparable_resources());
        victims.push(candidate);
    }
    if !fits(&remaining) {
        return None;
    }

    // Give back any victim the others already make room for.
    let mut i = victims.len();
    while i > 0 {
        i -= 1;
        let mut without = remaining.clone();
        without.add(&victims[i].comparable_resources());
        if fits(&without) {
            remaining = without;
            victims.remove(i);
        }
    }

    Some(victims.into_iter().cloned().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_structs::{mock, AllocatedTaskResources, Job};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn job_with_priority(priority: u8) -> Arc<Job> {
        let mut job = mock::batch_job();
        job.priority = priority;
        Arc::new(job)
    }

    fn sized(node: &Node, priority: u8, cpu: u64) -> Allocation {
        let job = job_with_priority(priority);
        let mut alloc = mock::alloc_for(&job, node, 0);
        alloc.allocated_resources.tasks.insert(
            "web".into(),
            AllocatedTaskResources {
                cpu_shares: cpu,
                memory_mb: 10,
                ..Default::default()
            },
        );
        alloc.allocated_resources.shared.disk_mb = 0;
        alloc
    }

    fn ask(cpu: u64) -> ComparableResources {
        ComparableResources {
            cpu_shares: cpu,
            memory_mb: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_prefers_lowest_priority_then_smallest() {
        let node = mock::node();
        let existing = vec![
            sized(&node, 40, 1000),
            sized(&node, 20, 1500),
            sized(&node, 20, 1000),
            sized(&node, 60, 500),
        ];
        let resources = ask(1000);
        let victims = select_victims(
            &node,
            &existing,
            PreemptionAsk {
                namespace: "default",
                job_id: "high",
                priority: 80,
                resources: &resources,
            },
        )
        .unwrap();
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].id, existing[2].id);
    }

    #[test]
    fn test_prunes_unneeded_victims() {
        let node = mock::node();
        let existing = vec![sized(&node, 10, 200), sized(&node, 20, 3800)];
        let resources = ask(3000);
        let victims = select_victims(
            &node,
            &existing,
            PreemptionAsk {
                namespace: "default",
                job_id: "high",
                priority: 80,
                resources: &resources,
            },
        )
        .unwrap();
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].id, existing[1].id);
    }

    #[test]
    fn test_never_evicts_equal_priority() {
        let node = mock::node();
        let existing = vec![sized(&node, 50, 4000)];
        let resources = ask(1000);
        let victims = select_victims(
            &node,
            &existing,
            PreemptionAsk {
                namespace: "default",
                job_id: "peer",
                priority: 50,
                resources: &resources,
            },
        );
        assert!(victims.is_none());
    }

    proptest! {
        #[test]
        fn prop_victims_have_lower_priority(
            priorities in proptest::collection::vec(1u8..=100, 1..8),
            asker in 1u8..=100,
        ) {
            let node = mock::node();
            let cpu = node.resources.cpu_shares / priorities.len() as u64;
            let existing: Vec<Allocation> =
                priorities.iter().map(|p| sized(&node, *p, cpu)).collect();
            let resources = ask(cpu);
            let ask = PreemptionAsk {
                namespace: "default",
                job_id: "asker",
                priority: asker,
                resources: &resources,
            };
            if let Some(victims) = select_victims(&node, &existing, ask) {
                for victim in victims {
                    prop_assert!(victim.job_priority() < asker);
                }
            }
        }
    }
}
