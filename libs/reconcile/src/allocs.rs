//! Allocation sets and the classifications the reconciler applies to them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use convoy_id::{AllocId, DeploymentId, EvalId, NodeId};
use convoy_structs::{
    AllocClientStatus, AllocDesiredStatus, Allocation, Deployment, Node, NodeStatus,
};

use crate::reschedule::{self, RESCHEDULE_WINDOW};

/// Nodes that are down, disconnected, draining or gone (`None`).
pub type TaintedNodes = BTreeMap<NodeId, Option<Arc<Node>>>;

/// Allocations keyed by ID. Iteration order is by ID, which keeps every
/// decision derived from a set deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllocSet(BTreeMap<AllocId, Allocation>);

impl AllocSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn insert(&mut self, alloc: Allocation) {
        self.0.insert(alloc.id, alloc);
    }

    pub fn remove(&mut self, id: &AllocId) -> Option<Allocation> {
        self.0.remove(id)
    }

    pub fn get(&self, id: &AllocId) -> Option<&Allocation> {
        self.0.get(id)
    }

    pub fn contains(&self, id: &AllocId) -> bool {
        self.0.contains_key(id)
    }

    pub fn values(&self) -> impl Iterator<Item = &Allocation> {
        self.0.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &AllocId> {
        self.0.keys()
    }

    /// Members of `self` plus members of `other`.
    pub fn union(&self, other: &AllocSet) -> AllocSet {
        let mut out = self.clone();
        for alloc in other.values() {
            out.0.entry(alloc.id).or_insert_with(|| alloc.clone());
        }
        out
    }

    /// Members of `self` not in `other`.
    pub fn difference(&self, other: &AllocSet) -> AllocSet {
        self.values()
            .filter(|a| !other.contains(&a.id))
            .cloned()
            .collect()
    }

    /// Members whose ID is in `ids`.
    pub fn from_keys<'a, I>(&self, ids: I) -> AllocSet
    where
        I: IntoIterator<Item = &'a AllocId>,
    {
        ids.into_iter()
            .filter_map(|id| self.get(id).cloned())
            .collect()
    }

    pub fn name_set(&self) -> BTreeSet<String> {
        self.values().map(|a| a.name.clone()).collect()
    }

    /// Members sorted by name index, then ID.
    pub fn name_order(&self) -> Vec<&Allocation> {
        let mut out: Vec<&Allocation> = self.values().collect();
        out.sort_by_key(|a| (a.index().unwrap_or(u32::MAX), a.id));
        out
    }

    pub fn filter_by_terminal(&self) -> AllocSet {
        self.values()
            .filter(|a| !a.terminal_status())
            .cloned()
            .collect()
    }

    pub fn filter_out_client_status(&self, status: AllocClientStatus) -> AllocSet {
        self.values()
            .filter(|a| a.client_status != status)
            .cloned()
            .collect()
    }

    pub fn filter_by_client_status(&self, status: AllocClientStatus) -> AllocSet {
        self.values()
            .filter(|a| a.client_status == status)
            .cloned()
            .collect()
    }

    /// Splits into (part of `deployment_id`, not part of it).
    pub fn filter_by_deployment(&self, deployment_id: DeploymentId) -> (AllocSet, AllocSet) {
        let (part_of, rest): (Vec<_>, Vec<_>) = self
            .values()
            .cloned()
            .partition(|a| a.deployment_id == Some(deployment_id));
        (part_of.into_iter().collect(), rest.into_iter().collect())
    }

    /// Classifies allocations by the health of the node they run on.
    pub fn filter_by_tainted(&self, tainted: &TaintedNodes, now: DateTime<Utc>) -> TaintedSplit {
        let mut split = TaintedSplit::default();

        for alloc in self.values() {
            let supports_disconnect = alloc
                .task_group_spec()
                .and_then(|tg| tg.lost_after())
                .is_some();

            let mut reconnect = false;
            let mut expired = false;
            if supports_disconnect
                && matches!(
                    alloc.client_status,
                    AllocClientStatus::Unknown
                        | AllocClientStatus::Running
                        | AllocClientStatus::Failed
                )
            {
                reconnect = alloc.needs_to_reconnect();
                if reconnect {
                    expired = alloc.disconnect_expired(now);
                }
            }

            // A failed reconnect still has to go through reconnect handling.
            if supports_disconnect
                && reconnect
                && alloc.desired_status == AllocDesiredStatus::Run
                && alloc.client_status == AllocClientStatus::Failed
            {
                split.reconnecting.insert(alloc.clone());
                continue;
            }

            // Nodes missing from the tainted set are healthy.
            let tainted_node = tainted.get(&alloc.node_id);
            let node_status = match tainted_node {
                None => Some(NodeStatus::Ready),
                Some(Some(node)) => Some(node.status),
                Some(None) => None,
            };
            match node_status {
                Some(NodeStatus::Disconnected) if !supports_disconnect => {
                    if !alloc.terminal_status() {
                        split.lost.insert(alloc.clone());
                        continue;
                    }
                }
                Some(NodeStatus::Disconnected) => match alloc.client_status {
                    AllocClientStatus::Running => {
                        split.disconnecting.insert(alloc.clone());
                        continue;
                    }
                    AllocClientStatus::Pending => {
                        split.lost.insert(alloc.clone());
                        continue;
                    }
                    _ => {}
                },
                Some(NodeStatus::Ready) if reconnect => {
                    if expired {
                        split.lost.insert(alloc.clone());
                    } else {
                        split.reconnecting.insert(alloc.clone());
                    }
                    continue;
                }
                _ => {}
            }

            if alloc.terminal_status() && !reconnect {
                split.untainted.insert(alloc.clone());
                continue;
            }

            if alloc.desired_transition.migrate {
                split.migrate.insert(alloc.clone());
                continue;
            }

            if supports_disconnect && alloc.disconnect_expired(now) {
                split.lost.insert(alloc.clone());
                continue;
            }

            if supports_disconnect
                && alloc.client_status == AllocClientStatus::Unknown
                && alloc.desired_status == AllocDesiredStatus::Run
            {
                split.untainted.insert(alloc.clone());
                continue;
            }

            if supports_disconnect
                && reconnect
                && alloc.client_status == AllocClientStatus::Failed
                && alloc.desired_status == AllocDesiredStatus::Stop
            {
                split.ignore.insert(alloc.clone());
                continue;
            }

            match tainted_node {
                Some(None) => {
                    split.lost.insert(alloc.clone());
                }
                Some(Some(node)) if node.terminal_status() => {
                    split.lost.insert(alloc.clone());
                }
                Some(Some(node)) if node.draining() => {
                    split.migrate.insert(alloc.clone());
                }
                _ => {
                    split.untainted.insert(alloc.clone());
                }
            }
        }
        split
    }

    /// Splits the untainted set into allocations to keep, failed ones to
    /// replace now, and failed ones to replace later.
    pub fn filter_by_rescheduleable(
        &self,
        is_batch: bool,
        now: DateTime<Utc>,
        eval_id: EvalId,
        deployment: Option<&Deployment>,
    ) -> RescheduleSplit {
        let mut split = RescheduleSplit::default();

        for alloc in self.values() {
            // Already replaced.
            if alloc.next_allocation.is_some() && alloc.terminal_status() {
                continue;
            }

            let (is_untainted, ignore) = should_filter(alloc, is_batch);
            if is_untainted {
                split.untainted.insert(alloc.clone());
            }
            if is_untainted || ignore {
                continue;
            }

            let decision = reschedule_decision(alloc, now, eval_id, deployment);
            if decision.now {
                split.now.insert(alloc.clone());
            } else {
                split.untainted.insert(alloc.clone());
                if let Some(at) = decision.later {
                    split.later.push(DelayedReschedule {
                        alloc: alloc.clone(),
                        reschedule_time: at,
                    });
                }
            }
        }
        split
    }
}

/// Whether an allocation is kept as-is (`untainted`) or skipped entirely
/// (`ignore`) before reschedule checks. Failed allocations are neither.
fn should_filter(alloc: &Allocation, is_batch: bool) -> (bool, bool) {
    if is_batch {
        match alloc.desired_status {
            AllocDesiredStatus::Stop => {
                return (alloc.ran_successfully(), !alloc.ran_successfully())
            }
            AllocDesiredStatus::Evict => return (false, true),
            AllocDesiredStatus::Run => {}
        }
        return match alloc.client_status {
            AllocClientStatus::Failed => (false, false),
            _ => (true, false),
        };
    }

    match alloc.desired_status {
        AllocDesiredStatus::Stop | AllocDesiredStatus::Evict => return (false, true),
        AllocDesiredStatus::Run => {}
    }
    match alloc.client_status {
        AllocClientStatus::Complete | AllocClientStatus::Lost => (false, true),
        AllocClientStatus::Failed => (false, false),
        _ => (true, false),
    }
}

struct RescheduleDecision {
    now: bool,
    later: Option<DateTime<Utc>>,
}

fn reschedule_decision(
    alloc: &Allocation,
    now: DateTime<Utc>,
    eval_id: EvalId,
    deployment: Option<&Deployment>,
) -> RescheduleDecision {
    let mut decision = RescheduleDecision {
        now: false,
        later: None,
    };

    // Allocations of an active deployment only reschedule when asked to.
    if let Some(d) = deployment {
        if alloc.deployment_id == Some(d.id) && d.active() && !alloc.desired_transition.reschedule {
            return decision;
        }
    }

    if alloc.desired_transition.force_reschedule {
        decision.now = true;
    }

    let Some(policy) = alloc.task_group_spec().and_then(|tg| tg.reschedule_policy.as_ref()) else {
        return decision;
    };
    let Some((at, eligible)) = reschedule::next_reschedule_time(alloc, policy) else {
        return decision;
    };
    if !eligible {
        return decision;
    }

    let window = reschedule::to_chrono(RESCHEDULE_WINDOW);
    if alloc.followup_eval_id == Some(eval_id) || at - now <= window {
        decision.now = true;
        return decision;
    }
    if alloc.followup_eval_id.is_none() {
        decision.later = Some(at);
    }
    decision
}

impl FromIterator<Allocation> for AllocSet {
    fn from_iter<T: IntoIterator<Item = Allocation>>(iter: T) -> Self {
        Self(iter.into_iter().map(|a| (a.id, a)).collect())
    }
}

impl IntoIterator for AllocSet {
    type Item = Allocation;
    type IntoIter = std::collections::btree_map::IntoValues<AllocId, Allocation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_values()
    }
}

/// Result of [`AllocSet::filter_by_tainted`].
#[derive(Debug, Default)]
pub struct TaintedSplit {
    pub untainted: AllocSet,
    pub migrate: AllocSet,
    pub lost: AllocSet,
    pub disconnecting: AllocSet,
    pub reconnecting: AllocSet,
    pub ignore: AllocSet,
}

/// A failed allocation whose replacement has to wait.
#[derive(Debug, Clone)]
pub struct DelayedReschedule {
    pub alloc: Allocation,
    pub reschedule_time: DateTime<Utc>,
}

/// Result of [`AllocSet::filter_by_rescheduleable`].
#[derive(Debug, Default)]
pub struct RescheduleSplit {
    pub untainted: AllocSet,
    pub now: AllocSet,
    pub later: Vec<DelayedReschedule>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_structs::{mock, AllocStateEvent, DisconnectStrategy, DrainStrategy};
    use std::time::Duration;

    fn running(job: &Arc<convoy_structs::Job>, node: &Node, idx: u32) -> Allocation {
        mock::alloc_for(job, node, idx)
    }

    #[test]
    fn test_tainted_split() {
        let job = Arc::new(mock::job());
        let healthy = mock::node();
        let mut down = mock::node();
        down.status = NodeStatus::Down;
        let mut draining = mock::node();
        draining.drain = Some(DrainStrategy {
            deadline: None,
            ignore_system_jobs: false,
        });
        let gone = mock::node();

        let a = running(&job, &healthy, 0);
        let b = running(&job, &down, 1);
        let c = running(&job, &draining, 2);
        let d = running(&job, &gone, 3);
        let mut e = running(&job, &draining, 4);
        e.client_status = AllocClientStatus::Complete;

        let set: AllocSet = [a.clone(), b.clone(), c.clone(), d.clone(), e.clone()]
            .into_iter()
            .collect();
        let tainted: TaintedNodes = BTreeMap::from([
            (down.id, Some(Arc::new(down))),
            (draining.id, Some(Arc::new(draining))),
            (gone.id, None),
        ]);

        let split = set.filter_by_tainted(&tainted, Utc::now());
        assert!(split.untainted.contains(&a.id));
        assert!(split.untainted.contains(&e.id));
        assert!(split.lost.contains(&b.id));
        assert!(split.lost.contains(&d.id));
        assert!(split.migrate.contains(&c.id));
    }

    #[test]
    fn test_disconnect_and_reconnect() {
        let now = Utc::now();
        let mut job = mock::job();
        job.task_groups[0].disconnect = Some(DisconnectStrategy {
            lost_after: Duration::from_secs(300),
        });
        let job = Arc::new(job);

        let mut node = mock::node();
        node.status = NodeStatus::Disconnected;
        let alloc = running(&job, &node, 0);
        let set: AllocSet = [alloc.clone()].into_iter().collect();
        let tainted: TaintedNodes = BTreeMap::from([(node.id, Some(Arc::new(node.clone())))]);
        let split = set.filter_by_tainted(&tainted, now);
        assert!(split.disconnecting.contains(&alloc.id));

        // Node is back and the client reports the allocation running again.
        let mut reconnected = alloc.clone();
        reconnected.alloc_states.push(AllocStateEvent {
            client_status: AllocClientStatus::Unknown,
            time: now - chrono::Duration::seconds(60),
        });
        node.status = NodeStatus::Ready;
        let tainted: TaintedNodes = BTreeMap::from([(node.id, Some(Arc::new(node)))]);
        let set: AllocSet = [reconnected.clone()].into_iter().collect();
        let split = set.filter_by_tainted(&tainted, now);
        assert!(split.reconnecting.contains(&reconnected.id));
    }

    #[test]
    fn test_unknown_alloc_expires_to_lost() {
        let now = Utc::now();
        let mut job = mock::job();
        job.task_groups[0].disconnect = Some(DisconnectStrategy {
            lost_after: Duration::from_secs(60),
        });
        let job = Arc::new(job);
        let mut node = mock::node();
        node.status = NodeStatus::Disconnected;

        let mut alloc = running(&job, &node, 0);
        alloc.client_status = AllocClientStatus::Unknown;
        alloc.alloc_states.push(AllocStateEvent {
            client_status: AllocClientStatus::Unknown,
            time: now - chrono::Duration::seconds(30),
        });
        let tainted: TaintedNodes = BTreeMap::from([(node.id, Some(Arc::new(node)))]);
        let set: AllocSet = [alloc.clone()].into_iter().collect();

        let split = set.filter_by_tainted(&tainted, now);
        assert!(split.untainted.contains(&alloc.id));

        let split = set.filter_by_tainted(&tainted, now + chrono::Duration::seconds(31));
        assert!(split.lost.contains(&alloc.id));
    }

    #[test]
    fn test_rescheduleable_split() {
        let now = Utc::now();
        let job = Arc::new(mock::job());
        let node = mock::node();
        let eval_id = EvalId::new();

        let ok = running(&job, &node, 0);

        let mut failed_now = running(&job, &node, 1);
        failed_now.client_status = AllocClientStatus::Failed;
        failed_now.alloc_states.push(AllocStateEvent {
            client_status: AllocClientStatus::Failed,
            time: now - chrono::Duration::seconds(10),
        });

        let mut failed_later = running(&job, &node, 2);
        failed_later.client_status = AllocClientStatus::Failed;
        failed_later.alloc_states.push(AllocStateEvent {
            client_status: AllocClientStatus::Failed,
            time: now,
        });

        let mut complete = running(&job, &node, 3);
        complete.client_status = AllocClientStatus::Complete;

        let set: AllocSet = [ok.clone(), failed_now.clone(), failed_later.clone(), complete.clone()]
            .into_iter()
            .collect();
        let split = set.filter_by_rescheduleable(false, now, eval_id, None);

        assert!(split.untainted.contains(&ok.id));
        assert!(split.now.contains(&failed_now.id));
        assert!(split.untainted.contains(&failed_later.id));
        assert_eq!(split.later.len(), 1);
        assert_eq!(
            split.later[0].reschedule_time,
            now + chrono::Duration::seconds(5)
        );
        assert!(!split.untainted.contains(&complete.id));
        assert!(!split.now.contains(&complete.id));
    }

    #[test]
    fn test_followup_eval_reschedules_now() {
        let now = Utc::now();
        let job = Arc::new(mock::job());
        let node = mock::node();
        let eval_id = EvalId::new();

        let mut alloc = running(&job, &node, 0);
        alloc.client_status = AllocClientStatus::Failed;
        alloc.followup_eval_id = Some(eval_id);
        alloc.alloc_states.push(AllocStateEvent {
            client_status: AllocClientStatus::Failed,
            time: now,
        });
        let set: AllocSet = [alloc.clone()].into_iter().collect();
        let split = set.filter_by_rescheduleable(false, now, eval_id, None);
        assert!(split.now.contains(&alloc.id));
    }
}
