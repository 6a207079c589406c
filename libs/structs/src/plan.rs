//! Plans: the scheduler's proposed changes, and the commit layer's answer.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use convoy_id::{AllocId, EvalId, NodeId};
use serde::{Deserialize, Serialize};

use crate::{
    AllocClientStatus, AllocDesiredStatus, AllocStateEvent, Allocation, Deployment,
    DeploymentStatusUpdate, Job, ALLOC_PREEMPTED,
};

/// Per-group counts of what the reconciler decided.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredUpdates {
    pub ignore: u32,
    pub place: u32,
    pub migrate: u32,
    pub stop: u32,
    pub in_place_update: u32,
    pub destructive_update: u32,
    pub canary: u32,
    pub preemptions: u32,
    pub disconnect: u32,
    pub reconnect_updates: u32,
    pub reschedule_now: u32,
    pub reschedule_later: u32,
}

/// Dry-run summary attached when the evaluation asks for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanAnnotations {
    pub desired_tg_updates: BTreeMap<String, DesiredUpdates>,
    #[serde(default)]
    pub preempted_allocs: Vec<AllocId>,
}

/// Changes computed by one evaluation, committed atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub eval_id: EvalId,
    pub priority: u8,
    /// Reject the whole plan unless every node fits.
    #[serde(default)]
    pub all_at_once: bool,
    #[serde(default)]
    pub job: Option<Arc<Job>>,
    #[serde(default)]
    pub node_update: BTreeMap<NodeId, Vec<Allocation>>,
    #[serde(default)]
    pub node_allocation: BTreeMap<NodeId, Vec<Allocation>>,
    #[serde(default)]
    pub node_preemptions: BTreeMap<NodeId, Vec<Allocation>>,
    #[serde(default)]
    pub deployment: Option<Deployment>,
    #[serde(default)]
    pub deployment_updates: Vec<DeploymentStatusUpdate>,
    #[serde(default)]
    pub annotations: Option<PlanAnnotations>,
    /// State index the plan was computed against.
    #[serde(default)]
    pub snapshot_index: u64,
}

impl Plan {
    pub fn new(eval_id: EvalId, priority: u8, job: Option<Arc<Job>>) -> Self {
        Self {
            eval_id,
            priority,
            all_at_once: false,
            job,
            node_update: BTreeMap::new(),
            node_allocation: BTreeMap::new(),
            node_preemptions: BTreeMap::new(),
            deployment: None,
            deployment_updates: Vec::new(),
            annotations: None,
            snapshot_index: 0,
        }
    }

    /// Marks an allocation for stopping. The allocation keeps its job for audit.
    pub fn append_stopped_alloc(
        &mut self,
        alloc: &Allocation,
        desired_description: &str,
        client_status: Option<AllocClientStatus>,
        followup_eval_id: Option<EvalId>,
        now: DateTime<Utc>,
    ) {
        let mut stopped = alloc.stub_for_update();
        stopped.desired_status = AllocDesiredStatus::Stop;
        stopped.desired_description = desired_description.to_string();
        if let Some(status) = client_status {
            stopped.client_status = status;
            stopped.alloc_states.push(AllocStateEvent {
                client_status: status,
                time: now,
            });
        }
        if followup_eval_id.is_some() {
            stopped.followup_eval_id = followup_eval_id;
        }
        stopped.modify_time = now;
        self.node_update
            .entry(alloc.node_id)
            .or_default()
            .push(stopped);
    }

    /// Marks a running allocation as `unknown` without stopping it.
    pub fn append_unknown_alloc(&mut self, alloc: Allocation, now: DateTime<Utc>) {
        let mut unknown = alloc;
        unknown.client_status = AllocClientStatus::Unknown;
        unknown.alloc_states.push(AllocStateEvent {
            client_status: AllocClientStatus::Unknown,
            time: now,
        });
        unknown.modify_time = now;
        self.node_allocation
            .entry(unknown.node_id)
            .or_default()
            .push(unknown);
    }

    /// Removes a previously appended stop, returning whether one existed.
    pub fn pop_update(&mut self, alloc: &Allocation) -> bool {
        let Some(existing) = self.node_update.get_mut(&alloc.node_id) else {
            return false;
        };
        let Some(pos) = existing.iter().rposition(|a| a.id == alloc.id) else {
            return false;
        };
        existing.remove(pos);
        if existing.is_empty() {
            self.node_update.remove(&alloc.node_id);
        }
        true
    }

    pub fn append_alloc(&mut self, alloc: Allocation) {
        self.node_allocation
            .entry(alloc.node_id)
            .or_default()
            .push(alloc);
    }

    /// Records an eviction caused by `preempting_alloc_id`.
    pub fn append_preempted_alloc(
        &mut self,
        alloc: &Allocation,
        preempting_alloc_id: AllocId,
        now: DateTime<Utc>,
    ) {
        let mut preempted = alloc.stub_for_update();
        preempted.desired_status = AllocDesiredStatus::Evict;
        preempted.desired_description = ALLOC_PREEMPTED.to_string();
        preempted.preempted_by_allocation = Some(preempting_alloc_id);
        preempted.modify_time = now;
        self.node_preemptions
            .entry(alloc.node_id)
            .or_default()
            .push(preempted);
    }

    /// Nothing to commit.
    pub fn is_no_op(&self) -> bool {
        self.node_update.is_empty()
            && self.node_allocation.is_empty()
            && self.node_preemptions.is_empty()
            && self.deployment.is_none()
            && self.deployment_updates.is_empty()
    }

    /// Every node touched by the plan.
    pub fn touched_nodes(&self) -> std::collections::BTreeSet<NodeId> {
        self.node_update
            .keys()
            .chain(self.node_allocation.keys())
            .chain(self.node_preemptions.keys())
            .copied()
            .collect()
    }

    pub fn placements(&self) -> impl Iterator<Item = &Allocation> {
        self.node_allocation.values().flatten()
    }

    pub fn stops(&self) -> impl Iterator<Item = &Allocation> {
        self.node_update.values().flatten()
    }

    pub fn preemptions(&self) -> impl Iterator<Item = &Allocation> {
        self.node_preemptions.values().flatten()
    }
}

/// Outcome of submitting a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    #[serde(default)]
    pub node_update: BTreeMap<NodeId, Vec<Allocation>>,
    #[serde(default)]
    pub node_allocation: BTreeMap<NodeId, Vec<Allocation>>,
    #[serde(default)]
    pub node_preemptions: BTreeMap<NodeId, Vec<Allocation>>,
    #[serde(default)]
    pub deployment: Option<Deployment>,
    #[serde(default)]
    pub deployment_updates: Vec<DeploymentStatusUpdate>,
    /// Non-zero when part of the plan was rejected; the caller must refresh
    /// state to at least this index before retrying.
    #[serde(default)]
    pub refresh_index: u64,
    /// Index at which the accepted part was committed.
    #[serde(default)]
    pub alloc_index: u64,
}

impl PlanResult {
    /// Whether every node in `plan` was committed, with the expected and
    /// actual number of touched nodes.
    pub fn full_commit(&self, plan: &Plan) -> (bool, usize, usize) {
        let expected = plan.touched_nodes().len();
        let actual = self
            .node_update
            .keys()
            .chain(self.node_allocation.keys())
            .chain(self.node_preemptions.keys())
            .copied()
            .collect::<std::collections::BTreeSet<_>>()
            .len();
        (expected == actual, expected, actual)
    }
}
