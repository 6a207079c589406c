//! Per-evaluation working state shared by the feasibility and ranking steps.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use convoy_id::{EvalId, NodeId};
use convoy_structs::{AllocMetric, Allocation, ConstraintCache, Plan};

use crate::state::State;

/// Everything one evaluation attempt computes against.
pub struct EvalContext {
    pub state: Arc<dyn State>,
    pub plan: Plan,
    /// Metrics of the placement currently being selected.
    pub metrics: AllocMetric,
    pub eligibility: EvalEligibility,
    pub cache: ConstraintCache,
    pub eval_id: EvalId,
    pub now: DateTime<Utc>,
}

impl EvalContext {
    pub fn new(state: Arc<dyn State>, plan: Plan, eval_id: EvalId, now: DateTime<Utc>) -> Self {
        Self {
            state,
            plan,
            metrics: AllocMetric::default(),
            eligibility: EvalEligibility::default(),
            cache: ConstraintCache::new(),
            eval_id,
            now,
        }
    }

    /// Starts metrics for a fresh placement.
    pub fn reset_metrics(&mut self) {
        self.metrics = AllocMetric::default();
    }

    /// Allocations that would be on `node_id` if the plan committed:
    /// live allocations in state, minus the plan's stops and evictions,
    /// with the plan's placements and updates applied by ID.
    pub fn proposed_allocs(&self, node_id: &NodeId) -> Vec<Allocation> {
        let removed: BTreeSet<_> = self
            .plan
            .node_update
            .get(node_id)
            .into_iter()
            .flatten()
            .chain(self.plan.node_preemptions.get(node_id).into_iter().flatten())
            .map(|a| a.id)
            .collect();

        let mut proposed: BTreeMap<_, Allocation> = self
            .state
            .allocs_by_node(node_id, false)
            .into_iter()
            .filter(|a| !removed.contains(&a.id))
            .map(|a| (a.id, a))
            .collect();

        for alloc in self.plan.node_allocation.get(node_id).into_iter().flatten() {
            proposed.insert(alloc.id, alloc.clone());
        }
        proposed
            .into_values()
            .filter(|a| !a.terminal_status())
            .collect()
    }

    /// Allocations of a job across the cluster as the plan would leave them.
    pub fn proposed_job_allocs(&self, namespace: &str, job_id: &str) -> Vec<Allocation> {
        let stopped: BTreeSet<_> = self
            .plan
            .stops()
            .chain(self.plan.preemptions())
            .map(|a| a.id)
            .collect();

        let mut proposed: BTreeMap<_, Allocation> = self
            .state
            .allocs_by_job(namespace, job_id, false)
            .into_iter()
            .filter(|a| !stopped.contains(&a.id))
            .map(|a| (a.id, a))
            .collect();

        for alloc in self
            .plan
            .placements()
            .filter(|a| a.namespace == namespace && a.job_id == job_id)
        {
            proposed.insert(alloc.id, alloc.clone());
        }
        proposed
            .into_values()
            .filter(|a| !a.terminal_status())
            .collect()
    }
}

/// Cached feasibility of a computed class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassStatus {
    Unknown,
    Eligible,
    Ineligible,
    /// Constraints read per-node values, so class results can't be reused.
    Escaped,
}

/// Per-evaluation record of which computed classes passed the job- and
/// group-level checks. It both saves work across placements and tells the
/// blocked-evaluation tracker which classes are worth waking up for.
#[derive(Debug, Clone, Default)]
pub struct EvalEligibility {
    job: BTreeMap<String, bool>,
    job_escaped: bool,
    task_groups: BTreeMap<String, BTreeMap<String, bool>>,
    tg_escaped: BTreeMap<String, bool>,
}

impl EvalEligibility {
    pub fn set_job_escaped(&mut self, escaped: bool) {
        self.job_escaped = escaped;
    }

    pub fn set_tg_escaped(&mut self, tg: &str, escaped: bool) {
        self.tg_escaped.insert(tg.to_string(), escaped);
    }

    pub fn job_status(&self, class: &str) -> ClassStatus {
        if self.job_escaped {
            return ClassStatus::Escaped;
        }
        match self.job.get(class) {
            Some(true) => ClassStatus::Eligible,
            Some(false) => ClassStatus::Ineligible,
            None => ClassStatus::Unknown,
        }
    }

    pub fn set_job_eligibility(&mut self, eligible: bool, class: &str) {
        if !self.job_escaped {
            self.job.insert(class.to_string(), eligible);
        }
    }

    pub fn tg_status(&self, tg: &str, class: &str) -> ClassStatus {
        if self.tg_escaped.get(tg).copied().unwrap_or(false) {
            return ClassStatus::Escaped;
        }
        match self.task_groups.get(tg).and_then(|c| c.get(class)) {
            Some(true) => ClassStatus::Eligible,
            Some(false) => ClassStatus::Ineligible,
            None => ClassStatus::Unknown,
        }
    }

    pub fn set_tg_eligibility(&mut self, eligible: bool, tg: &str, class: &str) {
        if self.tg_escaped.get(tg).copied().unwrap_or(false) {
            return;
        }
        self.task_groups
            .entry(tg.to_string())
            .or_default()
            .insert(class.to_string(), eligible);
    }

    pub fn has_escaped(&self) -> bool {
        self.job_escaped || self.tg_escaped.values().any(|e| *e)
    }

    /// Class eligibility to record on a blocked evaluation. A class the job
    /// rules out is ineligible; otherwise it is eligible if any group
    /// accepted it.
    pub fn get_classes(&self) -> BTreeMap<String, bool> {
        let mut classes: BTreeMap<String, bool> = BTreeMap::new();
        for (class, eligible) in &self.job {
            if !eligible {
                classes.insert(class.clone(), false);
            }
        }
        for groups in self.task_groups.values() {
            for (class, eligible) in groups {
                if self.job.get(class) == Some(&false) {
                    continue;
                }
                let entry = classes.entry(class.clone()).or_insert(false);
                *entry |= *eligible;
            }
        }
        classes
    }
}
