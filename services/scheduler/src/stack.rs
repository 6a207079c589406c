//! The placement stack: feasibility, then ranking, then selection.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use convoy_id::{AllocId, NodeId};
use convoy_structs::{Job, Node, TaskGroup};
use tracing::debug;

use crate::context::EvalContext;
use crate::feasible::{
    DistinctHostsChecker, DistinctPropertyChecker, FeasibilityChecker, FeasibilityWrapper,
};
use crate::rank::{
    binpack, reschedule_penalty, BinPackOptions, JobAntiAffinity, NodeAffinity, RankedNode,
    SpreadScorer,
};
use crate::state::State;

/// Which scoring steps apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackKind {
    /// Service and batch: anti-affinity, reschedule penalty and spread.
    Generic,
    /// System and sysbatch: each node is considered on its own.
    System,
}

/// Per-placement inputs.
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    pub alloc_name: String,
    /// Nodes where the allocation being replaced failed.
    pub penalty_node_ids: BTreeSet<NodeId>,
    /// Tried on their own first; all nodes are tried if none fits.
    pub preferred_nodes: Vec<Arc<Node>>,
    /// Allocation being replaced, whose volume claims may be reused.
    pub previous_alloc: Option<AllocId>,
}

/// Ready nodes the job may use, ordered by ID.
pub fn ready_nodes_for_job(state: &dyn State, job: &Job) -> Vec<Arc<Node>> {
    let mut nodes: Vec<Arc<Node>> = state
        .nodes()
        .into_iter()
        .filter(|n| n.ready())
        .filter(|n| job.targets_datacenter(&n.datacenter) && job.targets_pool(&n.node_pool))
        .collect();
    nodes.sort_by_key(|n| n.id);
    nodes
}

pub struct Stack {
    kind: StackKind,
    job: Option<Arc<Job>>,
    nodes: Vec<Arc<Node>>,
    nodes_by_dc: BTreeMap<String, u32>,
    binpack: BinPackOptions,
}

impl Stack {
    pub fn new(kind: StackKind) -> Self {
        Self {
            kind,
            job: None,
            nodes: Vec::new(),
            nodes_by_dc: BTreeMap::new(),
            binpack: BinPackOptions {
                algorithm: Default::default(),
                memory_oversubscription: false,
                preemption: false,
            },
        }
    }

    pub fn set_nodes(&mut self, mut nodes: Vec<Arc<Node>>) {
        nodes.sort_by_key(|n| n.id);
        self.nodes_by_dc.clear();
        for node in &nodes {
            *self.nodes_by_dc.entry(node.datacenter.clone()).or_default() += 1;
        }
        self.nodes = nodes;
    }

    /// Sets the job and resolves its pool's scheduler settings.
    pub fn set_job(&mut self, ctx: &EvalContext, job: &Arc<Job>) {
        let config = ctx.state.scheduler_config();
        let pool = ctx.state.node_pool_by_name(&job.node_pool);
        self.binpack = BinPackOptions {
            algorithm: config.effective_algorithm(pool.as_ref()),
            memory_oversubscription: config.effective_memory_oversubscription(pool.as_ref()),
            preemption: config.preemption_config.enabled_for(job.job_type),
        };
        self.job = Some(Arc::clone(job));
    }

    /// Picks the best node for one allocation of `tg`. The highest final
    /// score wins; ties go to the lowest node ID.
    pub fn select(
        &mut self,
        ctx: &mut EvalContext,
        tg: &TaskGroup,
        opts: &SelectOptions,
    ) -> Option<RankedNode> {
        let start = Instant::now();
        let job = self.job.clone()?;

        if !opts.preferred_nodes.is_empty() {
            let mut preferred = opts.preferred_nodes.clone();
            preferred.sort_by_key(|n| n.id);
            self.record_pool(ctx);
            if let Some(best) = self.select_from(ctx, &job, tg, &preferred, opts) {
                ctx.metrics.allocation_time = start.elapsed();
                return Some(best);
            }
            ctx.reset_metrics();
        }

        self.record_pool(ctx);
        let nodes = self.nodes.clone();
        let best = self.select_from(ctx, &job, tg, &nodes, opts);
        ctx.metrics.allocation_time = start.elapsed();
        best
    }

    fn record_pool(&self, ctx: &mut EvalContext) {
        ctx.metrics.nodes_in_pool = u32::try_from(self.nodes.len()).unwrap_or(u32::MAX);
        ctx.metrics.nodes_available = self.nodes_by_dc.clone();
    }

    fn select_from(
        &self,
        ctx: &mut EvalContext,
        job: &Arc<Job>,
        tg: &TaskGroup,
        nodes: &[Arc<Node>],
        opts: &SelectOptions,
    ) -> Option<RankedNode> {
        let mut feasibility =
            FeasibilityWrapper::new(ctx, job, tg, &opts.alloc_name, opts.previous_alloc);
        let mut distinct_hosts = DistinctHostsChecker::new(job, tg);
        let mut distinct_property = DistinctPropertyChecker::new(job, tg);

        let generic = self.kind == StackKind::Generic;
        let anti_affinity = generic.then(|| JobAntiAffinity::new(ctx, job, tg));
        let spread = generic.then(|| SpreadScorer::new(ctx, job, tg));
        let affinity = NodeAffinity::new(job, tg);

        let mut best: Option<RankedNode> = None;
        for node in nodes {
            ctx.metrics.evaluate_node();
            if !feasibility.feasible(ctx, node)
                || !distinct_hosts.feasible(ctx, node)
                || !distinct_property.feasible(ctx, node)
            {
                continue;
            }
            let Some(mut ranked) = binpack(ctx, node, job, tg, self.binpack) else {
                continue;
            };

            if let Some(anti_affinity) = &anti_affinity {
                anti_affinity.score(ctx, &mut ranked);
            }
            if generic {
                reschedule_penalty(ctx, &mut ranked, &opts.penalty_node_ids);
            }
            affinity.score(ctx, &mut ranked);
            if let Some(spread) = &spread {
                spread.score(ctx, &mut ranked);
            }
            ranked.normalize(ctx);

            if best.as_ref().is_none_or(|b| ranked.final_score > b.final_score) {
                best = Some(ranked);
            }
        }
        ctx.metrics.populate_score_meta_data();

        if let Some(best) = &best {
            debug!(
                eval_id = %ctx.eval_id,
                task_group = %tg.name,
                node_id = %best.node.id,
                score = best.final_score,
                "Selected node"
            );
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemStore;
    use chrono::Utc;
    use convoy_id::EvalId;
    use convoy_structs::{mock, NodeStatus, Plan};

    fn setup(nodes: &[Node]) -> (MemStore, Arc<Job>) {
        let store = MemStore::new();
        for node in nodes {
            store.upsert_node(node.clone());
        }
        let job = store.upsert_job(mock::job()).unwrap();
        (store, job)
    }

    fn ctx_for(store: &MemStore, job: &Arc<Job>) -> EvalContext {
        let plan = Plan::new(EvalId::new(), job.priority, Some(Arc::clone(job)));
        EvalContext::new(store.snapshot(), plan, EvalId::new(), Utc::now())
    }

    fn opts(name: &str) -> SelectOptions {
        SelectOptions {
            alloc_name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_ready_nodes_skip_down_and_other_dc() {
        let ready = mock::node();
        let mut down = mock::node();
        down.status = NodeStatus::Down;
        let mut other = mock::node();
        other.datacenter = "dc9".into();
        let (store, job) = setup(&[ready.clone(), down, other, mock::drain_node()]);

        let nodes = ready_nodes_for_job(&*store.snapshot(), &job);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, ready.id);
    }

    #[test]
    fn test_tie_goes_to_lowest_node_id() {
        let a = mock::node();
        let b = mock::node();
        let (store, job) = setup(&[a.clone(), b.clone()]);
        let mut ctx = ctx_for(&store, &job);

        let mut stack = Stack::new(StackKind::Generic);
        stack.set_nodes(ready_nodes_for_job(&*ctx.state, &job));
        stack.set_job(&ctx, &job);
        let ranked = stack.select(&mut ctx, &job.task_groups[0], &opts("x.web[0]")).unwrap();
        assert_eq!(ranked.node.id, a.id.min(b.id));
        assert_eq!(ctx.metrics.nodes_evaluated, 2);
        assert_eq!(ctx.metrics.nodes_in_pool, 2);
    }

    #[test]
    fn test_penalty_node_loses() {
        let a = mock::node();
        let b = mock::node();
        let (store, job) = setup(&[a.clone(), b.clone()]);
        let mut ctx = ctx_for(&store, &job);
        let low = a.id.min(b.id);

        let mut stack = Stack::new(StackKind::Generic);
        stack.set_nodes(ready_nodes_for_job(&*ctx.state, &job));
        stack.set_job(&ctx, &job);
        let options = SelectOptions {
            penalty_node_ids: BTreeSet::from([low]),
            ..opts("x.web[0]")
        };
        let ranked = stack.select(&mut ctx, &job.task_groups[0], &options).unwrap();
        assert_ne!(ranked.node.id, low);
    }

    #[test]
    fn test_preferred_node_wins_when_feasible() {
        let a = mock::node();
        let b = mock::node();
        let (store, job) = setup(&[a.clone(), b.clone()]);
        let mut ctx = ctx_for(&store, &job);
        let high = a.id.max(b.id);
        let preferred = ctx.state.node_by_id(&high).unwrap();

        let mut stack = Stack::new(StackKind::Generic);
        stack.set_nodes(ready_nodes_for_job(&*ctx.state, &job));
        stack.set_job(&ctx, &job);
        let options = SelectOptions {
            preferred_nodes: vec![preferred],
            ..opts("x.web[0]")
        };
        let ranked = stack.select(&mut ctx, &job.task_groups[0], &options).unwrap();
        assert_eq!(ranked.node.id, high);
    }

    #[test]
    fn test_no_fit_records_exhaustion() {
        let mut small = mock::node();
        small.resources.cpu_shares = 100;
        let (store, job) = setup(&[small]);
        let mut ctx = ctx_for(&store, &job);

        let mut stack = Stack::new(StackKind::Generic);
        stack.set_nodes(ready_nodes_for_job(&*ctx.state, &job));
        stack.set_job(&ctx, &job);
        assert!(stack.select(&mut ctx, &job.task_groups[0], &opts("x.web[0]")).is_none());
        assert_eq!(ctx.metrics.nodes_exhausted, 1);
        assert_eq!(ctx.metrics.dimension_exhausted.get("cpu"), Some(&1));
    }
}
