//! Node scoring.
//!
//! A feasible node becomes a [`RankedNode`] once bin-packing finds room
//! for the group on it. Each scorer then appends one component in `-1..=1`
//! and the final score is the mean of the components present.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use convoy_id::{AllocId, NodeId};
use convoy_structs::{
    node_meets, resolve_target, score_fit_binpack, score_fit_spread, Affinity, AllocClientStatus,
    AllocDesiredStatus, AllocatedDevice, AllocatedResources, AllocatedSharedResources,
    AllocatedTaskResources, Allocation, ComparableResources, DeviceAccounter, Job, NetworkIndex,
    Node, SchedulerAlgorithm, Spread, TaskGroup, MAX_FIT_SCORE,
};

use crate::context::EvalContext;
use crate::preemption::{select_victims, PreemptionAsk};

pub const SCORE_BINPACK: &str = "binpack";
pub const SCORE_JOB_ANTI_AFFINITY: &str = "job-anti-affinity";
pub const SCORE_RESCHEDULE_PENALTY: &str = "node-reschedule-penalty";
pub const SCORE_NODE_AFFINITY: &str = "node-affinity";
pub const SCORE_SPREAD: &str = "allocation-spread";

/// Value assumed for spread targets not listed explicitly.
const IMPLICIT_TARGET: &str = "*";

/// A node that can take the placement, with what it would be given.
#[derive(Debug, Clone)]
pub struct RankedNode {
    pub node: Arc<Node>,
    pub scores: Vec<f64>,
    pub final_score: f64,
    pub task_resources: BTreeMap<String, AllocatedTaskResources>,
    pub shared_resources: AllocatedSharedResources,
    /// Allocations to evict to make room.
    pub preempted: Vec<Allocation>,
}

impl RankedNode {
    fn push_score(&mut self, ctx: &mut EvalContext, name: &str, score: f64) {
        self.scores.push(score);
        ctx.metrics.score_node(&self.node, name, score);
    }

    /// Mean of the components.
    pub fn normalize(&mut self, ctx: &mut EvalContext) {
        self.final_score = if self.scores.is_empty() {
            0.0
        } else {
            self.scores.iter().sum::<f64>() / self.scores.len() as f64
        };
        ctx.metrics.norm_score_node(&self.node, self.final_score);
    }

    /// Turns the winning node into a pending allocation named `name`.
    /// Returns it along with the allocations it evicts.
    pub fn into_allocation(
        self,
        ctx: &EvalContext,
        job: &Arc<Job>,
        tg: &TaskGroup,
        name: &str,
    ) -> (Allocation, Vec<Allocation>) {
        let alloc = Allocation {
            id: AllocId::new(),
            namespace: job.namespace.clone(),
            eval_id: ctx.eval_id,
            name: name.to_string(),
            node_id: self.node.id,
            node_name: self.node.name.clone(),
            job_id: job.id.clone(),
            job: Some(Arc::clone(job)),
            task_group: tg.name.clone(),
            allocated_resources: AllocatedResources {
                tasks: self.task_resources,
                shared: self.shared_resources,
            },
            metrics: Some(ctx.metrics.clone()),
            desired_status: AllocDesiredStatus::Run,
            desired_description: String::new(),
            desired_transition: Default::default(),
            client_status: AllocClientStatus::Pending,
            client_description: String::new(),
            deployment_id: None,
            deployment_status: None,
            reschedule_tracker: None,
            followup_eval_id: None,
            previous_allocation: None,
            next_allocation: None,
            preempted_allocations: self.preempted.iter().map(|a| a.id).collect(),
            preempted_by_allocation: None,
            alloc_states: Vec::new(),
            create_index: 0,
            modify_index: 0,
            alloc_modify_index: 0,
            create_time: ctx.now,
            modify_time: ctx.now,
        };
        (alloc, self.preempted)
    }
}

/// Settings that shape bin-packing for one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct BinPackOptions {
    pub algorithm: SchedulerAlgorithm,
    pub memory_oversubscription: bool,
    pub preemption: bool,
}

/// Fits the group onto `node`, assigning ports, devices and cores.
/// Exhaustion is recorded in the context's metrics.
pub fn binpack(
    ctx: &mut EvalContext,
    node: &Arc<Node>,
    job: &Job,
    tg: &TaskGroup,
    opts: BinPackOptions,
) -> Option<RankedNode> {
    let proposed = ctx.proposed_allocs(&node.id);

    let mut net = NetworkIndex::new(node);
    if net.add_allocs(&proposed) {
        ctx.metrics.exhausted_node(node, "network: port collision");
        return None;
    }
    let offer = match net.assign_ports(&tg.networks) {
        Ok(offer) => offer,
        Err(dimension) => {
            ctx.metrics.exhausted_node(node, dimension);
            return None;
        }
    };

    let mut devices = DeviceAccounter::new(node);
    devices.add_allocs(&proposed);

    let mut free_cores = node.comparable_capacity().reserved_cores;
    for alloc in &proposed {
        for core in alloc.allocated_resources.reserved_cores() {
            free_cores.remove(&core);
        }
    }

    let mut tasks = BTreeMap::new();
    for task in &tg.tasks {
        let mut resources = AllocatedTaskResources {
            cpu_shares: task.resources.cpu,
            memory_mb: task.resources.memory_mb,
            memory_max_mb: if opts.memory_oversubscription
                && task.resources.memory_max_mb > task.resources.memory_mb
            {
                task.resources.memory_max_mb
            } else {
                0
            },
            ..Default::default()
        };

        if task.resources.cores > 0 {
            let picked: Vec<u32> = free_cores
                .iter()
                .copied()
                .take(task.resources.cores as usize)
                .collect();
            if picked.len() < task.resources.cores as usize {
                ctx.metrics.exhausted_node(node, "cores");
                return None;
            }
            for core in &picked {
                free_cores.remove(core);
            }
            resources.cpu_shares =
                u64::from(task.resources.cores) * node.resources.shares_per_core();
            resources.reserved_cores = picked;
        }

        for request in &task.resources.devices {
            let Some((key, ids)) = devices.offer(node, request, &BTreeSet::new()) else {
                ctx.metrics.exhausted_node(node, "devices");
                return None;
            };
            devices.claim(&key, &ids);
            resources.devices.push(AllocatedDevice { key, device_ids: ids });
        }
        tasks.insert(task.name.clone(), resources);
    }

    let shared = AllocatedSharedResources {
        disk_mb: tg.ephemeral_disk.size_mb,
        ports: offer.ports,
        mbits: offer.mbits,
    };
    let ask = AllocatedResources {
        tasks: tasks.clone(),
        shared: shared.clone(),
    }
    .comparable();

    let mut util = ComparableResources::default();
    for alloc in &proposed {
        util.add(&alloc.comparable_resources());
    }
    util.add(&ask);

    let mut preempted = Vec::new();
    if let Err(dimension) = node.comparable_capacity().superset(&util) {
        let victims = opts
            .preemption
            .then(|| {
                select_victims(
                    node,
                    &proposed,
                    PreemptionAsk {
                        namespace: &job.namespace,
                        job_id: &job.id,
                        priority: job.priority,
                        resources: &ask,
                    },
                )
            })
            .flatten();
        let Some(victims) = victims.filter(|v| !v.is_empty()) else {
            ctx.metrics.exhausted_node(node, dimension);
            return None;
        };
        for victim in &victims {
            util.subtract(&victim.comparable_resources());
        }
        preempted = victims;
    }

    let fit = match opts.algorithm {
        SchedulerAlgorithm::Binpack => score_fit_binpack(node, &util),
        SchedulerAlgorithm::Spread => score_fit_spread(node, &util),
    };

    let mut ranked = RankedNode {
        node: Arc::clone(node),
        scores: Vec::new(),
        final_score: 0.0,
        task_resources: tasks,
        shared_resources: shared,
        preempted,
    };
    ranked.push_score(ctx, SCORE_BINPACK, fit / MAX_FIT_SCORE);
    Some(ranked)
}

/// Penalises nodes already running the same group of the job.
pub struct JobAntiAffinity {
    desired: u32,
    collisions: BTreeMap<NodeId, u32>,
}

impl JobAntiAffinity {
    pub fn new(ctx: &EvalContext, job: &Job, tg: &TaskGroup) -> Self {
        let mut collisions = BTreeMap::new();
        for alloc in ctx.proposed_job_allocs(&job.namespace, &job.id) {
            if alloc.task_group == tg.name {
                *collisions.entry(alloc.node_id).or_insert(0) += 1;
            }
        }
        Self {
            desired: tg.count,
            collisions,
        }
    }

    pub fn score(&self, ctx: &mut EvalContext, ranked: &mut RankedNode) {
        let collisions = self.collisions.get(&ranked.node.id).copied().unwrap_or(0);
        if collisions > 0 && self.desired > 0 {
            let penalty = -f64::from(collisions + 1) / f64::from(self.desired);
            ranked.push_score(ctx, SCORE_JOB_ANTI_AFFINITY, penalty.max(-1.0));
        } else {
            ctx.metrics.score_node(&ranked.node, SCORE_JOB_ANTI_AFFINITY, 0.0);
        }
    }
}

/// Penalises nodes where the allocation being replaced already failed.
pub fn reschedule_penalty(
    ctx: &mut EvalContext,
    ranked: &mut RankedNode,
    penalty_nodes: &BTreeSet<NodeId>,
) {
    if penalty_nodes.contains(&ranked.node.id) {
        ranked.push_score(ctx, SCORE_RESCHEDULE_PENALTY, -1.0);
    } else {
        ctx.metrics.score_node(&ranked.node, SCORE_RESCHEDULE_PENALTY, 0.0);
    }
}

/// Weighted affinity match: matched weights over the sum of |weights|.
pub struct NodeAffinity {
    affinities: Vec<Affinity>,
    total_weight: f64,
}

impl NodeAffinity {
    pub fn new(job: &Job, tg: &TaskGroup) -> Self {
        let affinities: Vec<Affinity> = job
            .affinities
            .iter()
            .chain(tg.affinities.iter())
            .chain(tg.tasks.iter().flat_map(|t| t.affinities.iter()))
            .cloned()
            .collect();
        let total_weight = affinities.iter().map(|a| f64::from(a.weight).abs()).sum();
        Self {
            affinities,
            total_weight,
        }
    }

    pub fn score(&self, ctx: &mut EvalContext, ranked: &mut RankedNode) {
        if self.affinities.is_empty() || self.total_weight == 0.0 {
            return;
        }
        let mut matched = 0.0;
        for affinity in &self.affinities {
            if node_meets(&affinity.as_constraint(), &ranked.node, &mut ctx.cache) {
                matched += f64::from(affinity.weight);
            }
        }
        let score = matched / self.total_weight;
        if score != 0.0 {
            ranked.push_score(ctx, SCORE_NODE_AFFINITY, score);
        }
    }
}

struct SpreadDetails {
    attribute: String,
    /// Share of the total spread weight.
    weight: f64,
    /// Desired allocation count per value; empty for an even spread.
    desired: BTreeMap<String, f64>,
    /// Allocations of the group per value, before this placement.
    used: BTreeMap<String, u32>,
}

/// Scores nodes by how much placing here improves the distribution of the
/// group across each spread attribute.
pub struct SpreadScorer {
    spreads: Vec<SpreadDetails>,
}

impl SpreadScorer {
    pub fn new(ctx: &EvalContext, job: &Job, tg: &TaskGroup) -> Self {
        let spreads: Vec<&Spread> = job.spreads.iter().chain(tg.spreads.iter()).collect();
        let total_weight: u32 = spreads.iter().map(|s| u32::from(s.weight)).sum();
        if spreads.is_empty() || total_weight == 0 {
            return Self { spreads: Vec::new() };
        }

        let group_allocs: Vec<Allocation> = ctx
            .proposed_job_allocs(&job.namespace, &job.id)
            .into_iter()
            .filter(|a| a.task_group == tg.name)
            .collect();
        let mut hosts: BTreeMap<NodeId, Option<Arc<Node>>> = BTreeMap::new();
        for alloc in &group_allocs {
            hosts
                .entry(alloc.node_id)
                .or_insert_with(|| ctx.state.node_by_id(&alloc.node_id));
        }

        let details = spreads
            .into_iter()
            .map(|spread| {
                let mut used = BTreeMap::new();
                for alloc in &group_allocs {
                    let Some(Some(host)) = hosts.get(&alloc.node_id) else {
                        continue;
                    };
                    if let Some(value) = resolve_target(&spread.attribute, host) {
                        *used.entry(value.into_owned()).or_insert(0) += 1;
                    }
                }

                let mut desired = BTreeMap::new();
                let mut assigned = 0u32;
                for target in &spread.targets {
                    assigned += u32::from(target.percent);
                    desired.insert(
                        target.value.clone(),
                        f64::from(target.percent) / 100.0 * f64::from(tg.count),
                    );
                }
                if !spread.targets.is_empty() && assigned < 100 {
                    desired.insert(
                        IMPLICIT_TARGET.to_string(),
                        f64::from(100 - assigned) / 100.0 * f64::from(tg.count),
                    );
                }

                SpreadDetails {
                    attribute: spread.attribute.clone(),
                    weight: f64::from(spread.weight) / f64::from(total_weight),
                    desired,
                    used,
                }
            })
            .collect();
        Self { spreads: details }
    }

    pub fn score(&self, ctx: &mut EvalContext, ranked: &mut RankedNode) {
        if self.spreads.is_empty() {
            return;
        }
        let mut total = 0.0;
        for spread in &self.spreads {
            let Some(value) = resolve_target(&spread.attribute, &ranked.node) else {
                total -= spread.weight;
                continue;
            };
            let boost = if spread.desired.is_empty() {
                even_spread_boost(&spread.used, &value)
            } else {
                target_spread_boost(spread, &value)
            };
            total += boost * spread.weight;
        }
        if total != 0.0 {
            ranked.push_score(ctx, SCORE_SPREAD, total);
        }
    }
}

/// Favors values whose share is below target; `-1` for values with no
/// target at all.
fn target_spread_boost(spread: &SpreadDetails, value: &str) -> f64 {
    let desired = spread
        .desired
        .get(value)
        .or_else(|| spread.desired.get(IMPLICIT_TARGET))
        .copied()
        .unwrap_or(0.0);
    if desired <= 0.0 {
        return -1.0;
    }
    let used = f64::from(spread.used.get(value).copied().unwrap_or(0) + 1);
    ((desired - used) / desired).clamp(-1.0, 1.0)
}

/// With no targets every observed value should hold the same count. The
/// least used value is boosted by the current imbalance; others are
/// penalised by how far they are ahead of it.
fn even_spread_boost(used: &BTreeMap<String, u32>, value: &str) -> f64 {
    let current = used.get(value).copied().unwrap_or(0);
    let min = used.values().copied().chain([current]).min().unwrap_or(0);
    let max = used.values().copied().chain([current]).max().unwrap_or(0);
    if min == max {
        return 0.0;
    }
    let max = f64::from(max);
    if current == min {
        (max - f64::from(min)) / max
    } else {
        -(f64::from(current - min)) / max
    }
}
