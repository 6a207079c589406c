//! Cluster state.
//!
//! Drivers only ever see a [`State`]: a point-in-time, read-only view of
//! nodes, jobs, allocations, deployments and evaluations. [`MemStore`] is the
//! in-memory implementation used by the binary and the test harness. Its
//! snapshots are copy-on-write, so a snapshot handed to a worker never
//! changes underneath it, and plans are committed through
//! [`MemStore::apply_plan`] with optimistic checks against the latest state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use convoy_id::{AllocId, DeploymentId, EvalId, NodeId};
use convoy_structs::{
    allocs_fit, AllocClientStatus, AllocStateEvent, Allocation, CsiVolume, Deployment,
    DeploymentStatus, DeploymentStatusUpdate, DrainStrategy, EvalTrigger, Evaluation, Job, Node,
    NodePool, NodeStatus, Plan, PlanResult, SchedulerConfiguration, SchedulingEligibility,
    VolumeKind, EVAL_DESC_PREEMPTION,
};
use tracing::{debug, warn};

use crate::error::{Result, SchedulerError};

/// `(namespace, id)` of a job or namespaced object.
pub type NamespacedKey = (String, String);

fn key(namespace: &str, id: &str) -> NamespacedKey {
    (namespace.to_string(), id.to_string())
}

/// Read-only view of cluster state at one index.
pub trait State: Send + Sync {
    /// Index of the last write included in this view.
    fn index(&self) -> u64;

    fn nodes(&self) -> Vec<Arc<Node>>;

    fn nodes_by_status(&self, status: NodeStatus) -> Vec<Arc<Node>> {
        self.nodes()
            .into_iter()
            .filter(|n| n.status == status)
            .collect()
    }

    fn node_by_id(&self, id: &NodeId) -> Option<Arc<Node>>;

    fn node_pool_by_name(&self, name: &str) -> Option<NodePool>;

    fn jobs(&self) -> Vec<Arc<Job>>;

    fn job_by_id(&self, namespace: &str, job_id: &str) -> Option<Arc<Job>>;

    /// Every retained version of a job, oldest first.
    fn job_versions(&self, namespace: &str, job_id: &str) -> Vec<Arc<Job>>;

    fn allocs_by_job(
        &self,
        namespace: &str,
        job_id: &str,
        include_terminal: bool,
    ) -> Vec<Allocation>;

    fn allocs_by_node(&self, node_id: &NodeId, include_terminal: bool) -> Vec<Allocation>;

    fn alloc_by_id(&self, id: &AllocId) -> Option<Allocation>;

    /// Deployments of a job, oldest first.
    fn deployments_by_job(&self, namespace: &str, job_id: &str) -> Vec<Deployment>;

    fn latest_deployment_by_job(&self, namespace: &str, job_id: &str) -> Option<Deployment> {
        self.deployments_by_job(namespace, job_id).pop()
    }

    fn csi_volume_by_id(&self, namespace: &str, id: &str) -> Option<CsiVolume>;

    fn csi_volumes_by_plugin(&self, plugin_id: &str) -> Vec<CsiVolume>;

    fn eval_by_id(&self, id: &EvalId) -> Option<Evaluation>;

    fn scheduler_config(&self) -> SchedulerConfiguration;
}

/// Everything the store holds at one index.
#[derive(Debug, Clone, Default)]
pub struct StateData {
    index: u64,
    nodes: BTreeMap<NodeId, Arc<Node>>,
    node_pools: BTreeMap<String, NodePool>,
    jobs: BTreeMap<NamespacedKey, Arc<Job>>,
    job_versions: BTreeMap<NamespacedKey, BTreeMap<u64, Arc<Job>>>,
    allocs: BTreeMap<AllocId, Allocation>,
    allocs_by_job: BTreeMap<NamespacedKey, BTreeSet<AllocId>>,
    allocs_by_node: BTreeMap<NodeId, BTreeSet<AllocId>>,
    deployments: BTreeMap<DeploymentId, Deployment>,
    evals: BTreeMap<EvalId, Evaluation>,
    csi_volumes: BTreeMap<NamespacedKey, CsiVolume>,
    scheduler_config: SchedulerConfiguration,
}

/// Immutable view handed to drivers.
pub type Snapshot = Arc<StateData>;

impl State for StateData {
    fn index(&self) -> u64 {
        self.index
    }

    fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.values().cloned().collect()
    }

    fn node_by_id(&self, id: &NodeId) -> Option<Arc<Node>> {
        self.nodes.get(id).cloned()
    }

    fn node_pool_by_name(&self, name: &str) -> Option<NodePool> {
        self.node_pools.get(name).cloned()
    }

    fn jobs(&self) -> Vec<Arc<Job>> {
        self.jobs.values().cloned().collect()
    }

    fn job_by_id(&self, namespace: &str, job_id: &str) -> Option<Arc<Job>> {
        self.jobs.get(&key(namespace, job_id)).cloned()
    }

    fn job_versions(&self, namespace: &str, job_id: &str) -> Vec<Arc<Job>> {
        self.job_versions
            .get(&key(namespace, job_id))
            .map(|v| v.values().cloned().collect())
            .unwrap_or_default()
    }

    fn allocs_by_job(
        &self,
        namespace: &str,
        job_id: &str,
        include_terminal: bool,
    ) -> Vec<Allocation> {
        self.collect_allocs(self.allocs_by_job.get(&key(namespace, job_id)), include_terminal)
    }

    fn allocs_by_node(&self, node_id: &NodeId, include_terminal: bool) -> Vec<Allocation> {
        self.collect_allocs(self.allocs_by_node.get(node_id), include_terminal)
    }

    fn alloc_by_id(&self, id: &AllocId) -> Option<Allocation> {
        self.allocs.get(id).cloned()
    }

    fn deployments_by_job(&self, namespace: &str, job_id: &str) -> Vec<Deployment> {
        let mut out: Vec<Deployment> = self
            .deployments
            .values()
            .filter(|d| d.namespace == namespace && d.job_id == job_id)
            .cloned()
            .collect();
        out.sort_by_key(|d| (d.create_index, d.id));
        out
    }

    fn csi_volume_by_id(&self, namespace: &str, id: &str) -> Option<CsiVolume> {
        self.csi_volumes.get(&key(namespace, id)).cloned()
    }

    fn csi_volumes_by_plugin(&self, plugin_id: &str) -> Vec<CsiVolume> {
        self.csi_volumes
            .values()
            .filter(|v| v.plugin_id == plugin_id)
            .cloned()
            .collect()
    }

    fn eval_by_id(&self, id: &EvalId) -> Option<Evaluation> {
        self.evals.get(id).cloned()
    }

    fn scheduler_config(&self) -> SchedulerConfiguration {
        self.scheduler_config.clone()
    }
}

impl StateData {
    fn collect_allocs(
        &self,
        ids: Option<&BTreeSet<AllocId>>,
        include_terminal: bool,
    ) -> Vec<Allocation> {
        ids.into_iter()
            .flatten()
            .filter_map(|id| self.allocs.get(id))
            .filter(|a| include_terminal || !a.terminal_status())
            .cloned()
            .collect()
    }

    pub fn evals(&self) -> impl Iterator<Item = &Evaluation> {
        self.evals.values()
    }

    pub fn allocs(&self) -> impl Iterator<Item = &Allocation> {
        self.allocs.values()
    }

    fn put_alloc(&mut self, alloc: Allocation) {
        self.allocs_by_job
            .entry(key(&alloc.namespace, &alloc.job_id))
            .or_default()
            .insert(alloc.id);
        self.allocs_by_node
            .entry(alloc.node_id)
            .or_default()
            .insert(alloc.id);
        self.allocs.insert(alloc.id, alloc);
    }

    fn put_job(&mut self, job: Arc<Job>) {
        let k = key(&job.namespace, &job.id);
        self.job_versions
            .entry(k.clone())
            .or_default()
            .insert(job.version, Arc::clone(&job));
        self.jobs.insert(k, job);
    }

    /// Marks a job version stable once its deployment succeeded.
    fn mark_job_stable(&mut self, namespace: &str, job_id: &str, version: u64) {
        let k = key(namespace, job_id);
        let Some(stored) = self.job_versions.get(&k).and_then(|v| v.get(&version)) else {
            return;
        };
        if stored.stable {
            return;
        }
        let mut job = (**stored).clone();
        job.stable = true;
        let job = Arc::new(job);
        if let Some(versions) = self.job_versions.get_mut(&k) {
            versions.insert(version, Arc::clone(&job));
        }
        if self.jobs.get(&k).is_some_and(|current| current.version == version) {
            self.jobs.insert(k, job);
        }
    }

    fn claim_volumes(&mut self, alloc: &Allocation) {
        let Some(tg) = alloc.task_group_spec() else {
            return;
        };
        for request in tg.volumes.values().filter(|v| v.kind == VolumeKind::Csi) {
            let source = request.source_for(&alloc.name);
            if let Some(vol) = self.csi_volumes.get_mut(&key(&alloc.namespace, &source)) {
                if request.read_only {
                    vol.read_claims.insert(alloc.id, alloc.node_id);
                } else {
                    vol.write_claims.insert(alloc.id, alloc.node_id);
                }
            }
        }
    }

    fn release_volumes(&mut self, alloc_id: &AllocId) {
        for vol in self.csi_volumes.values_mut() {
            vol.read_claims.remove(alloc_id);
            vol.write_claims.remove(alloc_id);
        }
    }

    /// Whether the plan's changes for one node can be committed.
    fn node_plan_fits(&self, plan: &Plan, node_id: &NodeId) -> bool {
        let placed = plan
            .node_allocation
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        if placed.is_empty() {
            // Stops and evictions always go through.
            return true;
        }
        let Some(node) = self.nodes.get(node_id) else {
            return false;
        };
        if node.status == NodeStatus::Disconnected {
            return placed
                .iter()
                .all(|a| a.client_status == AllocClientStatus::Unknown);
        }
        if node.status != NodeStatus::Ready {
            return false;
        }
        let introduces = placed.iter().any(|a| !self.allocs.contains_key(&a.id));
        if introduces && !node.ready() {
            return false;
        }

        let removed: BTreeSet<AllocId> = plan
            .node_update
            .get(node_id)
            .into_iter()
            .flatten()
            .chain(plan.node_preemptions.get(node_id).into_iter().flatten())
            .chain(placed.iter())
            .map(|a| a.id)
            .collect();
        let proposed: Vec<&Allocation> = self
            .allocs_by_node
            .get(node_id)
            .into_iter()
            .flatten()
            .filter(|id| !removed.contains(id))
            .filter_map(|id| self.allocs.get(id))
            .filter(|a| !a.terminal_status())
            .chain(placed.iter().filter(|a| !a.terminal_status()))
            .collect();
        allocs_fit(node, proposed.iter().copied(), true).fit
    }

    /// Writes a stop or eviction from a plan over the stored allocation.
    fn merge_desired(&mut self, update: &Allocation, index: u64) {
        let Some(mut stored) = self.allocs.get(&update.id).cloned() else {
            return;
        };
        stored.desired_status = update.desired_status;
        stored.desired_description = update.desired_description.clone();
        if update.followup_eval_id.is_some() {
            stored.followup_eval_id = update.followup_eval_id;
        }
        if update.preempted_by_allocation.is_some() {
            stored.preempted_by_allocation = update.preempted_by_allocation;
        }
        if update.client_status != stored.client_status {
            stored.client_status = update.client_status;
            if let Some(event) = update.alloc_states.last() {
                stored.alloc_states.push(event.clone());
            }
        }
        stored.modify_index = index;
        stored.alloc_modify_index = index;
        stored.modify_time = update.modify_time;
        self.release_volumes(&stored.id);
        self.put_alloc(stored);
    }

    fn upsert_plan_deployment(&mut self, deployment: &Deployment, index: u64) {
        let mut deployment = deployment.clone();
        match self.deployments.get(&deployment.id) {
            Some(stored) => {
                deployment.create_index = stored.create_index;
                // Placement and health counters are owned by the store.
                for (tg, state) in deployment.task_groups.iter_mut() {
                    if let Some(old) = stored.task_groups.get(tg) {
                        state.placed_allocs = old.placed_allocs;
                        state.placed_canaries = old.placed_canaries.clone();
                        state.healthy_allocs = old.healthy_allocs;
                        state.unhealthy_allocs = old.unhealthy_allocs;
                    }
                }
            }
            None => deployment.create_index = index,
        }
        deployment.modify_index = index;
        self.deployments.insert(deployment.id, deployment);
    }

    fn apply_deployment_update(&mut self, update: &DeploymentStatusUpdate, index: u64) {
        let Some(d) = self.deployments.get_mut(&update.deployment_id) else {
            return;
        };
        d.status = update.status;
        d.status_description = update.status_description.clone();
        d.modify_index = index;
        if update.status == DeploymentStatus::Successful {
            let (namespace, job_id, version) =
                (d.namespace.clone(), d.job_id.clone(), d.job_version);
            self.mark_job_stable(&namespace, &job_id, version);
        }
    }

    fn record_placement(&mut self, alloc: &Allocation) {
        let Some(d) = alloc
            .deployment_id
            .and_then(|id| self.deployments.get_mut(&id))
        else {
            return;
        };
        let state = d.task_groups.entry(alloc.task_group.clone()).or_default();
        state.placed_allocs += 1;
        if alloc.is_canary() {
            state.placed_canaries.push(alloc.id);
        }
    }
}

/// Outcome of committing a plan.
#[derive(Debug, Clone, Default)]
pub struct PlanApplied {
    pub result: PlanResult,
    /// One evaluation per job that lost allocations to preemption.
    pub preemption_evals: Vec<Evaluation>,
}

/// In-memory cluster state with copy-on-write snapshots.
#[derive(Debug, Default)]
pub struct MemStore {
    data: RwLock<Arc<StateData>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time view; later writes never show up in it.
    pub fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.data.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn index(&self) -> u64 {
        self.snapshot().index
    }

    /// Applies `f` to a private copy of the state at a new index.
    fn write<R>(&self, f: impl FnOnce(&mut StateData, u64) -> R) -> R {
        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let data = Arc::make_mut(&mut guard);
        data.index += 1;
        let index = data.index;
        f(data, index)
    }

    pub fn set_scheduler_config(&self, config: SchedulerConfiguration) -> u64 {
        self.write(|data, index| {
            let create_index = if data.scheduler_config.create_index == 0 {
                index
            } else {
                data.scheduler_config.create_index
            };
            data.scheduler_config = SchedulerConfiguration {
                create_index,
                modify_index: index,
                ..config
            };
            index
        })
    }

    pub fn upsert_node_pool(&self, pool: NodePool) -> u64 {
        self.write(|data, index| {
            data.node_pools.insert(pool.name.clone(), pool);
            index
        })
    }

    /// Registers or replaces a node, recomputing its class.
    pub fn upsert_node(&self, mut node: Node) -> u64 {
        node.compute_class();
        self.write(|data, index| {
            node.create_index = data
                .nodes
                .get(&node.id)
                .map_or(index, |existing| existing.create_index);
            node.modify_index = index;
            data.nodes.insert(node.id, Arc::new(node));
            index
        })
    }

    pub fn update_node_status(
        &self,
        id: &NodeId,
        status: NodeStatus,
        now: DateTime<Utc>,
    ) -> Result<Arc<Node>> {
        self.update_node(id, |node| {
            node.status = status;
            node.status_updated_at = Some(now);
        })
    }

    pub fn update_node_drain(
        &self,
        id: &NodeId,
        drain: Option<DrainStrategy>,
    ) -> Result<Arc<Node>> {
        self.update_node(id, |node| {
            node.scheduling_eligibility = if drain.is_some() {
                SchedulingEligibility::Ineligible
            } else {
                SchedulingEligibility::Eligible
            };
            node.drain = drain;
        })
    }

    fn update_node(&self, id: &NodeId, f: impl FnOnce(&mut Node)) -> Result<Arc<Node>> {
        self.write(|data, index| {
            let Some(stored) = data.nodes.get(id) else {
                return Err(SchedulerError::InvalidEval(format!("node {id} not found")));
            };
            let mut node = (**stored).clone();
            f(&mut node);
            node.compute_class();
            node.modify_index = index;
            let node = Arc::new(node);
            data.nodes.insert(*id, Arc::clone(&node));
            Ok(node)
        })
    }

    /// Registers a job. A changed spec becomes a new version; an unchanged
    /// one is a no-op that returns the stored job.
    pub fn upsert_job(&self, mut job: Job) -> Result<Arc<Job>> {
        job.canonicalize();
        job.validate()?;
        Ok(self.write(|data, index| {
            let k = key(&job.namespace, &job.id);
            match data.jobs.get(&k) {
                Some(existing) if same_spec(existing, &job) => Arc::clone(existing),
                Some(existing) => {
                    job.version = existing.version + 1;
                    job.create_index = existing.create_index;
                    job.stable = false;
                    job.modify_index = index;
                    job.job_modify_index = index;
                    let job = Arc::new(job);
                    data.put_job(Arc::clone(&job));
                    job
                }
                None => {
                    job.version = 0;
                    job.stable = false;
                    job.create_index = index;
                    job.modify_index = index;
                    job.job_modify_index = index;
                    let job = Arc::new(job);
                    data.put_job(Arc::clone(&job));
                    job
                }
            }
        }))
    }

    pub fn upsert_allocs(&self, allocs: Vec<Allocation>) -> u64 {
        self.write(|data, index| {
            for mut alloc in allocs {
                alloc.create_index = data
                    .allocs
                    .get(&alloc.id)
                    .map_or(index, |existing| existing.create_index);
                alloc.modify_index = index;
                alloc.alloc_modify_index = index;
                if !alloc.terminal_status() {
                    data.claim_volumes(&alloc);
                }
                data.put_alloc(alloc);
            }
            index
        })
    }

    /// Records what the node reports about an allocation.
    pub fn update_alloc_client_status(
        &self,
        id: &AllocId,
        status: AllocClientStatus,
        now: DateTime<Utc>,
    ) -> Result<Allocation> {
        self.write(|data, index| {
            let mut alloc = data
                .allocs
                .get(id)
                .cloned()
                .ok_or(SchedulerError::AllocNotFound(*id))?;
            alloc.client_status = status;
            alloc.alloc_states.push(AllocStateEvent {
                client_status: status,
                time: now,
            });
            alloc.modify_index = index;
            alloc.modify_time = now;
            if status.is_terminal() {
                data.release_volumes(id);
            }
            data.put_alloc(alloc.clone());
            Ok(alloc)
        })
    }

    /// Records a deployment health verdict and counts it on the deployment.
    pub fn update_alloc_health(
        &self,
        id: &AllocId,
        healthy: bool,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.write(|data, index| {
            let mut alloc = data
                .allocs
                .get(id)
                .cloned()
                .ok_or(SchedulerError::AllocNotFound(*id))?;
            let status = alloc.deployment_status.get_or_insert_with(Default::default);
            status.healthy = Some(healthy);
            status.timestamp = Some(now);
            status.modify_index = index;
            alloc.modify_index = index;

            if let Some(d) = alloc
                .deployment_id
                .and_then(|did| data.deployments.get_mut(&did))
            {
                let state = d.task_groups.entry(alloc.task_group.clone()).or_default();
                if healthy {
                    state.healthy_allocs += 1;
                } else {
                    state.unhealthy_allocs += 1;
                }
                d.modify_index = index;
            }
            data.put_alloc(alloc);
            Ok(index)
        })
    }

    pub fn upsert_deployment(&self, mut deployment: Deployment) -> u64 {
        self.write(|data, index| {
            deployment.create_index = data
                .deployments
                .get(&deployment.id)
                .map_or(index, |d| d.create_index);
            deployment.modify_index = index;
            data.deployments.insert(deployment.id, deployment);
            index
        })
    }

    pub fn upsert_evals(&self, evals: &[Evaluation]) -> u64 {
        self.write(|data, index| {
            for eval in evals {
                let mut eval = eval.clone();
                eval.create_index = data
                    .evals
                    .get(&eval.id)
                    .map_or(index, |e| e.create_index);
                eval.modify_index = index;
                data.evals.insert(eval.id, eval);
            }
            index
        })
    }

    pub fn upsert_csi_volume(&self, volume: CsiVolume) -> u64 {
        self.write(|data, index| {
            data.csi_volumes
                .insert(key(&volume.namespace, &volume.id), volume);
            index
        })
    }

    /// Commits whatever part of `plan` still fits the latest state.
    ///
    /// A node's changes are rejected when the node is gone or no longer
    /// accepts work, or when the allocations proposed for it no longer fit.
    /// The whole plan is rejected when the job changed since the plan was
    /// computed, or when any node is rejected and the plan is all-at-once.
    /// Any rejection sets `refresh_index` so the caller retries against
    /// fresher state.
    pub fn apply_plan(&self, plan: &Plan, now: DateTime<Utc>) -> PlanApplied {
        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let current_index = guard.index;

        if let Some(job) = &plan.job {
            let stale = guard
                .jobs
                .get(&key(&job.namespace, &job.id))
                .is_some_and(|stored| stored.job_modify_index > job.job_modify_index);
            if stale {
                warn!(
                    eval_id = %plan.eval_id,
                    job_id = %job.id,
                    "plan computed against an outdated job"
                );
                return PlanApplied {
                    result: PlanResult {
                        refresh_index: current_index,
                        ..Default::default()
                    },
                    preemption_evals: Vec::new(),
                };
            }
        }

        let mut accepted = BTreeSet::new();
        let mut rejected = false;
        for node_id in plan.touched_nodes() {
            if guard.node_plan_fits(plan, &node_id) {
                accepted.insert(node_id);
            } else {
                debug!(eval_id = %plan.eval_id, node_id = %node_id, "node plan rejected");
                rejected = true;
            }
        }
        if rejected && plan.all_at_once {
            accepted.clear();
        }

        let data = Arc::make_mut(&mut guard);
        data.index += 1;
        let index = data.index;
        let mut result = PlanResult {
            refresh_index: if rejected { current_index } else { 0 },
            alloc_index: index,
            ..Default::default()
        };

        if let Some(deployment) = &plan.deployment {
            data.upsert_plan_deployment(deployment, index);
            result.deployment = Some(deployment.clone());
        }
        for update in &plan.deployment_updates {
            data.apply_deployment_update(update, index);
        }
        result.deployment_updates = plan.deployment_updates.clone();

        let mut preempted_jobs = BTreeSet::new();
        for node_id in &accepted {
            if let Some(stops) = plan.node_update.get(node_id) {
                for stop in stops {
                    data.merge_desired(stop, index);
                }
                result.node_update.insert(*node_id, stops.clone());
            }

            if let Some(evicted) = plan.node_preemptions.get(node_id) {
                for alloc in evicted {
                    data.merge_desired(alloc, index);
                    preempted_jobs.insert(key(&alloc.namespace, &alloc.job_id));
                }
                result.node_preemptions.insert(*node_id, evicted.clone());
            }

            if let Some(placed) = plan.node_allocation.get(node_id) {
                let mut committed = Vec::with_capacity(placed.len());
                for alloc in placed {
                    let mut alloc = alloc.clone();
                    alloc.modify_index = index;
                    alloc.alloc_modify_index = index;
                    match data.allocs.get(&alloc.id) {
                        Some(existing) => alloc.create_index = existing.create_index,
                        None => {
                            alloc.create_index = index;
                            alloc.create_time = now;
                            if let Some(prev_id) = alloc.previous_allocation {
                                if let Some(mut prev) = data.allocs.get(&prev_id).cloned() {
                                    prev.next_allocation = Some(alloc.id);
                                    prev.modify_index = index;
                                    data.put_alloc(prev);
                                }
                            }
                            data.record_placement(&alloc);
                            data.claim_volumes(&alloc);
                        }
                    }
                    data.put_alloc(alloc.clone());
                    committed.push(alloc);
                }
                result.node_allocation.insert(*node_id, committed);
            }
        }

        let mut preemption_evals = Vec::new();
        for (namespace, job_id) in preempted_jobs {
            let Some(job) = data.jobs.get(&key(&namespace, &job_id)).cloned() else {
                continue;
            };
            let mut eval = Evaluation::for_job(&job, EvalTrigger::Preemption, now);
            eval.status_description = EVAL_DESC_PREEMPTION.to_string();
            eval.create_index = index;
            eval.modify_index = index;
            data.evals.insert(eval.id, eval.clone());
            preemption_evals.push(eval);
        }

        PlanApplied {
            result,
            preemption_evals,
        }
    }
}

/// Compares two jobs ignoring the fields the store assigns.
fn same_spec(stored: &Job, incoming: &Job) -> bool {
    let mut normalized = incoming.clone();
    normalized.version = stored.version;
    normalized.stable = stored.stable;
    normalized.create_index = stored.create_index;
    normalized.modify_index = stored.modify_index;
    normalized.job_modify_index = stored.job_modify_index;
    normalized == *stored
}
