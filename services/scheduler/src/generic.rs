//! Service and batch driver.
//!
//! Each attempt reconciles the job against its allocations, turns the
//! result into a plan, places what needs placing through the stack and
//! submits the plan. Partly rejected plans are retried against fresher
//! state; placements that found no node are recorded as failed group
//! metrics and parked in one blocked evaluation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use convoy_id::{DeploymentId, NodeId};
use convoy_reconcile::{
    reschedule::next_tracker, update_by_spec, AllocReconciler, ReconcileResults, TaintedNodes,
    UpdateType,
};
use convoy_structs::{
    AllocDeploymentStatus, AllocMetric, Allocation, Deployment, DeploymentStatus, EvalStatus,
    Evaluation, Job, Node, NodeStatus, Plan, TaskGroup, EVAL_DESC_MAX_PLANS,
};
use tracing::{debug, info, instrument, warn};

use crate::context::EvalContext;
use crate::error::{Result, SchedulerError};
use crate::scheduler::{progress_made, retry_max, Attempt, Clock, Planner, Scheduler};
use crate::stack::{ready_nodes_for_job, SelectOptions, Stack, StackKind};
use crate::state::State;

/// Attempts without progress before a service evaluation fails.
pub const MAX_SERVICE_SCHEDULE_ATTEMPTS: u32 = 5;

/// Attempts without progress before a batch evaluation fails.
pub const MAX_BATCH_SCHEDULE_ATTEMPTS: u32 = 2;

pub struct GenericScheduler<'a> {
    batch: bool,
    state: Arc<dyn State>,
    planner: &'a dyn Planner,
    clock: &'a dyn Clock,
    blocked: Option<Evaluation>,
    queued_allocs: BTreeMap<String, u32>,
    failed_tg_allocs: BTreeMap<String, AllocMetric>,
}

impl<'a> GenericScheduler<'a> {
    pub fn new(
        batch: bool,
        state: Arc<dyn State>,
        planner: &'a dyn Planner,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            batch,
            state,
            planner,
            clock,
            blocked: None,
            queued_allocs: BTreeMap::new(),
            failed_tg_allocs: BTreeMap::new(),
        }
    }

    fn set_status(&self, eval: &Evaluation, status: EvalStatus, description: &str) -> Result<()> {
        let mut updated = eval.clone();
        updated.status = status;
        updated.status_description = description.to_string();
        updated.blocked_eval = self.blocked.as_ref().map(|b| b.id);
        updated.queued_allocations = self.queued_allocs.clone();
        updated.failed_tg_allocs = self.failed_tg_allocs.clone();
        updated.snapshot_index = self.state.index();
        updated.modify_time = self.clock.now();
        self.planner.update_eval(&updated)
    }

    fn process_once(&mut self, eval: &Evaluation) -> Result<Attempt> {
        let now = self.clock.now();
        self.failed_tg_allocs.clear();
        self.queued_allocs.clear();

        let job = self.state.job_by_id(&eval.namespace, &eval.job_id);
        let mut plan = Plan::new(eval.id, eval.priority, job.clone());
        plan.snapshot_index = self.state.index();
        if eval.annotate_plan {
            plan.annotations = Some(Default::default());
        }
        let mut ctx = EvalContext::new(Arc::clone(&self.state), plan, eval.id, now);

        let followups = self.compute_job_allocs(&mut ctx, eval, job.as_ref())?;

        let failed = !self.failed_tg_allocs.is_empty();
        if failed && self.blocked.is_none() {
            let mut blocked = eval.create_blocked_eval(
                ctx.eligibility.get_classes(),
                ctx.eligibility.has_escaped(),
                self.failed_tg_allocs.clone(),
                now,
            );
            blocked.snapshot_index = self.state.index();
            self.planner.create_eval(&blocked)?;
            info!(blocked_eval_id = %blocked.id, "Created blocked evaluation");
            self.blocked = Some(blocked);
        }

        if ctx.plan.is_no_op() && !eval.annotate_plan {
            return Ok(Attempt::Done);
        }

        for followup in &followups {
            self.planner.create_eval(followup)?;
        }

        let (result, fresh) = self.planner.submit_plan(&ctx.plan)?;
        let (full, expected, actual) = result.full_commit(&ctx.plan);
        if result.refresh_index != 0 || !full {
            warn!(
                expected_nodes = expected,
                committed_nodes = actual,
                refresh_index = result.refresh_index,
                "Plan partly rejected, retrying"
            );
            if let Some(fresh) = fresh {
                self.state = fresh;
            }
            return Ok(Attempt::Retry {
                progress: progress_made(&result),
            });
        }

        info!(
            placed = ctx.plan.placements().count(),
            stopped = ctx.plan.stops().count(),
            preempted = ctx.plan.preemptions().count(),
            "Plan committed"
        );
        Ok(Attempt::Done)
    }

    /// Reconciles and fills the plan. Returns the follow-up evaluations
    /// the plan's allocations point at.
    fn compute_job_allocs(
        &mut self,
        ctx: &mut EvalContext,
        eval: &Evaluation,
        job: Option<&Arc<Job>>,
    ) -> Result<Vec<Evaluation>> {
        let allocs = self.state.allocs_by_job(&eval.namespace, &eval.job_id, true);
        let tainted = tainted_nodes(&*self.state, &allocs);
        let deployment = self.state.latest_deployment_by_job(&eval.namespace, &eval.job_id);

        let state = Arc::clone(&self.state);
        let update_fn = move |existing: &Allocation, job: &Arc<Job>, tg: &TaskGroup| {
            match update_by_spec(existing, job, tg) {
                UpdateType::InPlace(_)
                    if !state
                        .node_by_id(&existing.node_id)
                        .is_some_and(|n| n.status == NodeStatus::Ready) =>
                {
                    UpdateType::Destructive
                }
                other => other,
            }
        };

        let results = AllocReconciler::new(
            &update_fn,
            self.batch,
            &eval.job_id,
            job.cloned(),
            deployment.clone(),
            allocs.into_iter().collect(),
            &tainted,
            eval,
            ctx.now,
        )
        .compute();
        debug!(
            place = results.place.len(),
            destructive = results.destructive_update.len(),
            inplace = results.inplace_update.len(),
            stop = results.stop.len(),
            "Reconciled job"
        );

        if let Some(annotations) = ctx.plan.annotations.as_mut() {
            annotations.desired_tg_updates = results.desired_tg_updates.clone();
        }
        ctx.plan.deployment = results.deployment.clone();
        ctx.plan.deployment_updates = results.deployment_updates.clone();

        let followups: Vec<Evaluation> = results.followup_evals().cloned().collect();
        let now = ctx.now;

        for stop in &results.stop {
            ctx.plan.append_stopped_alloc(
                &stop.alloc,
                stop.status_description,
                stop.client_status,
                stop.followup_eval_id,
                now,
            );
        }
        for alloc in results.disconnect_updates.values() {
            ctx.plan.append_unknown_alloc(alloc.clone(), now);
        }
        for alloc in results.reconnect_updates.values() {
            ctx.plan.append_alloc(alloc.clone());
        }
        for alloc in &results.inplace_update {
            let mut updated = alloc.clone();
            updated.eval_id = eval.id;
            ctx.plan.append_alloc(updated);
        }
        for alloc in results.attribute_updates.values() {
            ctx.plan.append_alloc(alloc.clone());
        }

        let Some(job) = job.filter(|j| !j.stopped()) else {
            return Ok(followups);
        };

        let deployment_id = results
            .deployment
            .as_ref()
            .map(|d| d.id)
            .or_else(|| active_deployment_id(deployment.as_ref(), job, &results));

        for tg in &job.task_groups {
            self.queued_allocs.insert(tg.name.clone(), 0);
        }

        let mut stack = Stack::new(StackKind::Generic);
        stack.set_nodes(ready_nodes_for_job(&*self.state, job));
        self.compute_placements(ctx, &mut stack, job, &results, deployment_id);
        Ok(followups)
    }

    fn compute_placements(
        &mut self,
        ctx: &mut EvalContext,
        stack: &mut Stack,
        job: &Arc<Job>,
        results: &ReconcileResults,
        deployment_id: Option<DeploymentId>,
    ) {
        let destructive = results.destructive_update.iter().map(|d| PlacementRequest {
            name: &d.place_name,
            task_group: &d.place_task_group,
            previous: Some(&d.stop_alloc),
            canary: false,
            reschedule: false,
            downgrade_from: None,
            stop: Some(d.stop_status_description),
        });
        let place = results.place.iter().map(|p| PlacementRequest {
            name: &p.name,
            task_group: &p.task_group,
            previous: p.previous_alloc.as_ref(),
            canary: p.canary,
            reschedule: p.reschedule,
            downgrade_from: p.downgrade_non_canary.then_some(p.min_job_version),
            stop: None,
        });

        for request in destructive.chain(place) {
            let place_job = match request.downgrade_from {
                Some(min_version) => downgraded_job(&*self.state, job, min_version),
                None => Arc::clone(job),
            };
            let Some(tg) = place_job.lookup_task_group(request.task_group) else {
                continue;
            };

            if let Some(metric) = self.failed_tg_allocs.get_mut(&tg.name) {
                metric.coalesced_failures += 1;
                *self.queued_allocs.entry(tg.name.clone()).or_default() += 1;
                continue;
            }

            if let (Some(description), Some(previous)) = (request.stop, request.previous) {
                ctx.plan
                    .append_stopped_alloc(previous, description, None, None, ctx.now);
            }

            ctx.reset_metrics();
            stack.set_job(ctx, &place_job);
            let options =
                self.select_options(request.previous, tg, request.reschedule, request.name);

            let Some(ranked) = stack.select(ctx, tg, &options) else {
                if let (Some(_), Some(previous)) = (request.stop, request.previous) {
                    ctx.plan.pop_update(previous);
                }
                warn!(
                    task_group = %tg.name,
                    alloc_name = request.name,
                    nodes_evaluated = ctx.metrics.nodes_evaluated,
                    nodes_filtered = ctx.metrics.nodes_filtered,
                    nodes_exhausted = ctx.metrics.nodes_exhausted,
                    "Failed to place allocation"
                );
                self.failed_tg_allocs
                    .insert(tg.name.clone(), std::mem::take(&mut ctx.metrics));
                *self.queued_allocs.entry(tg.name.clone()).or_default() += 1;
                continue;
            };

            let (mut alloc, preempted) = ranked.into_allocation(ctx, &place_job, tg, request.name);
            if request.downgrade_from.is_none() {
                alloc.deployment_id = deployment_id;
            }
            if request.canary {
                alloc.deployment_status = Some(AllocDeploymentStatus {
                    canary: true,
                    ..Default::default()
                });
            }
            if let Some(previous) = request.previous {
                alloc.previous_allocation = Some(previous.id);
                if request.reschedule {
                    alloc.reschedule_tracker =
                        Some(next_tracker(previous, tg.reschedule_policy.as_ref(), ctx.now));
                }
            }
            for victim in &preempted {
                ctx.plan.append_preempted_alloc(victim, alloc.id, ctx.now);
            }
            debug!(
                alloc_id = %alloc.id,
                alloc_name = %alloc.name,
                node_id = %alloc.node_id,
                preempted = preempted.len(),
                "Placed allocation"
            );
            ctx.plan.append_alloc(alloc);
        }
    }

    fn select_options(
        &self,
        previous: Option<&Allocation>,
        tg: &TaskGroup,
        reschedule: bool,
        name: &str,
    ) -> SelectOptions {
        let mut options = SelectOptions {
            alloc_name: name.to_string(),
            previous_alloc: previous.map(|p| p.id),
            ..Default::default()
        };
        let Some(previous) = previous else {
            return options;
        };
        if reschedule {
            options.penalty_node_ids = penalty_nodes(previous);
        }
        if tg.is_sticky() {
            if let Some(node) = self.state.node_by_id(&previous.node_id).filter(|n| n.ready()) {
                options.preferred_nodes.push(node);
            }
        }
        options
    }
}

impl Scheduler for GenericScheduler<'_> {
    #[instrument(
        skip(self, eval),
        fields(
            eval_id = %eval.id,
            job_id = %eval.job_id,
            namespace = %eval.namespace,
            triggered_by = %eval.triggered_by
        )
    )]
    fn process(&mut self, eval: &Evaluation) -> Result<()> {
        let limit = if self.batch {
            MAX_BATCH_SCHEDULE_ATTEMPTS
        } else {
            MAX_SERVICE_SCHEDULE_ATTEMPTS
        };

        match retry_max(limit, || self.process_once(eval)) {
            Ok(()) => {}
            Err(SchedulerError::MaxAttempts(attempts)) => {
                warn!(attempts, "Giving up on evaluation after repeated plan rejections");
                return self.set_status(eval, EvalStatus::Failed, EVAL_DESC_MAX_PLANS);
            }
            Err(e) => return Err(e),
        }

        self.set_status(eval, EvalStatus::Complete, "")
    }
}

struct PlacementRequest<'r> {
    name: &'r str,
    task_group: &'r str,
    previous: Option<&'r Allocation>,
    canary: bool,
    reschedule: bool,
    /// Place with the latest stable version at or above this one.
    downgrade_from: Option<u64>,
    /// Stop `previous` with this description before placing.
    stop: Option<&'static str>,
}

/// Nodes of the job's allocations that are down, disconnected, draining
/// or gone. Gone nodes map to `None`.
pub fn tainted_nodes(state: &dyn State, allocs: &[Allocation]) -> TaintedNodes {
    let mut tainted = TaintedNodes::new();
    let node_ids: BTreeSet<NodeId> = allocs.iter().map(|a| a.node_id).collect();
    for node_id in node_ids {
        match state.node_by_id(&node_id) {
            None => {
                tainted.insert(node_id, None);
            }
            Some(node) if is_tainted(&node) => {
                tainted.insert(node_id, Some(node));
            }
            Some(_) => {}
        }
    }
    tainted
}

fn is_tainted(node: &Node) -> bool {
    matches!(node.status, NodeStatus::Down | NodeStatus::Disconnected) || node.draining()
}

/// The node a failed allocation ran on plus every node its predecessors
/// failed on.
fn penalty_nodes(previous: &Allocation) -> BTreeSet<NodeId> {
    std::iter::once(previous.node_id)
        .chain(previous.reschedule_events().iter().map(|e| e.prev_node_id))
        .collect()
}

/// Latest stable version of the job at or above `min_version`, or the
/// current version when none is stable.
fn downgraded_job(state: &dyn State, job: &Arc<Job>, min_version: u64) -> Arc<Job> {
    state
        .job_versions(&job.namespace, &job.id)
        .into_iter()
        .filter(|j| j.stable && j.version >= min_version)
        .max_by_key(|j| j.version)
        .unwrap_or_else(|| Arc::clone(job))
}

/// The stored deployment new placements belong to, if it is still running
/// for this job version and the reconciler did not just end it.
fn active_deployment_id(
    deployment: Option<&Deployment>,
    job: &Job,
    results: &ReconcileResults,
) -> Option<DeploymentId> {
    let d = deployment?;
    let ended = results
        .deployment_updates
        .iter()
        .any(|u| u.deployment_id == d.id && u.status != DeploymentStatus::Running);
    (d.active() && d.matches_job(job) && !ended).then_some(d.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemStore;
    use chrono::Utc;
    use convoy_structs::mock;

    #[test]
    fn test_tainted_nodes_include_missing_and_draining() {
        let store = MemStore::new();
        let ready = mock::node();
        let draining = mock::drain_node();
        let mut down = mock::node();
        down.status = NodeStatus::Down;
        for node in [&ready, &draining, &down] {
            store.upsert_node(node.clone());
        }
        let job = Arc::new(mock::job());
        let gone = mock::node();
        let allocs: Vec<Allocation> = [&ready, &draining, &down, &gone]
            .iter()
            .enumerate()
            .map(|(i, n)| mock::alloc_for(&job, n, i as u32))
            .collect();

        let tainted = tainted_nodes(&*store.snapshot(), &allocs);
        assert_eq!(tainted.len(), 3);
        assert!(!tainted.contains_key(&ready.id));
        assert!(tainted.get(&draining.id).unwrap().is_some());
        assert!(tainted.get(&gone.id).unwrap().is_none());
    }

    #[test]
    fn test_downgraded_job_prefers_latest_stable() {
        let store = MemStore::new();
        let v0 = store.upsert_job(mock::job()).unwrap();
        let mut next = (*v0).clone();
        next.meta.insert("rev".into(), "1".into());
        let v1 = store.upsert_job(next).unwrap();
        assert_eq!(v1.version, 1);

        let snap = store.snapshot();
        // Nothing stable yet: keep the current version.
        assert_eq!(downgraded_job(&*snap, &v1, 0).version, 1);

        let mut deployment = mock::deployment(&v0);
        deployment.status = DeploymentStatus::Running;
        let id = deployment.id;
        store.upsert_deployment(deployment);
        let mut plan = Plan::new(convoy_id::EvalId::new(), 50, None);
        plan.deployment_updates.push(convoy_structs::DeploymentStatusUpdate {
            deployment_id: id,
            status: DeploymentStatus::Successful,
            status_description: String::new(),
        });
        store.apply_plan(&plan, Utc::now());

        let snap = store.snapshot();
        assert_eq!(downgraded_job(&*snap, &v1, 0).version, 0);
        assert_eq!(downgraded_job(&*snap, &v1, 1).version, 1);
    }

    #[test]
    fn test_penalty_nodes_follow_history() {
        let job = Arc::new(mock::job());
        let first = mock::node();
        let second = mock::node();
        let mut failed = mock::alloc_for(&job, &second, 0);
        failed.reschedule_tracker = Some(convoy_structs::RescheduleTracker {
            events: vec![convoy_structs::RescheduleEvent {
                reschedule_time: Utc::now(),
                prev_alloc_id: convoy_id::AllocId::new(),
                prev_node_id: first.id,
                delay: std::time::Duration::from_secs(5),
            }],
        });
        assert_eq!(penalty_nodes(&failed), BTreeSet::from([first.id, second.id]));
    }
}
