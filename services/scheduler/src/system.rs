//! System and sysbatch driver: one allocation of each group on every
//! eligible node.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use convoy_id::NodeId;
use convoy_reconcile::{update_by_spec, UpdateType};
use convoy_structs::{
    alloc_name, AllocClientStatus, AllocMetric, Allocation, EvalStatus, EvalTrigger, Evaluation,
    Job, Node, NodeStatus, Plan, ALLOC_JOB_STOPPED, ALLOC_LOST, ALLOC_NODE_TAINTED,
    ALLOC_NOT_NEEDED, ALLOC_RECONNECTED, ALLOC_UPDATING, EVAL_DESC_DISCONNECT_TIMEOUT,
    EVAL_DESC_MAX_PLANS,
};
use tracing::{debug, info, instrument, warn};

use crate::context::EvalContext;
use crate::error::{Result, SchedulerError};
use crate::generic::tainted_nodes;
use crate::scheduler::{progress_made, retry_max, Attempt, Clock, Planner, Scheduler};
use crate::stack::{ready_nodes_for_job, SelectOptions, Stack, StackKind};
use crate::state::State;

pub const MAX_SYSTEM_SCHEDULE_ATTEMPTS: u32 = 5;
pub const MAX_SYSBATCH_SCHEDULE_ATTEMPTS: u32 = 2;

const EVAL_DESC_ROLLING_UPDATE: &str = "created for the next rolling update batch";

fn after(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub struct SystemScheduler<'a> {
    sysbatch: bool,
    state: Arc<dyn State>,
    planner: &'a dyn Planner,
    clock: &'a dyn Clock,
    next_eval: Option<Evaluation>,
    queued_allocs: BTreeMap<String, u32>,
    failed_tg_allocs: BTreeMap<String, AllocMetric>,
}

/// What happens to the live allocation of one group on one node.
#[derive(Debug, Default)]
struct NodeDiff {
    /// (node, group) pairs that already have what they need.
    covered: BTreeSet<(NodeId, String)>,
    destructive: Vec<Allocation>,
    followups: Vec<Evaluation>,
}

impl<'a> SystemScheduler<'a> {
    pub fn new(
        sysbatch: bool,
        state: Arc<dyn State>,
        planner: &'a dyn Planner,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            sysbatch,
            state,
            planner,
            clock,
            next_eval: None,
            queued_allocs: BTreeMap::new(),
            failed_tg_allocs: BTreeMap::new(),
        }
    }

    fn set_status(&self, eval: &Evaluation, status: EvalStatus, description: &str) -> Result<()> {
        let mut updated = eval.clone();
        updated.status = status;
        updated.status_description = description.to_string();
        updated.next_eval = self.next_eval.as_ref().map(|e| e.id);
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
        let mut ctx = EvalContext::new(Arc::clone(&self.state), plan, eval.id, now);

        let active = job.as_ref().filter(|j| !j.stopped());
        let diff = self.diff_allocs(&mut ctx, eval, active);

        if let Some(job) = active {
            for tg in &job.task_groups {
                self.queued_allocs.insert(tg.name.clone(), 0);
            }
            let limited = self.compute_updates(&mut ctx, job, &diff);
            self.compute_placements(&mut ctx, job, &diff);

            if limited && self.next_eval.is_none() {
                let stagger = job
                    .task_groups
                    .iter()
                    .find_map(|tg| tg.update_strategy().map(|u| u.stagger))
                    .unwrap_or_default();
                let next = eval.create_delayed_eval(
                    EvalTrigger::RollingUpdate,
                    after(now, stagger),
                    EVAL_DESC_ROLLING_UPDATE,
                    now,
                );
                self.planner.create_eval(&next)?;
                debug!(next_eval_id = %next.id, "Scheduled next rolling update batch");
                self.next_eval = Some(next);
            }
        }

        if ctx.plan.is_no_op() {
            return Ok(Attempt::Done);
        }
        for followup in &diff.followups {
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
            "Plan committed"
        );
        Ok(Attempt::Done)
    }

    /// Walks the job's allocations, stopping what must go and recording
    /// which (node, group) pairs are already served.
    fn diff_allocs(
        &self,
        ctx: &mut EvalContext,
        eval: &Evaluation,
        job: Option<&Arc<Job>>,
    ) -> NodeDiff {
        let now = ctx.now;
        let allocs = self.state.allocs_by_job(&eval.namespace, &eval.job_id, true);
        let tainted = tainted_nodes(&*self.state, &allocs);
        let mut diff = NodeDiff::default();
        let mut disconnect_eval: Option<Evaluation> = None;

        for alloc in &allocs {
            let key = (alloc.node_id, alloc.task_group.clone());

            if alloc.terminal_status() {
                // Sysbatch work that finished on this version is not run again.
                let done = self.sysbatch
                    && alloc.ran_successfully()
                    && job.is_some_and(|j| alloc.job_version() == j.version);
                if done {
                    diff.covered.insert(key);
                }
                continue;
            }

            let Some(job) = job else {
                ctx.plan
                    .append_stopped_alloc(alloc, ALLOC_JOB_STOPPED, None, None, now);
                continue;
            };
            let Some(tg) = job.lookup_task_group(&alloc.task_group) else {
                ctx.plan
                    .append_stopped_alloc(alloc, ALLOC_NOT_NEEDED, None, None, now);
                continue;
            };

            match tainted.get(&alloc.node_id) {
                Some(None) => {
                    ctx.plan.append_stopped_alloc(
                        alloc,
                        ALLOC_LOST,
                        Some(AllocClientStatus::Lost),
                        None,
                        now,
                    );
                }
                Some(Some(node)) if node.status == NodeStatus::Down => {
                    ctx.plan.append_stopped_alloc(
                        alloc,
                        ALLOC_LOST,
                        Some(AllocClientStatus::Lost),
                        None,
                        now,
                    );
                }
                Some(Some(node)) if node.status == NodeStatus::Disconnected => {
                    let Some(lost_after) = tg.lost_after() else {
                        ctx.plan.append_stopped_alloc(
                            alloc,
                            ALLOC_LOST,
                            Some(AllocClientStatus::Lost),
                            None,
                            now,
                        );
                        continue;
                    };
                    match alloc.client_status {
                        AllocClientStatus::Running => {
                            let followup = disconnect_eval.get_or_insert_with(|| {
                                eval.create_delayed_eval(
                                    EvalTrigger::MaxDisconnectTimeout,
                                    after(now, lost_after),
                                    EVAL_DESC_DISCONNECT_TIMEOUT,
                                    now,
                                )
                            });
                            let mut unknown = alloc.clone();
                            unknown.followup_eval_id = Some(followup.id);
                            ctx.plan.append_unknown_alloc(unknown, now);
                            diff.covered.insert(key);
                        }
                        AllocClientStatus::Unknown if alloc.disconnect_expired(now) => {
                            ctx.plan.append_stopped_alloc(
                                alloc,
                                ALLOC_LOST,
                                Some(AllocClientStatus::Lost),
                                None,
                                now,
                            );
                        }
                        _ => {
                            diff.covered.insert(key);
                        }
                    }
                }
                Some(Some(node)) if node.draining() => {
                    let ignore = node.drain.as_ref().is_some_and(|d| d.ignore_system_jobs);
                    if ignore {
                        diff.covered.insert(key);
                    } else {
                        ctx.plan
                            .append_stopped_alloc(alloc, ALLOC_NODE_TAINTED, None, None, now);
                    }
                }
                _ => {
                    let Some(node) = self.state.node_by_id(&alloc.node_id) else {
                        continue;
                    };
                    if !job.targets_datacenter(&node.datacenter)
                        || !job.targets_pool(&node.node_pool)
                    {
                        ctx.plan
                            .append_stopped_alloc(alloc, ALLOC_NOT_NEEDED, None, None, now);
                        continue;
                    }
                    diff.covered.insert(key);

                    if alloc.needs_to_reconnect()
                        && alloc.client_status != AllocClientStatus::Unknown
                    {
                        let mut reconnected = alloc.clone();
                        reconnected.desired_description = ALLOC_RECONNECTED.to_string();
                        ctx.plan.append_alloc(reconnected);
                        continue;
                    }
                    match update_by_spec(alloc, job, tg) {
                        UpdateType::Ignore => {}
                        UpdateType::InPlace(updated) => {
                            let mut updated = *updated;
                            updated.eval_id = eval.id;
                            ctx.plan.append_alloc(updated);
                        }
                        UpdateType::Destructive => diff.destructive.push(alloc.clone()),
                    }
                }
            }
        }

        diff.followups.extend(disconnect_eval);
        diff
    }

    /// Replaces outdated allocations in place on their node, at most
    /// `max_parallel` per group. Returns whether some were held back.
    fn compute_updates(&mut self, ctx: &mut EvalContext, job: &Arc<Job>, diff: &NodeDiff) -> bool {
        let mut limited = false;
        let mut done: BTreeMap<&str, u32> = BTreeMap::new();

        for alloc in &diff.destructive {
            let Some(tg) = job.lookup_task_group(&alloc.task_group) else {
                continue;
            };
            let limit = tg
                .update_strategy()
                .map(|u| u.max_parallel)
                .filter(|n| *n > 0)
                .unwrap_or(u32::MAX);
            let count = done.entry(tg.name.as_str()).or_default();
            if *count >= limit {
                limited = true;
                continue;
            }
            let Some(node) = self.state.node_by_id(&alloc.node_id) else {
                continue;
            };

            ctx.plan
                .append_stopped_alloc(alloc, ALLOC_UPDATING, None, None, ctx.now);
            if self.place_on(ctx, job, &tg.name, &node, Some(alloc)) {
                *count += 1;
            } else {
                ctx.plan.pop_update(alloc);
            }
        }
        limited
    }

    fn compute_placements(&mut self, ctx: &mut EvalContext, job: &Arc<Job>, diff: &NodeDiff) {
        for node in ready_nodes_for_job(&*self.state, job) {
            for tg in &job.task_groups {
                if diff.covered.contains(&(node.id, tg.name.clone())) {
                    continue;
                }
                self.place_on(ctx, job, &tg.name, &node, None);
            }
        }
    }

    /// Places group `tg_name` on `node`, returning whether it fit.
    fn place_on(
        &mut self,
        ctx: &mut EvalContext,
        job: &Arc<Job>,
        tg_name: &str,
        node: &Arc<Node>,
        previous: Option<&Allocation>,
    ) -> bool {
        let Some(tg) = job.lookup_task_group(tg_name) else {
            return false;
        };
        let name = alloc_name(&job.id, &tg.name, 0);

        ctx.reset_metrics();
        let mut stack = Stack::new(StackKind::System);
        stack.set_nodes(vec![Arc::clone(node)]);
        stack.set_job(ctx, job);
        let options = SelectOptions {
            alloc_name: name.clone(),
            previous_alloc: previous.map(|a| a.id),
            ..Default::default()
        };

        let Some(ranked) = stack.select(ctx, tg, &options) else {
            // A node the group's constraints rule out is simply not a target.
            if ctx.metrics.nodes_filtered > 0 {
                return false;
            }
            debug!(node_id = %node.id, task_group = %tg.name, "Group does not fit on node");
            *self.queued_allocs.entry(tg.name.clone()).or_default() += 1;
            match self.failed_tg_allocs.get_mut(&tg.name) {
                Some(metric) => metric.coalesced_failures += 1,
                None => {
                    self.failed_tg_allocs
                        .insert(tg.name.clone(), std::mem::take(&mut ctx.metrics));
                }
            }
            return false;
        };

        let (mut alloc, preempted) = ranked.into_allocation(ctx, job, tg, &name);
        alloc.previous_allocation = previous.map(|a| a.id);
        for victim in &preempted {
            ctx.plan.append_preempted_alloc(victim, alloc.id, ctx.now);
        }
        ctx.plan.append_alloc(alloc);
        true
    }
}

impl Scheduler for SystemScheduler<'_> {
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
        let limit = if self.sysbatch {
            MAX_SYSBATCH_SCHEDULE_ATTEMPTS
        } else {
            MAX_SYSTEM_SCHEDULE_ATTEMPTS
        };
        match retry_max(limit, || self.process_once(eval)) {
            Ok(()) => self.set_status(eval, EvalStatus::Complete, ""),
            Err(SchedulerError::MaxAttempts(attempts)) => {
                warn!(attempts, "Giving up on evaluation after repeated plan rejections");
                self.set_status(eval, EvalStatus::Failed, EVAL_DESC_MAX_PLANS)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_after_saturates() {
        let now = Utc::now();
        assert_eq!(after(now, Duration::from_secs(30)), now + chrono::Duration::seconds(30));
        assert_eq!(after(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
