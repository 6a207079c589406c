//! The allocation reconciler.
//!
//! Given a job, its current deployment and every allocation the job has,
//! decides what to place, stop, update in place, replace and migrate so the
//! cluster converges on the job. Nothing here reads the clock or touches
//! shared state: the caller passes `now` and applies the results.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use convoy_id::{AllocId, EvalId};
use convoy_structs::{
    AllocClientStatus, AllocDesiredStatus, AllocStateEvent, Allocation, Deployment,
    DeploymentState, DeploymentStatus, DeploymentStatusUpdate, DesiredUpdates, EvalTrigger,
    Evaluation, Job, TaskGroup, ALLOC_JOB_STOPPED, ALLOC_LOST, ALLOC_MIGRATING, ALLOC_NOT_NEEDED,
    ALLOC_RECONNECTED, ALLOC_RESCHEDULED, ALLOC_UPDATING, DEPLOYMENT_DESC_NEWER_JOB,
    DEPLOYMENT_DESC_RUNNING, DEPLOYMENT_DESC_RUNNING_AUTO_PROMOTION,
    DEPLOYMENT_DESC_RUNNING_NEEDS_PROMOTION, DEPLOYMENT_DESC_STOPPED_JOB,
    DEPLOYMENT_DESC_SUCCESSFUL, EVAL_DESC_DISCONNECT_TIMEOUT, EVAL_DESC_RESCHEDULE_LATER,
};

use crate::allocs::{AllocSet, DelayedReschedule, TaintedNodes, TaintedSplit};
use crate::names::AllocNameIndex;
use crate::reschedule::{to_chrono, BATCHED_FAILED_ALLOC_WINDOW};
use crate::tasks_updated;

/// How an existing allocation relates to the job version being reconciled.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateType {
    /// Already runs this version.
    Ignore,
    /// Has to be stopped and replaced.
    Destructive,
    /// Can be updated where it runs. Carries the updated allocation.
    InPlace(Box<Allocation>),
}

/// Classifies one allocation against the job and its task group.
pub type UpdateFn<'a> = dyn Fn(&Allocation, &Arc<Job>, &TaskGroup) -> UpdateType + 'a;

/// Spec-only update classification. The scheduler layers a feasibility
/// check on top before accepting an in-place update.
pub fn update_by_spec(existing: &Allocation, job: &Arc<Job>, group: &TaskGroup) -> UpdateType {
    let Some(current) = existing.job.as_ref() else {
        return UpdateType::Destructive;
    };
    if current.version == job.version
        && current.create_index == job.create_index
        && current.job_modify_index == job.job_modify_index
    {
        return UpdateType::Ignore;
    }
    if tasks_updated(current, job, &group.name) {
        return UpdateType::Destructive;
    }
    let mut updated = existing.stub_for_update();
    updated.job = Some(Arc::clone(job));
    UpdateType::InPlace(Box::new(updated))
}

/// A new allocation to place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllocPlaceResult {
    pub name: String,
    pub task_group: String,
    pub canary: bool,
    /// The allocation this one replaces, if any.
    pub previous_alloc: Option<Allocation>,
    pub reschedule: bool,
    pub lost: bool,
    /// Place with the latest stable job version rather than the current
    /// one, because the current version's canaries are not yet promoted.
    pub downgrade_non_canary: bool,
    pub min_job_version: u64,
}

/// An allocation to stop.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocStopResult {
    pub alloc: Allocation,
    pub client_status: Option<AllocClientStatus>,
    pub status_description: &'static str,
    pub followup_eval_id: Option<EvalId>,
}

/// Stop one allocation and place its replacement under the same name.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocDestructiveResult {
    pub place_name: String,
    pub place_task_group: String,
    pub stop_alloc: Allocation,
    pub stop_status_description: &'static str,
}

/// Everything one reconciliation decided.
#[derive(Debug, Clone, Default)]
pub struct ReconcileResults {
    /// Deployment to create or upsert.
    pub deployment: Option<Deployment>,
    pub deployment_updates: Vec<DeploymentStatusUpdate>,
    pub place: Vec<AllocPlaceResult>,
    pub destructive_update: Vec<AllocDestructiveResult>,
    pub inplace_update: Vec<Allocation>,
    pub stop: Vec<AllocStopResult>,
    /// Non-scheduling field changes, e.g. a follow-up eval link.
    pub attribute_updates: BTreeMap<AllocId, Allocation>,
    /// Allocations to mark `unknown`.
    pub disconnect_updates: BTreeMap<AllocId, Allocation>,
    pub reconnect_updates: BTreeMap<AllocId, Allocation>,
    pub desired_tg_updates: BTreeMap<String, DesiredUpdates>,
    pub desired_followup_evals: BTreeMap<String, Vec<Evaluation>>,
}

impl ReconcileResults {
    pub fn followup_evals(&self) -> impl Iterator<Item = &Evaluation> {
        self.desired_followup_evals.values().flatten()
    }
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Reconciles one job. Build it, call [`AllocReconciler::compute`].
pub struct AllocReconciler<'a> {
    update_fn: &'a UpdateFn<'a>,
    batch: bool,
    job_id: String,
    /// `None` when the job was purged.
    job: Option<Arc<Job>>,
    deployment: Option<Deployment>,
    old_deployment: Option<Deployment>,
    deployment_paused: bool,
    deployment_failed: bool,
    /// The deployment changed and has to be written with the plan.
    deployment_dirty: bool,
    existing: AllocSet,
    tainted: &'a TaintedNodes,
    eval: &'a Evaluation,
    now: DateTime<Utc>,
    result: ReconcileResults,
}

impl<'a> AllocReconciler<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        update_fn: &'a UpdateFn<'a>,
        batch: bool,
        job_id: &str,
        job: Option<Arc<Job>>,
        deployment: Option<Deployment>,
        existing: AllocSet,
        tainted: &'a TaintedNodes,
        eval: &'a Evaluation,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            update_fn,
            batch,
            job_id: job_id.to_string(),
            job,
            deployment,
            old_deployment: None,
            deployment_paused: false,
            deployment_failed: false,
            deployment_dirty: false,
            existing,
            tainted,
            eval,
            now,
            result: ReconcileResults::default(),
        }
    }

    pub fn compute(mut self) -> ReconcileResults {
        let matrix = self.alloc_matrix();
        self.cancel_unneeded_deployments();

        let Some(job) = self.active_job() else {
            self.handle_stop(matrix);
            return self.result;
        };

        self.compute_deployment_paused();
        self.auto_promote();

        let mut complete = true;
        for (group, allocs) in matrix {
            complete &= self.compute_group(&job, &group, allocs);
        }
        self.compute_deployment_updates(complete);
        self.result
    }

    fn active_job(&self) -> Option<Arc<Job>> {
        self.job.as_ref().filter(|j| !j.stopped()).cloned()
    }

    /// Allocations grouped by task group, including groups with none yet.
    fn alloc_matrix(&self) -> BTreeMap<String, AllocSet> {
        let mut matrix: BTreeMap<String, AllocSet> = BTreeMap::new();
        for alloc in self.existing.values() {
            matrix
                .entry(alloc.task_group.clone())
                .or_default()
                .insert(alloc.clone());
        }
        if let Some(job) = &self.job {
            for tg in &job.task_groups {
                matrix.entry(tg.name.clone()).or_default();
            }
        }
        matrix
    }

    fn cancel_deployment(&mut self, deployment: &Deployment, description: &str) {
        self.result.deployment_updates.push(DeploymentStatusUpdate {
            deployment_id: deployment.id,
            status: DeploymentStatus::Cancelled,
            status_description: description.to_string(),
        });
    }

    fn cancel_unneeded_deployments(&mut self) {
        let Some(deployment) = self.deployment.take() else {
            return;
        };
        let Some(job) = self.active_job() else {
            if deployment.active() {
                self.cancel_deployment(&deployment, DEPLOYMENT_DESC_STOPPED_JOB);
            }
            self.old_deployment = Some(deployment);
            return;
        };

        if !deployment.matches_job(&job) {
            if deployment.active() {
                self.cancel_deployment(&deployment, DEPLOYMENT_DESC_NEWER_JOB);
            }
            self.old_deployment = Some(deployment);
            return;
        }
        if deployment.status == DeploymentStatus::Successful {
            self.old_deployment = Some(deployment);
            return;
        }
        self.deployment = Some(deployment);
    }

    fn compute_deployment_paused(&mut self) {
        if let Some(d) = &self.deployment {
            self.deployment_paused = d.status == DeploymentStatus::Paused;
            self.deployment_failed = d.status == DeploymentStatus::Failed;
        }
    }

    /// Promotes the deployment once every canary group opts in and all of
    /// its placed canaries are healthy.
    fn auto_promote(&mut self) {
        let existing = &self.existing;
        let Some(d) = self.deployment.as_mut() else {
            return;
        };
        if d.status != DeploymentStatus::Running
            || !d.requires_promotion()
            || !d.has_auto_promote()
        {
            return;
        }
        let ready = d
            .task_groups
            .values()
            .filter(|s| s.desired_canaries > 0)
            .all(|s| {
                count(s.placed_canaries.len()) >= s.desired_canaries
                    && s
                        .placed_canaries
                        .iter()
                        .all(|id| existing.get(id).is_some_and(Allocation::is_healthy))
            });
        if !ready {
            return;
        }
        for state in d.task_groups.values_mut() {
            if state.desired_canaries > 0 {
                state.promoted = true;
            }
        }
        d.status_description = DEPLOYMENT_DESC_RUNNING.to_string();
        self.deployment_dirty = true;
    }

    fn handle_stop(&mut self, matrix: BTreeMap<String, AllocSet>) {
        for (group, allocs) in matrix {
            let stop = self.filter_and_stop_all(&allocs.filter_by_terminal(), ALLOC_JOB_STOPPED);
            self.result.desired_tg_updates.insert(
                group,
                DesiredUpdates {
                    stop,
                    ..Default::default()
                },
            );
        }
    }

    fn filter_and_stop_all(&mut self, set: &AllocSet, description: &'static str) -> u32 {
        let split = set.filter_by_tainted(self.tainted, self.now);
        self.mark_stop(&split.untainted, None, description);
        self.mark_stop(&split.migrate, None, description);
        self.mark_stop(&split.lost, Some(AllocClientStatus::Lost), ALLOC_LOST);
        self.mark_stop(&split.disconnecting, None, description);
        self.mark_stop(&split.reconnecting, None, description);
        self.mark_stop(
            &split.ignore.filter_by_client_status(AllocClientStatus::Unknown),
            None,
            description,
        );
        count(set.len())
    }

    fn mark_stop(
        &mut self,
        set: &AllocSet,
        client_status: Option<AllocClientStatus>,
        description: &'static str,
    ) {
        for alloc in set.values() {
            self.result.stop.push(AllocStopResult {
                alloc: alloc.clone(),
                client_status,
                status_description: description,
                followup_eval_id: None,
            });
        }
    }

    /// Reconciles one task group. Returns whether its part of the
    /// deployment is complete.
    fn compute_group(&mut self, job: &Arc<Job>, group: &str, all: AllocSet) -> bool {
        let mut du = DesiredUpdates::default();

        let Some(tg) = job.lookup_task_group(group) else {
            du.stop = self.filter_and_stop_all(&all.filter_by_terminal(), ALLOC_NOT_NEEDED);
            self.result.desired_tg_updates.insert(group.to_string(), du);
            return true;
        };

        let (mut dstate, existing_deployment) = self.initialize_deployment_state(tg);

        let (all, ignored) = self.filter_old_terminal_allocs(job, all);
        du.ignore += count(ignored.len());

        let (canaries, all) = self.cancel_unneeded_canaries(all, &mut du);

        let TaintedSplit {
            untainted,
            mut migrate,
            lost,
            disconnecting,
            reconnecting,
            ignore,
        } = all.filter_by_tainted(self.tainted, self.now);
        du.ignore += count(ignore.len());

        let split = untainted.filter_by_rescheduleable(
            self.batch,
            self.now,
            self.eval.id,
            self.deployment.as_ref(),
        );
        let mut untainted = split.untainted;
        let reschedule_now = split.now;
        let reschedule_later = split.later;
        du.reschedule_now = count(reschedule_now.len());
        du.reschedule_later = count(reschedule_later.len());

        if !reconnecting.is_empty() {
            let before = self.result.reconnect_updates.len();
            let (reconnect, stop) = self.reconcile_reconnecting(&reconnecting);
            du.stop += count(stop.len());
            du.reconnect_updates = count(self.result.reconnect_updates.len() - before);
            untainted = untainted.difference(&stop).union(&reconnect);
        }

        // Disconnected allocations stay put until they expire. They count
        // as running so no replacement is placed in the meantime.
        if !disconnecting.is_empty() {
            let unknown = self.create_disconnect_updates(&disconnecting, group);
            du.disconnect = count(unknown.len());
            untainted = untainted.union(&unknown);
        }

        if !reschedule_later.is_empty() {
            self.create_reschedule_later_evals(&reschedule_later, group);
        }

        let in_use = untainted
            .union(&migrate)
            .union(&reschedule_now)
            .union(&lost);
        let mut name_index = AllocNameIndex::new(&self.job_id, group, tg.count, &in_use);

        let is_canarying = dstate.awaiting_promotion();
        let stop = self.compute_stop(
            tg,
            &mut name_index,
            &untainted,
            &mut migrate,
            &lost,
            &canaries,
            is_canarying,
        );
        du.stop += count(stop.len());
        let mut untainted = untainted.difference(&stop);

        let (ignore, inplace, destructive) = self.compute_updates(job, tg, &untainted);
        du.ignore += count(ignore.len());
        du.in_place_update += count(inplace.len());
        if !existing_deployment {
            dstate.desired_total += count(destructive.len() + inplace.len());
        }

        // Canaries don't take part in placement decisions while unpromoted.
        if is_canarying {
            untainted = untainted.difference(&canaries);
        }
        let requires_canaries = Self::requires_canaries(tg, &dstate, &destructive, &canaries);
        if requires_canaries {
            self.compute_canaries(
                tg,
                &mut dstate,
                &destructive,
                &canaries,
                &mut du,
                &mut name_index,
            );
        }

        let is_canarying = dstate.awaiting_promotion();
        let under_provisioned_by =
            self.compute_under_provisioned_by(tg, &untainted, &destructive, &migrate, is_canarying);

        let place = Self::compute_placements(
            tg,
            &mut name_index,
            &untainted,
            &migrate,
            &reschedule_now,
            &lost,
            is_canarying,
        );
        let place_count = place.len();
        if !existing_deployment {
            dstate.desired_total += count(place_count);
        }

        let place_ready = !self.deployment_paused && !self.deployment_failed && !is_canarying;
        let under_provisioned_by = self.compute_replacements(
            place_ready,
            &mut du,
            place,
            &reschedule_now,
            &lost,
            under_provisioned_by,
        );

        if place_ready {
            self.compute_destructive_updates(&destructive, under_provisioned_by, &mut du, tg);
        } else {
            du.ignore += count(destructive.len());
        }

        self.compute_migrations(&mut du, &migrate, tg, is_canarying);
        self.create_deployment(
            job,
            tg,
            existing_deployment,
            dstate,
            &all,
            &destructive,
            !inplace.is_empty(),
        );

        let pending = destructive.len()
            + inplace.len()
            + place_count
            + migrate.len()
            + reschedule_now.len()
            + reschedule_later.len();
        let complete = self.is_deployment_complete(group, pending, requires_canaries);

        self.result.desired_tg_updates.insert(group.to_string(), du);
        complete
    }

    fn initialize_deployment_state(&self, tg: &TaskGroup) -> (DeploymentState, bool) {
        if let Some(state) = self
            .deployment
            .as_ref()
            .and_then(|d| d.task_groups.get(&tg.name))
        {
            return (state.clone(), true);
        }
        let mut state = DeploymentState::default();
        if let Some(update) = tg.update_strategy() {
            state.auto_revert = update.auto_revert;
            state.auto_promote = update.auto_promote;
            state.progress_deadline = update.progress_deadline;
        }
        (state, false)
    }

    /// Batch allocations of older versions that already finished don't
    /// count toward the group.
    fn filter_old_terminal_allocs(&self, job: &Job, all: AllocSet) -> (AllocSet, AllocSet) {
        if !self.batch {
            return (all, AllocSet::new());
        }
        let (ignored, kept): (Vec<_>, Vec<_>) = all.into_iter().partition(|alloc| {
            let older = alloc
                .job
                .as_ref()
                .is_none_or(|j| j.version < job.version || j.create_index < job.create_index);
            older && alloc.terminal_status()
        });
        (kept.into_iter().collect(), ignored.into_iter().collect())
    }

    /// Stops canaries of replaced or failed deployments and returns the
    /// current deployment's live canaries along with the remaining set.
    fn cancel_unneeded_canaries(
        &mut self,
        all: AllocSet,
        du: &mut DesiredUpdates,
    ) -> (AllocSet, AllocSet) {
        fn unpromoted(d: &Deployment) -> impl Iterator<Item = &AllocId> {
            d.task_groups
                .values()
                .filter(|s| !s.promoted)
                .flat_map(|s| s.placed_canaries.iter())
        }

        let mut stop_ids: Vec<AllocId> = Vec::new();
        if let Some(old) = &self.old_deployment {
            stop_ids.extend(unpromoted(old));
        }
        if let Some(d) = self
            .deployment
            .as_ref()
            .filter(|d| d.status == DeploymentStatus::Failed)
        {
            stop_ids.extend(unpromoted(d));
        }

        let stop = all.from_keys(&stop_ids);
        self.mark_stop(&stop, None, ALLOC_NOT_NEEDED);
        du.stop += count(stop.len());
        let all = all.difference(&stop);

        let Some(canary_ids) = self.deployment.as_ref().map(|d| {
            d.task_groups
                .values()
                .flat_map(|s| s.placed_canaries.iter().copied())
                .collect::<Vec<_>>()
        }) else {
            return (AllocSet::new(), all);
        };

        // Canaries on draining or lost nodes are stopped and placed again
        // as new canaries. These aren't reported as desired changes.
        let canaries = all.from_keys(&canary_ids);
        let split = canaries.filter_by_tainted(self.tainted, self.now);
        self.mark_stop(&split.migrate, None, ALLOC_MIGRATING);
        self.mark_stop(&split.lost, Some(AllocClientStatus::Lost), ALLOC_LOST);

        let all = all.difference(&split.migrate).difference(&split.lost);
        (split.untainted, all)
    }

    fn reconcile_reconnecting(&mut self, reconnecting: &AllocSet) -> (AllocSet, AllocSet) {
        let mut keep = AllocSet::new();
        let mut stop = AllocSet::new();

        for alloc in reconnecting.values() {
            let failed = alloc.client_status == AllocClientStatus::Failed;
            if alloc.desired_status != AllocDesiredStatus::Run || failed {
                let description = if failed { ALLOC_RESCHEDULED } else { ALLOC_NOT_NEEDED };
                self.result.stop.push(AllocStopResult {
                    alloc: alloc.clone(),
                    client_status: None,
                    status_description: description,
                    followup_eval_id: None,
                });
                stop.insert(alloc.clone());
                continue;
            }

            // The node is back but the client has not reported yet.
            if alloc.client_status == AllocClientStatus::Unknown {
                keep.insert(alloc.clone());
                continue;
            }

            let mut update = alloc.clone();
            update.alloc_states.push(AllocStateEvent {
                client_status: alloc.client_status,
                time: self.now,
            });
            update.desired_description = ALLOC_RECONNECTED.to_string();
            self.result.reconnect_updates.insert(alloc.id, update.clone());
            keep.insert(update);
        }
        (keep, stop)
    }

    /// Marks disconnecting allocations `unknown` and schedules the evals
    /// that will declare them lost. Returns them as they will look once
    /// the plan commits.
    fn create_disconnect_updates(&mut self, disconnecting: &AllocSet, group: &str) -> AllocSet {
        let due: Vec<(AllocId, DateTime<Utc>)> = disconnecting
            .values()
            .map(|alloc| {
                let lost_after = alloc
                    .task_group_spec()
                    .and_then(TaskGroup::lost_after)
                    .unwrap_or_default();
                let at = self
                    .now
                    .checked_add_signed(to_chrono(lost_after))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                (alloc.id, at)
            })
            .collect();
        let followups = self.batch_followup_evals(
            due,
            EvalTrigger::MaxDisconnectTimeout,
            EVAL_DESC_DISCONNECT_TIMEOUT,
            group,
        );

        let mut unknown = AllocSet::new();
        for alloc in disconnecting.values() {
            let mut update = alloc.clone();
            update.followup_eval_id = followups.get(&alloc.id).copied();
            self.result.disconnect_updates.insert(alloc.id, update.clone());

            update.client_status = AllocClientStatus::Unknown;
            update.alloc_states.push(AllocStateEvent {
                client_status: AllocClientStatus::Unknown,
                time: self.now,
            });
            unknown.insert(update);
        }
        unknown
    }

    fn create_reschedule_later_evals(&mut self, later: &[DelayedReschedule], group: &str) {
        let due = later
            .iter()
            .map(|d| (d.alloc.id, d.reschedule_time))
            .collect();
        let followups = self.batch_followup_evals(
            due,
            EvalTrigger::RetryFailedAlloc,
            EVAL_DESC_RESCHEDULE_LATER,
            group,
        );
        for delayed in later {
            let mut update = delayed.alloc.stub_for_update();
            update.followup_eval_id = followups.get(&delayed.alloc.id).copied();
            self.result.attribute_updates.insert(update.id, update);
        }
    }

    /// Creates delayed evals for `due`, one per batching window, and
    /// returns which eval each allocation was assigned to.
    fn batch_followup_evals(
        &mut self,
        mut due: Vec<(AllocId, DateTime<Utc>)>,
        trigger: EvalTrigger,
        description: &str,
        group: &str,
    ) -> BTreeMap<AllocId, EvalId> {
        let mut assigned = BTreeMap::new();
        if due.is_empty() {
            return assigned;
        }
        due.sort_by_key(|(id, at)| (*at, *id));

        let window = to_chrono(BATCHED_FAILED_ALLOC_WINDOW);
        let mut evals: Vec<Evaluation> = Vec::new();
        for (id, at) in due {
            let new_batch = evals
                .last()
                .and_then(|e| e.wait_until)
                .is_none_or(|start| at - start >= window);
            if new_batch {
                evals.push(self.eval.create_delayed_eval(trigger, at, description, self.now));
            }
            if let Some(eval) = evals.last() {
                assigned.insert(id, eval.id);
            }
        }

        self.result
            .desired_followup_evals
            .entry(group.to_string())
            .or_default()
            .extend(evals);
        assigned
    }

    fn stop_not_needed(&mut self, stop: &mut AllocSet, alloc: Allocation) {
        self.result.stop.push(AllocStopResult {
            alloc: alloc.clone(),
            client_status: None,
            status_description: ALLOC_NOT_NEEDED,
            followup_eval_id: None,
        });
        stop.insert(alloc);
    }

    /// Stops lost allocations and whatever exceeds the group count.
    #[allow(clippy::too_many_arguments)]
    fn compute_stop(
        &mut self,
        tg: &TaskGroup,
        name_index: &mut AllocNameIndex,
        untainted: &AllocSet,
        migrate: &mut AllocSet,
        lost: &AllocSet,
        canaries: &AllocSet,
        is_canarying: bool,
    ) -> AllocSet {
        let mut stop = lost.clone();
        self.mark_stop(lost, Some(AllocClientStatus::Lost), ALLOC_LOST);

        let mut untainted = if is_canarying {
            untainted.difference(canaries)
        } else {
            untainted.clone()
        };

        // Disconnected allocations are never stopped for being surplus.
        let known = untainted.filter_out_client_status(AllocClientStatus::Unknown);
        let surplus = (known.len() + migrate.len()).saturating_sub(tg.count as usize);
        if surplus == 0 {
            return stop;
        }
        let mut remove = surplus;
        untainted = untainted.filter_by_terminal();

        // Once promoted, the allocations canaries shadow go first.
        if !is_canarying && !canaries.is_empty() {
            let canary_names = canaries.name_set();
            let shadowed: Vec<Allocation> = untainted
                .difference(canaries)
                .name_order()
                .into_iter()
                .filter(|a| canary_names.contains(&a.name))
                .cloned()
                .collect();
            for alloc in shadowed {
                untainted.remove(&alloc.id);
                self.stop_not_needed(&mut stop, alloc);
                remove -= 1;
                if remove == 0 {
                    return stop;
                }
            }
        }

        // Then allocations that would otherwise have to migrate.
        if !migrate.is_empty() {
            let mut migrating = AllocNameIndex::new(&self.job_id, &tg.name, tg.count, migrate);
            let names = migrating.highest(remove);
            let picked: Vec<Allocation> = migrate
                .name_order()
                .into_iter()
                .filter(|a| names.contains(&a.name))
                .cloned()
                .collect();
            for alloc in picked {
                migrate.remove(&alloc.id);
                if let Some(index) = alloc.index() {
                    name_index.unset_index(index);
                }
                self.stop_not_needed(&mut stop, alloc);
                remove -= 1;
                if remove == 0 {
                    return stop;
                }
            }
        }

        let names = name_index.highest(remove);
        let picked: Vec<Allocation> = untainted
            .name_order()
            .into_iter()
            .rev()
            .filter(|a| names.contains(&a.name))
            .cloned()
            .collect();
        for alloc in picked {
            untainted.remove(&alloc.id);
            self.stop_not_needed(&mut stop, alloc);
            remove -= 1;
            if remove == 0 {
                return stop;
            }
        }

        // Duplicate names can leave surplus behind.
        let rest: Vec<Allocation> = untainted.name_order().into_iter().rev().cloned().collect();
        for alloc in rest {
            self.stop_not_needed(&mut stop, alloc);
            remove -= 1;
            if remove == 0 {
                break;
            }
        }
        stop
    }

    fn compute_updates(
        &mut self,
        job: &Arc<Job>,
        tg: &TaskGroup,
        untainted: &AllocSet,
    ) -> (AllocSet, AllocSet, AllocSet) {
        let mut ignore = AllocSet::new();
        let mut inplace = AllocSet::new();
        let mut destructive = AllocSet::new();

        for alloc in untainted.values() {
            if alloc.client_status == AllocClientStatus::Unknown {
                ignore.insert(alloc.clone());
                continue;
            }
            match (self.update_fn)(alloc, job, tg) {
                UpdateType::Ignore => ignore.insert(alloc.clone()),
                UpdateType::Destructive => destructive.insert(alloc.clone()),
                UpdateType::InPlace(updated) => {
                    inplace.insert(alloc.clone());
                    self.result.inplace_update.push(*updated);
                }
            }
        }
        (ignore, inplace, destructive)
    }

    fn requires_canaries(
        tg: &TaskGroup,
        dstate: &DeploymentState,
        destructive: &AllocSet,
        canaries: &AllocSet,
    ) -> bool {
        tg.update_strategy()
            .is_some_and(|u| canaries.len() < u.canary as usize)
            && !destructive.is_empty()
            && !dstate.promoted
    }

    fn compute_canaries(
        &mut self,
        tg: &TaskGroup,
        dstate: &mut DeploymentState,
        destructive: &AllocSet,
        canaries: &AllocSet,
        du: &mut DesiredUpdates,
        name_index: &mut AllocNameIndex,
    ) {
        let Some(update) = tg.update_strategy() else {
            return;
        };
        dstate.desired_canaries = update.canary;
        if self.deployment_paused || self.deployment_failed {
            return;
        }

        let wanted = (update.canary as usize).saturating_sub(canaries.len());
        du.canary += count(wanted);
        for name in name_index.next_canaries(wanted, canaries, destructive) {
            self.result.place.push(AllocPlaceResult {
                name,
                task_group: tg.name.clone(),
                canary: true,
                ..Default::default()
            });
        }
    }

    /// How many more allocations may be replaced under the update strategy.
    fn compute_under_provisioned_by(
        &self,
        tg: &TaskGroup,
        untainted: &AllocSet,
        destructive: &AllocSet,
        migrate: &AllocSet,
        is_canarying: bool,
    ) -> usize {
        let Some(update) = tg.update_strategy() else {
            return tg.count as usize;
        };
        if destructive.is_empty() && migrate.is_empty() {
            return tg.count as usize;
        }
        let Some(deployment) = &self.deployment else {
            return update.max_parallel as usize;
        };
        if self.deployment_paused || self.deployment_failed || is_canarying {
            return 0;
        }

        let mut allowed = update.max_parallel as i64;
        let (part_of, _) = untainted.filter_by_deployment(deployment.id);
        for alloc in part_of.values() {
            // One unhealthy allocation halts the rollout.
            if alloc.is_unhealthy() {
                return 0;
            }
            if !alloc.is_healthy() {
                allowed -= 1;
            }
        }
        usize::try_from(allowed).unwrap_or(0)
    }

    fn compute_placements(
        tg: &TaskGroup,
        name_index: &mut AllocNameIndex,
        untainted: &AllocSet,
        migrate: &AllocSet,
        reschedule: &AllocSet,
        lost: &AllocSet,
        is_canarying: bool,
    ) -> Vec<AllocPlaceResult> {
        let mut place: Vec<AllocPlaceResult> = reschedule
            .name_order()
            .into_iter()
            .map(|alloc| AllocPlaceResult {
                name: alloc.name.clone(),
                task_group: tg.name.clone(),
                canary: alloc.is_canary(),
                previous_alloc: Some(alloc.clone()),
                reschedule: true,
                lost: false,
                downgrade_non_canary: is_canarying && !alloc.is_canary(),
                min_job_version: alloc.job_version(),
            })
            .collect();

        let wanted = tg.count as usize;
        let mut existing = untainted.len() + migrate.len() + reschedule.len();

        for alloc in lost.name_order() {
            if existing >= wanted {
                break;
            }
            existing += 1;
            place.push(AllocPlaceResult {
                name: alloc.name.clone(),
                task_group: tg.name.clone(),
                canary: alloc.is_canary(),
                previous_alloc: Some(alloc.clone()),
                reschedule: false,
                lost: true,
                downgrade_non_canary: is_canarying && !alloc.is_canary(),
                min_job_version: alloc.job_version(),
            });
        }

        if existing < wanted {
            for name in name_index.next(wanted - existing) {
                place.push(AllocPlaceResult {
                    name,
                    task_group: tg.name.clone(),
                    downgrade_non_canary: is_canarying,
                    ..Default::default()
                });
            }
        }
        place
    }

    /// Commits the placements the deployment allows. Lost and failed
    /// allocations are replaced even while the deployment holds back.
    fn compute_replacements(
        &mut self,
        place_ready: bool,
        du: &mut DesiredUpdates,
        place: Vec<AllocPlaceResult>,
        reschedule_now: &AllocSet,
        lost: &AllocSet,
        under_provisioned_by: usize,
    ) -> usize {
        let failed = reschedule_now.filter_out_client_status(AllocClientStatus::Unknown);

        if place_ready {
            du.place += count(place.len());
            let placed = place.len();
            self.result.place.extend(place);
            self.mark_stop(&failed, None, ALLOC_RESCHEDULED);
            du.stop += count(failed.len());
            return under_provisioned_by.saturating_sub(placed);
        }

        if !lost.is_empty() {
            for p in place.iter().filter(|p| p.lost) {
                self.result.place.push(p.clone());
                du.place += 1;
            }
        }

        if reschedule_now.is_empty() || place.is_empty() {
            return under_provisioned_by;
        }

        let deployment_id = self.deployment.as_ref().map(|d| d.id);
        for p in place.into_iter().filter(|p| p.reschedule) {
            let Some(prev) = p.previous_alloc.clone() else {
                continue;
            };
            let part_of_failed =
                self.deployment_failed
                    && deployment_id.is_some()
                    && prev.deployment_id == deployment_id;
            if part_of_failed {
                continue;
            }
            if failed.contains(&prev.id) {
                self.result.stop.push(AllocStopResult {
                    alloc: prev,
                    client_status: None,
                    status_description: ALLOC_RESCHEDULED,
                    followup_eval_id: None,
                });
                du.stop += 1;
            }
            self.result.place.push(p);
            du.place += 1;
        }
        under_provisioned_by
    }

    fn compute_destructive_updates(
        &mut self,
        destructive: &AllocSet,
        under_provisioned_by: usize,
        du: &mut DesiredUpdates,
        tg: &TaskGroup,
    ) {
        let n = destructive.len().min(under_provisioned_by);
        du.destructive_update += count(n);
        du.ignore += count(destructive.len() - n);
        for alloc in destructive.name_order().into_iter().take(n) {
            self.result.destructive_update.push(AllocDestructiveResult {
                place_name: alloc.name.clone(),
                place_task_group: tg.name.clone(),
                stop_alloc: alloc.clone(),
                stop_status_description: ALLOC_UPDATING,
            });
        }
    }

    fn compute_migrations(
        &mut self,
        du: &mut DesiredUpdates,
        migrate: &AllocSet,
        tg: &TaskGroup,
        is_canarying: bool,
    ) {
        du.migrate += count(migrate.len());
        for alloc in migrate.name_order() {
            self.result.stop.push(AllocStopResult {
                alloc: alloc.clone(),
                client_status: None,
                status_description: ALLOC_MIGRATING,
                followup_eval_id: None,
            });
            self.result.place.push(AllocPlaceResult {
                name: alloc.name.clone(),
                task_group: tg.name.clone(),
                canary: alloc.is_canary(),
                previous_alloc: Some(alloc.clone()),
                reschedule: false,
                lost: false,
                downgrade_non_canary: is_canarying && !alloc.is_canary(),
                min_job_version: alloc.job_version(),
            });
        }
    }

    /// Attaches the group's state to the deployment, creating the
    /// deployment on first run or when the spec changed.
    #[allow(clippy::too_many_arguments)]
    fn create_deployment(
        &mut self,
        job: &Job,
        tg: &TaskGroup,
        existing_deployment: bool,
        dstate: DeploymentState,
        all: &AllocSet,
        destructive: &AllocSet,
        has_inplace: bool,
    ) {
        if existing_deployment {
            if let Some(d) = self.deployment.as_mut() {
                d.task_groups.insert(tg.name.clone(), dstate);
            }
            return;
        }
        if tg.update_strategy().is_none() || dstate.desired_total == 0 {
            return;
        }

        let updating_spec = !destructive.is_empty() || has_inplace;
        let had_running = all.values().any(|a| {
            a.job
                .as_ref()
                .is_some_and(|j| j.version == job.version && j.create_index == job.create_index)
        });
        if had_running && !updating_spec {
            return;
        }

        let deployment = self.deployment.get_or_insert_with(|| Deployment::new(job));
        deployment.task_groups.insert(tg.name.clone(), dstate);
        self.deployment_dirty = true;
    }

    fn is_deployment_complete(&self, group: &str, pending: usize, requires_canaries: bool) -> bool {
        if pending > 0 || requires_canaries {
            return false;
        }
        let Some(deployment) = &self.deployment else {
            return false;
        };
        deployment.task_groups.get(group).is_none_or(|s| {
            s.healthy_allocs >= s.desired_total.max(s.desired_canaries)
                && !(s.desired_canaries > 0 && !s.promoted)
        })
    }

    fn compute_deployment_updates(&mut self, complete: bool) {
        if let Some(d) = &self.deployment {
            if complete && d.status == DeploymentStatus::Running {
                self.result.deployment_updates.push(DeploymentStatusUpdate {
                    deployment_id: d.id,
                    status: DeploymentStatus::Successful,
                    status_description: DEPLOYMENT_DESC_SUCCESSFUL.to_string(),
                });
            }
        }

        if !self.deployment_dirty {
            return;
        }
        if let Some(d) = self.deployment.as_mut() {
            if d.requires_promotion() {
                d.status_description = if d.has_auto_promote() {
                    DEPLOYMENT_DESC_RUNNING_AUTO_PROMOTION
                } else {
                    DEPLOYMENT_DESC_RUNNING_NEEDS_PROMOTION
                }
                .to_string();
            }
        }
        self.result.deployment = self.deployment.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_id::NodeId;
    use convoy_structs::{
        alloc_name, mock, AllocDeploymentStatus, DisconnectStrategy, DrainStrategy, Node,
        NodeStatus, UpdateStrategy,
    };
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn ignore_fn() -> impl Fn(&Allocation, &Arc<Job>, &TaskGroup) -> UpdateType {
        |_, _, _| UpdateType::Ignore
    }

    fn allocs(
        job: &Arc<Job>,
        node: &Node,
        indexes: impl IntoIterator<Item = u32>,
    ) -> Vec<Allocation> {
        indexes
            .into_iter()
            .map(|i| mock::alloc_for(job, node, i))
            .collect()
    }

    fn reconcile(
        update_fn: &UpdateFn<'_>,
        job: &Arc<Job>,
        deployment: Option<Deployment>,
        existing: Vec<Allocation>,
        tainted: &TaintedNodes,
        now: DateTime<Utc>,
    ) -> (ReconcileResults, Evaluation) {
        let eval = Evaluation::for_job(job, EvalTrigger::JobRegister, now);
        let results = AllocReconciler::new(
            update_fn,
            job.job_type.is_batch(),
            &job.id,
            Some(Arc::clone(job)),
            deployment,
            existing.into_iter().collect(),
            tainted,
            &eval,
            now,
        )
        .compute();
        (results, eval)
    }

    /// Same job, new version, different task config.
    fn destructive_version(job: &Job) -> Job {
        let mut new = job.clone();
        new.version += 1;
        new.job_modify_index += 1;
        new.task_groups[0].tasks[0].config = serde_json::json!({ "command": "/bin/true" });
        new
    }

    fn place_names(results: &ReconcileResults) -> Vec<String> {
        results.place.iter().map(|p| p.name.clone()).collect()
    }

    #[test]
    fn test_places_fresh_job() {
        let job = Arc::new(mock::job());
        let update = ignore_fn();
        let (r, _) = reconcile(&update, &job, None, Vec::new(), &TaintedNodes::new(), Utc::now());

        assert_eq!(r.place.len(), 10);
        let expected: Vec<String> = (0..10).map(|i| alloc_name(&job.id, "web", i)).collect();
        assert_eq!(place_names(&r), expected);
        assert!(r.stop.is_empty());
        assert!(r.deployment.is_none());
        assert_eq!(r.desired_tg_updates["web"].place, 10);
    }

    #[test]
    fn test_stopped_job_stops_everything_and_cancels_deployment() {
        let mut job = mock::job();
        job.stop = true;
        let job = Arc::new(job);
        let node = mock::node();
        let deployment = mock::deployment(&job);
        let update = ignore_fn();

        let (r, _) = reconcile(
            &update,
            &job,
            Some(deployment.clone()),
            allocs(&job, &node, 0..10),
            &TaintedNodes::new(),
            Utc::now(),
        );
        assert_eq!(r.stop.len(), 10);
        assert!(r.stop.iter().all(|s| s.status_description == ALLOC_JOB_STOPPED));
        assert!(r.place.is_empty());
        assert_eq!(
            r.deployment_updates,
            vec![DeploymentStatusUpdate {
                deployment_id: deployment.id,
                status: DeploymentStatus::Cancelled,
                status_description: DEPLOYMENT_DESC_STOPPED_JOB.to_string(),
            }]
        );
    }

    #[test]
    fn test_scale_down_stops_highest_names() {
        let mut job = mock::job();
        job.task_groups[0].count = 7;
        let job = Arc::new(job);
        let node = mock::node();
        let update = ignore_fn();

        let (r, _) = reconcile(
            &update,
            &job,
            None,
            allocs(&job, &node, 0..10),
            &TaintedNodes::new(),
            Utc::now(),
        );
        let stopped: BTreeSet<u32> = r.stop.iter().filter_map(|s| s.alloc.index()).collect();
        assert_eq!(stopped, BTreeSet::from([7, 8, 9]));
        assert!(r.place.is_empty());
    }

    #[test]
    fn test_scale_up_fills_gaps() {
        let mut job = mock::job();
        job.task_groups[0].count = 6;
        let job = Arc::new(job);
        let node = mock::node();
        let update = ignore_fn();

        let (r, _) = reconcile(
            &update,
            &job,
            None,
            allocs(&job, &node, [0, 1, 3, 4]),
            &TaintedNodes::new(),
            Utc::now(),
        );
        assert_eq!(
            place_names(&r),
            vec![alloc_name(&job.id, "web", 2), alloc_name(&job.id, "web", 5)]
        );
    }

    #[test]
    fn test_destructive_update_respects_max_parallel() {
        let mut old = mock::job();
        old.update = Some(UpdateStrategy {
            max_parallel: 4,
            ..Default::default()
        });
        old.canonicalize();
        let old = Arc::new(old);
        let new = Arc::new(destructive_version(&old));
        let node = mock::node();

        let (r, _) = reconcile(
            &update_by_spec,
            &new,
            None,
            allocs(&old, &node, 0..10),
            &TaintedNodes::new(),
            Utc::now(),
        );

        assert_eq!(r.destructive_update.len(), 4);
        assert!(r.place.is_empty());
        assert!(r.stop.is_empty());
        let du = &r.desired_tg_updates["web"];
        assert_eq!(du.destructive_update, 4);
        assert_eq!(du.ignore, 6);

        let deployment = r.deployment.expect("deployment created");
        assert_eq!(deployment.job_version, new.version);
        assert_eq!(deployment.task_groups["web"].desired_total, 10);
    }

    #[test]
    fn test_inplace_update_for_job_meta_change() {
        let old = Arc::new(mock::job());
        let mut new = (*old).clone();
        new.version += 1;
        new.job_modify_index += 1;
        new.meta.insert("owner".into(), "team-a".into());
        let new = Arc::new(new);
        let node = mock::node();

        let (r, _) = reconcile(
            &update_by_spec,
            &new,
            None,
            allocs(&old, &node, 0..10),
            &TaintedNodes::new(),
            Utc::now(),
        );
        assert_eq!(r.inplace_update.len(), 10);
        assert!(r.inplace_update.iter().all(|a| a.job_version() == new.version));
        assert!(r.destructive_update.is_empty());
    }

    #[test]
    fn test_canaries_gate_destructive_updates() {
        let mut old = mock::job();
        old.update = Some(UpdateStrategy {
            max_parallel: 4,
            canary: 2,
            ..Default::default()
        });
        old.canonicalize();
        let old = Arc::new(old);
        let new = Arc::new(destructive_version(&old));
        let node = mock::node();

        let (r, _) = reconcile(
            &update_by_spec,
            &new,
            None,
            allocs(&old, &node, 0..10),
            &TaintedNodes::new(),
            Utc::now(),
        );

        assert_eq!(r.place.len(), 2);
        assert!(r.place.iter().all(|p| p.canary));
        assert!(r.destructive_update.is_empty());
        assert!(r.stop.is_empty());

        let deployment = r.deployment.expect("deployment created");
        let state = &deployment.task_groups["web"];
        assert_eq!(state.desired_canaries, 2);
        assert!(!state.promoted);
        assert_eq!(deployment.status_description, DEPLOYMENT_DESC_RUNNING_NEEDS_PROMOTION);
    }

    fn canary_setup(healthy: bool) -> (Arc<Job>, Deployment, Vec<Allocation>) {
        let mut old = mock::job();
        old.update = Some(UpdateStrategy {
            max_parallel: 2,
            canary: 2,
            auto_promote: true,
            ..Default::default()
        });
        old.canonicalize();
        let old = Arc::new(old);
        let new = Arc::new(destructive_version(&old));
        let node = mock::node();

        let mut deployment = mock::deployment(&new);
        let mut existing = allocs(&old, &node, 0..10);
        let mut canary_ids = Vec::new();
        for i in 0..2 {
            let mut canary = mock::alloc_for(&new, &node, i);
            canary.deployment_id = Some(deployment.id);
            canary.deployment_status = Some(AllocDeploymentStatus {
                healthy: Some(healthy),
                canary: true,
                ..Default::default()
            });
            canary_ids.push(canary.id);
            existing.push(canary);
        }
        let state = deployment.task_groups.get_mut("web").unwrap();
        state.placed_canaries = canary_ids;
        state.healthy_allocs = if healthy { 2 } else { 0 };
        (new, deployment, existing)
    }

    #[test]
    fn test_unhealthy_canaries_hold_rollout() {
        let (job, deployment, existing) = canary_setup(false);
        let (r, _) = reconcile(
            &update_by_spec,
            &job,
            Some(deployment),
            existing,
            &TaintedNodes::new(),
            Utc::now(),
        );

        assert!(r.deployment.is_none());
        assert!(r.place.is_empty());
        assert!(r.stop.is_empty());
        assert!(r.destructive_update.is_empty());
    }

    #[test]
    fn test_auto_promote_proceeds_with_rollout() {
        let (job, deployment, existing) = canary_setup(true);
        let (r, _) = reconcile(
            &update_by_spec,
            &job,
            Some(deployment),
            existing,
            &TaintedNodes::new(),
            Utc::now(),
        );

        let promoted = r.deployment.expect("promoted deployment");
        assert!(promoted.task_groups["web"].promoted);

        // The old allocations the canaries shadow go first.
        let stopped: BTreeSet<u32> = r.stop.iter().filter_map(|s| s.alloc.index()).collect();
        assert_eq!(stopped, BTreeSet::from([0, 1]));
        assert!(r.stop.iter().all(|s| !s.alloc.is_canary()));
        assert_eq!(r.destructive_update.len(), 2);
        assert!(r.place.is_empty());
    }

    #[test]
    fn test_successful_deployment() {
        let mut job = mock::job();
        job.update = Some(UpdateStrategy::default());
        job.canonicalize();
        let job = Arc::new(job);
        let node = mock::node();
        let mut deployment = mock::deployment(&job);
        deployment.task_groups.get_mut("web").unwrap().healthy_allocs = 10;
        let existing: Vec<Allocation> = allocs(&job, &node, 0..10)
            .into_iter()
            .map(|mut a| {
                a.deployment_id = Some(deployment.id);
                a.deployment_status = Some(AllocDeploymentStatus {
                    healthy: Some(true),
                    ..Default::default()
                });
                a
            })
            .collect();

        let (r, _) = reconcile(
            &update_by_spec,
            &job,
            Some(deployment.clone()),
            existing,
            &TaintedNodes::new(),
            Utc::now(),
        );
        assert_eq!(r.deployment_updates.len(), 1);
        assert_eq!(r.deployment_updates[0].deployment_id, deployment.id);
        assert_eq!(r.deployment_updates[0].status, DeploymentStatus::Successful);
    }

    #[test]
    fn test_newer_job_cancels_deployment() {
        let old = Arc::new(mock::job());
        let new = Arc::new(destructive_version(&old));
        let deployment = mock::deployment(&old);
        let node = mock::node();
        let update = ignore_fn();

        let (r, _) = reconcile(
            &update,
            &new,
            Some(deployment.clone()),
            allocs(&old, &node, 0..10),
            &TaintedNodes::new(),
            Utc::now(),
        );
        assert_eq!(r.deployment_updates[0].deployment_id, deployment.id);
        assert_eq!(r.deployment_updates[0].status, DeploymentStatus::Cancelled);
        assert_eq!(r.deployment_updates[0].status_description, DEPLOYMENT_DESC_NEWER_JOB);
    }

    fn failed_at(mut alloc: Allocation, at: DateTime<Utc>) -> Allocation {
        alloc.client_status = AllocClientStatus::Failed;
        alloc.alloc_states.push(AllocStateEvent {
            client_status: AllocClientStatus::Failed,
            time: at,
        });
        alloc
    }

    #[test]
    fn test_reschedule_now_and_later() {
        let now = Utc::now();
        let job = Arc::new(mock::job());
        let node = mock::node();
        let mut existing = allocs(&job, &node, 0..8);
        existing.push(failed_at(
            mock::alloc_for(&job, &node, 8),
            now - chrono::Duration::seconds(10),
        ));
        let later_a = failed_at(mock::alloc_for(&job, &node, 9), now);
        let later_b = failed_at(
            mock::alloc_for(&job, &node, 10),
            now - chrono::Duration::seconds(2),
        );
        existing.push(later_a.clone());
        existing.push(later_b.clone());

        let mut job10 = (*job).clone();
        job10.task_groups[0].count = 11;
        let job = Arc::new(job10);
        let update = ignore_fn();

        let (r, eval) = reconcile(&update, &job, None, existing, &TaintedNodes::new(), now);

        // The alloc that failed 10s ago is past its 5s delay.
        assert_eq!(r.place.len(), 1);
        let p = &r.place[0];
        assert!(p.reschedule);
        assert_eq!(p.name, alloc_name(&job.id, "web", 8));
        assert!(p.previous_alloc.is_some());
        assert_eq!(r.stop.len(), 1);
        assert_eq!(r.stop[0].status_description, ALLOC_RESCHEDULED);

        // Both later reschedules fall inside one batching window.
        let evals: Vec<&Evaluation> = r.followup_evals().collect();
        assert_eq!(evals.len(), 1);
        assert_eq!(evals[0].triggered_by, EvalTrigger::RetryFailedAlloc);
        assert_eq!(evals[0].previous_eval, Some(eval.id));
        assert_eq!(evals[0].wait_until, Some(now + chrono::Duration::seconds(3)));
        assert_eq!(r.attribute_updates.len(), 2);
        assert_eq!(r.attribute_updates[&later_a.id].followup_eval_id, Some(evals[0].id));
        assert_eq!(r.attribute_updates[&later_b.id].followup_eval_id, Some(evals[0].id));
        assert_eq!(r.desired_tg_updates["web"].reschedule_later, 2);
    }

    #[test]
    fn test_followup_batches_split_by_window() {
        let now = Utc::now();
        let job = Arc::new(mock::job());
        let node = mock::node();
        let mut existing = allocs(&job, &node, 0..8);
        existing.push(failed_at(mock::alloc_for(&job, &node, 8), now));
        existing.push(failed_at(
            mock::alloc_for(&job, &node, 9),
            now + chrono::Duration::seconds(10),
        ));
        let update = ignore_fn();

        let (r, _) = reconcile(&update, &job, None, existing, &TaintedNodes::new(), now);
        let waits: Vec<_> = r.followup_evals().filter_map(|e| e.wait_until).collect();
        assert_eq!(
            waits,
            vec![now + chrono::Duration::seconds(5), now + chrono::Duration::seconds(15)]
        );
    }

    #[test]
    fn test_lost_allocs_are_replaced() {
        let job = Arc::new(mock::job());
        let healthy = mock::node();
        let mut down = mock::node();
        down.status = NodeStatus::Down;
        let mut existing = allocs(&job, &healthy, 0..8);
        existing.extend(allocs(&job, &down, 8..10));
        let tainted: TaintedNodes = BTreeMap::from([(down.id, Some(Arc::new(down.clone())))]);
        let update = ignore_fn();

        let (r, _) = reconcile(&update, &job, None, existing, &tainted, Utc::now());
        assert_eq!(r.stop.len(), 2);
        assert!(r
            .stop
            .iter()
            .all(|s| {
                s.client_status == Some(AllocClientStatus::Lost) && s.alloc.node_id == down.id
            }));
        assert_eq!(r.place.len(), 2);
        assert!(r.place.iter().all(|p| p.lost && p.previous_alloc.is_some()));
    }

    #[test]
    fn test_gc_node_allocs_are_lost() {
        let job = Arc::new(mock::job());
        let node = mock::node();
        let tainted: TaintedNodes = BTreeMap::from([(node.id, None)]);
        let update = ignore_fn();
        let (r, _) = reconcile(
            &update,
            &job,
            None,
            allocs(&job, &node, 0..10),
            &tainted,
            Utc::now(),
        );
        assert_eq!(r.stop.len(), 10);
        assert_eq!(r.place.len(), 10);
    }

    #[test]
    fn test_draining_node_migrates() {
        let job = Arc::new(mock::job());
        let healthy = mock::node();
        let mut draining = mock::node();
        draining.drain = Some(DrainStrategy {
            deadline: None,
            ignore_system_jobs: false,
        });
        let mut existing = allocs(&job, &healthy, 0..8);
        existing.extend(allocs(&job, &draining, 8..10));
        let tainted: TaintedNodes = BTreeMap::from([(draining.id, Some(Arc::new(draining)))]);
        let update = ignore_fn();

        let (r, _) = reconcile(&update, &job, None, existing, &tainted, Utc::now());
        assert_eq!(r.desired_tg_updates["web"].migrate, 2);
        assert!(r.stop.iter().all(|s| s.status_description == ALLOC_MIGRATING));
        let names: BTreeSet<String> = place_names(&r).into_iter().collect();
        assert_eq!(
            names,
            BTreeSet::from([alloc_name(&job.id, "web", 8), alloc_name(&job.id, "web", 9)])
        );
    }

    fn disconnect_job() -> Arc<Job> {
        let mut job = mock::job();
        job.task_groups[0].disconnect = Some(DisconnectStrategy {
            lost_after: Duration::from_secs(300),
        });
        Arc::new(job)
    }

    #[test]
    fn test_disconnect_marks_unknown_without_replacing() {
        let now = Utc::now();
        let job = disconnect_job();
        let healthy = mock::node();
        let mut gone = mock::node();
        gone.status = NodeStatus::Disconnected;
        let mut existing = allocs(&job, &healthy, 0..8);
        existing.extend(allocs(&job, &gone, 8..10));
        let tainted: TaintedNodes = BTreeMap::from([(gone.id, Some(Arc::new(gone)))]);
        let update = ignore_fn();

        let (r, _) = reconcile(&update, &job, None, existing, &tainted, now);
        assert!(r.place.is_empty());
        assert!(r.stop.is_empty());
        assert_eq!(r.disconnect_updates.len(), 2);

        let evals: Vec<&Evaluation> = r.followup_evals().collect();
        assert_eq!(evals.len(), 1);
        assert_eq!(evals[0].triggered_by, EvalTrigger::MaxDisconnectTimeout);
        assert_eq!(evals[0].wait_until, Some(now + chrono::Duration::seconds(300)));
        assert!(r
            .disconnect_updates
            .values()
            .all(|a| a.followup_eval_id == Some(evals[0].id)));
    }

    #[test]
    fn test_reconnect_keeps_original() {
        let now = Utc::now();
        let job = disconnect_job();
        let node = mock::node();
        let mut existing = allocs(&job, &node, 0..10);
        existing[0].alloc_states.push(AllocStateEvent {
            client_status: AllocClientStatus::Unknown,
            time: now - chrono::Duration::seconds(60),
        });
        let reconnected = existing[0].id;
        let tainted: TaintedNodes = BTreeMap::from([(node.id, Some(Arc::new(node)))]);
        let update = ignore_fn();

        let (r, _) = reconcile(&update, &job, None, existing, &tainted, now);
        assert!(r.place.is_empty());
        assert!(r.stop.is_empty());
        let update = &r.reconnect_updates[&reconnected];
        assert_eq!(
            update.alloc_states.last().map(|s| s.client_status),
            Some(AllocClientStatus::Running)
        );
        assert!(!update.needs_to_reconnect());
    }

    #[test]
    fn test_batch_terminal_allocs_are_not_replaced() {
        let job = Arc::new(mock::batch_job());
        let node = mock::node();
        let mut existing = allocs(&job, &node, 0..10);
        for alloc in existing.iter_mut().take(4) {
            alloc.client_status = AllocClientStatus::Complete;
        }
        let update = ignore_fn();

        let (r, _) = reconcile(&update, &job, None, existing, &TaintedNodes::new(), Utc::now());
        assert!(r.place.is_empty());
        assert!(r.stop.is_empty());
    }

    #[test]
    fn test_missing_group_is_stopped() {
        let job = Arc::new(mock::job());
        let node = mock::node();
        let mut stray = mock::alloc_for(&job, &node, 0);
        stray.task_group = "gone".to_string();
        stray.name = alloc_name(&job.id, "gone", 0);
        let mut existing = allocs(&job, &node, 0..10);
        existing.push(stray.clone());
        let update = ignore_fn();

        let (r, _) = reconcile(&update, &job, None, existing, &TaintedNodes::new(), Utc::now());
        assert_eq!(r.stop.len(), 1);
        assert_eq!(r.stop[0].alloc.id, stray.id);
        assert_eq!(r.desired_tg_updates["gone"].stop, 1);
    }

    #[test]
    fn test_purged_job_stops_everything() {
        let job = Arc::new(mock::job());
        let node = mock::node();
        let eval = mock::eval();
        let update = ignore_fn();
        let tainted = TaintedNodes::new();
        let r = AllocReconciler::new(
            &update,
            false,
            &job.id,
            None,
            None,
            allocs(&job, &node, 0..3).into_iter().collect(),
            &tainted,
            &eval,
            Utc::now(),
        )
        .compute();
        assert_eq!(r.stop.len(), 3);
    }

    proptest! {
        #[test]
        fn prop_names_stay_unique(
            indexes in proptest::collection::btree_set(0u32..30, 0..25),
            count in 0u32..30,
        ) {
            let mut job = mock::job();
            job.task_groups[0].count = count;
            let job = Arc::new(job);
            let node = mock::node();
            let update = ignore_fn();
            let existing = allocs(&job, &node, indexes.iter().copied());

            let (r, _) = reconcile(
                &update,
                &job,
                None,
                existing.clone(),
                &TaintedNodes::new(),
                Utc::now(),
            );

            let stopped: BTreeSet<AllocId> = r.stop.iter().map(|s| s.alloc.id).collect();
            let mut names: Vec<String> = existing
                .iter()
                .filter(|a| !stopped.contains(&a.id))
                .map(|a| a.name.clone())
                .collect();
            names.extend(place_names(&r));

            let unique: BTreeSet<&String> = names.iter().collect();
            prop_assert_eq!(unique.len(), names.len());
            prop_assert_eq!(names.len(), count as usize);
        }
    }

    #[test]
    fn test_unused_node_id_is_untainted() {
        let job = Arc::new(mock::job());
        let node = mock::node();
        let tainted: TaintedNodes = BTreeMap::from([(NodeId::new(), None)]);
        let update = ignore_fn();
        let (r, _) = reconcile(
            &update,
            &job,
            None,
            allocs(&job, &node, 0..10),
            &tainted,
            Utc::now(),
        );
        assert!(r.stop.is_empty());
        assert!(r.place.is_empty());
    }
}
