//! The commit side of scheduling.
//!
//! [`Server`] owns the store, the broker and the blocked tracker, turns
//! cluster changes into evaluations, and is the [`Planner`] the drivers
//! submit to.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Duration as ChronoDuration;
use convoy_id::{AllocId, NodeId};
use convoy_structs::{
    AllocClientStatus, Allocation, EvalStatus, EvalTrigger, Evaluation, Job, JobType, Node,
    NodeStatus, Plan, PlanResult, EVAL_DESC_SUPERSEDED,
};
use tracing::{debug, info, instrument, warn};

use crate::blocked::{BlockOutcome, BlockedEvals, BlockedStats};
use crate::broker::EvalBroker;
use crate::error::{Result, SchedulerError};
use crate::scheduler::{Clock, Planner};
use crate::state::{MemStore, State};

/// Delay before a failed evaluation is tried again.
pub const FAILED_FOLLOWUP_DELAY_SECS: i64 = 60;

pub const EVAL_DESC_FAILED_FOLLOWUP: &str = "created for failed evaluation follow-up";
pub const EVAL_DESC_DELIVERY_LIMIT: &str = "evaluation reached delivery limit";

pub struct Server {
    store: MemStore,
    broker: EvalBroker,
    blocked: Mutex<BlockedEvals>,
    clock: Arc<dyn Clock>,
}

impl Server {
    pub fn new(store: MemStore, delivery_limit: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            broker: EvalBroker::new(delivery_limit),
            blocked: Mutex::new(BlockedEvals::new()),
            clock,
        }
    }

    pub fn store(&self) -> &MemStore {
        &self.store
    }

    pub fn broker(&self) -> &EvalBroker {
        &self.broker
    }

    pub fn clock(&self) -> &dyn Clock {
        &*self.clock
    }

    fn blocked(&self) -> MutexGuard<'_, BlockedEvals> {
        self.blocked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn blocked_stats(&self) -> BlockedStats {
        self.blocked().stats()
    }

    pub fn blocked_len(&self) -> usize {
        self.blocked().len()
    }

    /// Registers or updates a job and queues an evaluation for it. Any
    /// blocked evaluation for the job is superseded.
    #[instrument(skip(self, job), fields(job_id = %job.id, namespace = %job.namespace))]
    pub fn register_job(&self, job: Job) -> Result<Evaluation> {
        let job = self.store.upsert_job(job)?;
        self.supersede_blocked(&job.namespace, &job.id)?;
        let eval = Evaluation::for_job(&job, EvalTrigger::JobRegister, self.clock.now());
        self.create_eval(&eval)?;
        info!(eval_id = %eval.id, version = job.version, "Job registered");
        Ok(eval)
    }

    /// Marks a job stopped and queues the evaluation that tears it down.
    #[instrument(skip(self))]
    pub fn deregister_job(&self, namespace: &str, job_id: &str) -> Result<Evaluation> {
        let snapshot = self.store.snapshot();
        let job = snapshot
            .job_by_id(namespace, job_id)
            .ok_or_else(|| SchedulerError::JobNotFound {
                namespace: namespace.to_string(),
                job_id: job_id.to_string(),
            })?;
        let mut stopped = (*job).clone();
        stopped.stop = true;
        let job = self.store.upsert_job(stopped)?;
        self.supersede_blocked(namespace, job_id)?;

        let eval = Evaluation::for_job(&job, EvalTrigger::JobDeregister, self.clock.now());
        self.create_eval(&eval)?;
        info!(eval_id = %eval.id, "Job deregistered");
        Ok(eval)
    }

    /// Registers or replaces a node and evaluates the jobs it affects.
    #[instrument(skip(self, node), fields(node_id = %node.id))]
    pub fn upsert_node(&self, node: Node) -> Result<Vec<Evaluation>> {
        let id = node.id;
        self.store.upsert_node(node);
        self.node_changed(&id)
    }

    #[instrument(skip(self))]
    pub fn update_node_status(&self, id: &NodeId, status: NodeStatus) -> Result<Vec<Evaluation>> {
        self.store.update_node_status(id, status, self.clock.now())?;
        self.node_changed(id)
    }

    fn node_changed(&self, id: &NodeId) -> Result<Vec<Evaluation>> {
        let snapshot = self.store.snapshot();
        let Some(node) = snapshot.node_by_id(id) else {
            return Ok(Vec::new());
        };
        if node.ready() {
            self.unblock(&node.computed_class, snapshot.index())?;
        }

        let now = self.clock.now();
        let mut seen = BTreeSet::new();
        let mut evals = Vec::new();
        let affected = snapshot
            .allocs_by_node(id, false)
            .into_iter()
            .filter_map(|a| snapshot.job_by_id(&a.namespace, &a.job_id))
            .chain(snapshot.jobs().into_iter().filter(|j| {
                matches!(j.job_type, JobType::System | JobType::Sysbatch)
                    && !j.stopped()
                    && j.targets_datacenter(&node.datacenter)
                    && j.targets_pool(&node.node_pool)
            }));
        for job in affected {
            if !seen.insert((job.namespace.clone(), job.id.clone())) {
                continue;
            }
            let mut eval = Evaluation::for_job(&job, EvalTrigger::NodeUpdate, now);
            eval.node_id = Some(node.id);
            eval.node_modify_index = node.modify_index;
            self.create_eval(&eval)?;
            evals.push(eval);
        }
        debug!(node_id = %id, evals = evals.len(), "Node update evaluated");
        Ok(evals)
    }

    /// Records a client-reported allocation status. Terminal allocations
    /// free capacity on their node's class; failed ones get an evaluation
    /// so the job's reschedule policy can act.
    #[instrument(skip(self))]
    pub fn update_alloc_client_status(
        &self,
        id: &AllocId,
        status: AllocClientStatus,
    ) -> Result<Option<Evaluation>> {
        let alloc = self
            .store
            .update_alloc_client_status(id, status, self.clock.now())?;
        if !status.is_terminal() {
            return Ok(None);
        }

        let snapshot = self.store.snapshot();
        if let Some(node) = snapshot.node_by_id(&alloc.node_id) {
            self.unblock(&node.computed_class, snapshot.index())?;
        }
        if status != AllocClientStatus::Failed {
            return Ok(None);
        }
        self.alloc_failure_eval(&*snapshot, &alloc)
    }

    fn alloc_failure_eval(
        &self,
        state: &dyn State,
        alloc: &Allocation,
    ) -> Result<Option<Evaluation>> {
        let Some(job) = state.job_by_id(&alloc.namespace, &alloc.job_id) else {
            return Ok(None);
        };
        let eval = Evaluation::for_job(&job, EvalTrigger::AllocFailure, self.clock.now());
        self.create_eval(&eval)?;
        Ok(Some(eval))
    }

    /// Settles what the broker set aside: superseded evaluations are
    /// cancelled, and evaluations that hit the delivery limit are failed
    /// with a delayed follow-up.
    pub fn reap_broker(&self) -> Result<()> {
        let now = self.clock.now();

        let superseded = self.broker.take_cancelable();
        if !superseded.is_empty() {
            self.cancel_evals(superseded)?;
        }

        for mut eval in self.broker.take_failed() {
            let followup = eval.create_delayed_eval(
                EvalTrigger::FailedFollowUp,
                now + ChronoDuration::seconds(FAILED_FOLLOWUP_DELAY_SECS),
                EVAL_DESC_FAILED_FOLLOWUP,
                now,
            );
            eval.status = EvalStatus::Failed;
            eval.status_description = EVAL_DESC_DELIVERY_LIMIT.to_string();
            eval.next_eval = Some(followup.id);
            eval.modify_time = now;
            warn!(eval_id = %eval.id, followup_eval_id = %followup.id, "Evaluation failed");
            self.store.upsert_evals(&[eval]);
            self.create_eval(&followup)?;
        }
        Ok(())
    }

    fn cancel_evals(&self, evals: Vec<Evaluation>) -> Result<()> {
        let now = self.clock.now();
        let cancelled: Vec<Evaluation> = evals
            .into_iter()
            .map(|mut eval| {
                eval.status = EvalStatus::Cancelled;
                eval.status_description = EVAL_DESC_SUPERSEDED.to_string();
                eval.modify_time = now;
                eval
            })
            .collect();
        debug!(count = cancelled.len(), "Cancelling superseded evaluations");
        self.store.upsert_evals(&cancelled);
        Ok(())
    }

    fn supersede_blocked(&self, namespace: &str, job_id: &str) -> Result<()> {
        let untracked = self.blocked().untrack(namespace, job_id);
        match untracked {
            Some(eval) => self.cancel_evals(vec![eval]),
            None => Ok(()),
        }
    }

    /// Capacity changed on `class`: blocked evaluations that could use it
    /// are replaced by pending successors in the broker.
    fn unblock(&self, class: &str, index: u64) -> Result<()> {
        let woken = self.blocked().unblock(class, index);
        for eval in woken {
            self.requeue_unblocked(eval)?;
        }
        Ok(())
    }

    /// Supersedes `blocked` with a fresh pending evaluation and queues it.
    fn requeue_unblocked(&self, mut blocked: Evaluation) -> Result<()> {
        let now = self.clock.now();
        let fresh = blocked.create_unblocked_eval(now);
        blocked.status = EvalStatus::Cancelled;
        blocked.status_description = EVAL_DESC_SUPERSEDED.to_string();
        blocked.next_eval = Some(fresh.id);
        blocked.modify_time = now;
        debug!(blocked_eval_id = %blocked.id, eval_id = %fresh.id, "Unblocked evaluation");
        self.store.upsert_evals(&[blocked, fresh.clone()]);
        self.broker.enqueue(fresh)?;
        Ok(())
    }

    fn track_blocked(&self, eval: Evaluation) -> Result<()> {
        let outcome = self.blocked().block(eval.clone());
        match outcome {
            BlockOutcome::Tracked { replaced } => {
                if let Some(old) = replaced {
                    self.cancel_evals(vec![old])?;
                }
            }
            BlockOutcome::Unblocked { replaced } => {
                if let Some(old) = replaced {
                    self.cancel_evals(vec![old])?;
                }
                self.requeue_unblocked(eval)?;
            }
            BlockOutcome::Duplicate => self.cancel_evals(vec![eval])?,
        }
        Ok(())
    }
}

impl Planner for Server {
    fn submit_plan(&self, plan: &Plan) -> Result<(PlanResult, Option<Arc<dyn State>>)> {
        let applied = self.store.apply_plan(plan, self.clock.now());
        for eval in &applied.preemption_evals {
            self.broker.enqueue(eval.clone())?;
        }

        let result = applied.result;
        if result.refresh_index != 0 {
            warn!(
                eval_id = %plan.eval_id,
                refresh_index = result.refresh_index,
                "Plan partially rejected"
            );
            let fresh: Arc<dyn State> = self.store.snapshot();
            return Ok((result, Some(fresh)));
        }
        info!(
            eval_id = %plan.eval_id,
            alloc_index = result.alloc_index,
            placed = result.node_allocation.values().map(Vec::len).sum::<usize>(),
            stopped = result.node_update.values().map(Vec::len).sum::<usize>(),
            preempted = result.node_preemptions.values().map(Vec::len).sum::<usize>(),
            "Plan applied"
        );
        Ok((result, None))
    }

    fn update_eval(&self, eval: &Evaluation) -> Result<()> {
        self.store.upsert_evals(std::slice::from_ref(eval));
        Ok(())
    }

    fn create_eval(&self, eval: &Evaluation) -> Result<()> {
        self.store.upsert_evals(std::slice::from_ref(eval));
        if eval.should_block() {
            self.track_blocked(eval.clone())
        } else if eval.should_enqueue() {
            Ok(self.broker.enqueue(eval.clone())?)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SystemClock;
    use convoy_structs::mock;

    fn server() -> Server {
        Server::new(MemStore::new(), 3, Arc::new(SystemClock))
    }

    #[test]
    fn test_register_job_enqueues_eval() {
        let server = server();
        let eval = server.register_job(mock::job()).unwrap();
        let delivery = server.broker().try_dequeue().unwrap().unwrap();
        assert_eq!(delivery.eval.id, eval.id);
        assert!(server.store().snapshot().eval_by_id(&eval.id).is_some());
    }

    #[test]
    fn test_ready_node_creates_system_job_eval() {
        let server = server();
        let job = mock::system_job();
        let job_id = job.id.clone();
        server.register_job(job).unwrap();
        server.register_job(mock::job()).unwrap();
        let evals = server.upsert_node(mock::node()).unwrap();
        assert_eq!(evals.len(), 1);
        assert_eq!(evals[0].job_id, job_id);
        assert_eq!(evals[0].triggered_by, EvalTrigger::NodeUpdate);
    }

    #[test]
    fn test_node_ready_unblocks_eval() {
        let server = server();
        let job = server.store().upsert_job(mock::job()).unwrap();
        let mut blocked = Evaluation::for_job(&job, EvalTrigger::QueuedAllocs, chrono::Utc::now());
        blocked.status = EvalStatus::Blocked;
        blocked.snapshot_index = server.store().index();
        server.create_eval(&blocked).unwrap();
        assert_eq!(server.blocked_len(), 1);

        server.upsert_node(mock::node()).unwrap();
        assert_eq!(server.blocked_len(), 0);
        let delivery = server.broker().try_dequeue().unwrap().unwrap();
        assert_ne!(delivery.eval.id, blocked.id);
        assert_eq!(delivery.eval.status, EvalStatus::Pending);
        assert_eq!(delivery.eval.previous_eval, Some(blocked.id));
        assert_eq!(delivery.eval.priority, blocked.priority);
        assert_eq!(delivery.eval.triggered_by, blocked.triggered_by);

        let snap = server.store().snapshot();
        let original = snap.eval_by_id(&blocked.id).unwrap();
        assert!(original.terminal_status());
        assert_eq!(original.status_description, EVAL_DESC_SUPERSEDED);
        assert_eq!(original.next_eval, Some(delivery.eval.id));
        assert!(snap.eval_by_id(&delivery.eval.id).is_some());
    }

    #[test]
    fn test_missed_unblock_queues_successor() {
        let server = server();
        let job = server.store().upsert_job(mock::job()).unwrap();
        let mut blocked = Evaluation::for_job(&job, EvalTrigger::QueuedAllocs, chrono::Utc::now());
        blocked.status = EvalStatus::Blocked;
        blocked.escaped_computed_class = true;
        // Processed against a snapshot older than the node that follows.
        blocked.snapshot_index = server.store().index();
        server.upsert_node(mock::node()).unwrap();

        server.create_eval(&blocked).unwrap();
        assert_eq!(server.blocked_len(), 0);
        let delivery = server.broker().try_dequeue().unwrap().unwrap();
        assert_ne!(delivery.eval.id, blocked.id);
        assert_eq!(delivery.eval.previous_eval, Some(blocked.id));
        let original = server.store().snapshot().eval_by_id(&blocked.id).unwrap();
        assert_eq!(original.status, EvalStatus::Cancelled);
    }

    #[test]
    fn test_register_supersedes_blocked_eval() {
        let server = server();
        let job = server.store().upsert_job(mock::job()).unwrap();
        let mut blocked = Evaluation::for_job(&job, EvalTrigger::QueuedAllocs, chrono::Utc::now());
        blocked.status = EvalStatus::Blocked;
        blocked.snapshot_index = server.store().index();
        server.create_eval(&blocked).unwrap();

        server.register_job((*job).clone()).unwrap();
        assert_eq!(server.blocked_len(), 0);
        let stored = server.store().snapshot().eval_by_id(&blocked.id).unwrap();
        assert_eq!(stored.status, EvalStatus::Cancelled);
    }

    #[test]
    fn test_reap_fails_eval_with_followup() {
        let server = Server::new(MemStore::new(), 1, Arc::new(SystemClock));
        let eval = server.register_job(mock::job()).unwrap();
        let delivery = server.broker().try_dequeue().unwrap().unwrap();
        server.broker().nack(&eval.id, &delivery.token).unwrap();

        server.reap_broker().unwrap();
        let stored = server.store().snapshot().eval_by_id(&eval.id).unwrap();
        assert_eq!(stored.status, EvalStatus::Failed);
        let followup_id = stored.next_eval.unwrap();
        let followup = server.store().snapshot().eval_by_id(&followup_id).unwrap();
        assert_eq!(followup.triggered_by, EvalTrigger::FailedFollowUp);
        assert!(followup.wait_until.is_some());
        assert_eq!(server.broker().stats().total_waiting, 1);
    }
}
