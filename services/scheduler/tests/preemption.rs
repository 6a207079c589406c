mod common;

use common::{harness_with, register};
use convoy_scheduler::testing::Harness;
use convoy_scheduler::{Clock, State};
use convoy_structs::{
    mock, AllocDesiredStatus, EvalStatus, EvalTrigger, Evaluation, Job, Node, ALLOC_PREEMPTED,
};

/// One node filled with eight 500-CPU service allocations.
fn full_node() -> (Harness, Node, std::sync::Arc<Job>) {
    let node = mock::node();
    let h = harness_with(std::slice::from_ref(&node));
    let mut job = mock::job();
    job.task_groups[0].count = 8;
    let job = h.store.upsert_job(job).unwrap();
    let allocs = (0..8).map(|i| mock::alloc_for(&job, &node, i)).collect();
    h.store.upsert_allocs(allocs);
    (h, node, job)
}

#[test]
fn system_job_preempts_lower_priority_alloc() {
    let (h, node, low) = full_node();
    let (_, eval) = register(&h, mock::system_job());

    h.process(&eval).unwrap();

    let plan = h.last_plan().unwrap();
    let preempted: Vec<_> = plan.preemptions().collect();
    assert_eq!(preempted.len(), 1);
    assert_eq!(preempted[0].job_id, low.id);
    assert_eq!(preempted[0].desired_status, AllocDesiredStatus::Evict);
    assert_eq!(preempted[0].desired_description, ALLOC_PREEMPTED);

    let placed: Vec<_> = plan.placements().collect();
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].node_id, node.id);
    assert_eq!(placed[0].preempted_allocations, vec![preempted[0].id]);
    assert_eq!(preempted[0].preempted_by_allocation, Some(placed[0].id));

    let followups: Vec<_> = h
        .created_evals()
        .into_iter()
        .filter(|e| e.triggered_by == EvalTrigger::Preemption)
        .collect();
    assert_eq!(followups.len(), 1);
    assert_eq!(followups[0].job_id, low.id);

    let live = h.store.snapshot().allocs_by_job(&low.namespace, &low.id, false);
    assert_eq!(live.len(), 7);
    assert_eq!(h.last_update().unwrap().status, EvalStatus::Complete);
}

#[test]
fn equal_priority_never_preempts() {
    let (h, _, low) = full_node();
    let mut job = mock::system_job();
    job.priority = low.priority;
    let (_, eval) = register(&h, job);

    h.process(&eval).unwrap();

    assert!(h.plans().is_empty());
    let update = h.last_update().unwrap();
    assert_eq!(update.status, EvalStatus::Complete);
    assert_eq!(update.queued_allocations["web"], 1);
    let metric = &update.failed_tg_allocs["web"];
    assert_eq!(metric.nodes_exhausted, 1);
    assert_eq!(metric.dimension_exhausted.get("cpu"), Some(&1));
    // System jobs wait for capacity through node events, not blocked evals.
    assert!(h.created_evals().is_empty());
    assert_eq!(
        h.store.snapshot().allocs_by_job(&low.namespace, &low.id, false).len(),
        8
    );
}

#[test]
fn service_preemption_follows_scheduler_config() {
    let (h, _, low) = full_node();
    let mut job = mock::job();
    job.priority = 90;
    job.task_groups[0].count = 1;
    job.task_groups[0].networks.clear();
    let (_, eval) = register(&h, job);

    h.process(&eval).unwrap();
    assert!(h.plans().is_empty());
    assert!(h.last_update().unwrap().blocked_eval.is_some());

    let mut config = h.store.snapshot().scheduler_config();
    config.preemption_config.service_scheduler_enabled = true;
    h.store.set_scheduler_config(config);

    let job = h.store.snapshot().job_by_id(&eval.namespace, &eval.job_id).unwrap();
    let retry = Evaluation::for_job(&job, EvalTrigger::JobRegister, h.now());
    h.process(&retry).unwrap();

    let plan = h.last_plan().unwrap();
    assert_eq!(plan.placements().count(), 1);
    assert_eq!(plan.preemptions().count(), 1);
    assert!(plan.preemptions().all(|a| a.job_id == low.id));
}
