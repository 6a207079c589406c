mod common;

use std::collections::BTreeSet;

use chrono::Duration as ChronoDuration;
use common::{harness_with, live_allocs, register};
use convoy_scheduler::{Clock, State};
use convoy_structs::{
    mock, AllocClientStatus, Constraint, EvalStatus, EvalTrigger, Job, UpdateStrategy,
    EVAL_DESC_MAX_PLANS,
};
use rstest::rstest;

#[test]
fn places_every_allocation_across_ten_nodes() {
    let nodes: Vec<_> = (0..10).map(|_| mock::node()).collect();
    let h = harness_with(&nodes);
    let (job, eval) = register(&h, mock::job());

    h.process(&eval).unwrap();

    let plans = h.plans();
    assert_eq!(plans.len(), 1);
    let placed: Vec<_> = plans[0].placements().collect();
    assert_eq!(placed.len(), 10);
    let names: BTreeSet<_> = placed.iter().map(|a| a.name.clone()).collect();
    assert_eq!(names.len(), 10, "names must be unique");
    assert!(placed.iter().all(|a| a.metrics.is_some()));
    assert!(placed.iter().all(|a| a.allocated_resources.shared.ports.len() == 1));

    let update = h.last_update().unwrap();
    assert_eq!(update.status, EvalStatus::Complete);
    assert_eq!(update.queued_allocations["web"], 0);
    assert!(update.blocked_eval.is_none());
    assert!(h.created_evals().is_empty());
    assert_eq!(live_allocs(&h, &job).len(), 10);

    // Nothing left to do the second time around.
    let again = convoy_structs::Evaluation::for_job(&job, EvalTrigger::NodeUpdate, h.now());
    h.process(&again).unwrap();
    assert_eq!(h.plans().len(), 1);
    assert_eq!(h.last_update().unwrap().status, EvalStatus::Complete);
}

#[test]
fn disk_exhaustion_creates_blocked_eval() {
    let mut node = mock::node();
    node.resources.cpu_shares = 20_000;
    node.resources.disk_mb = 1_200;
    let h = harness_with(&[node]);
    let (job, eval) = register(&h, mock::job());

    h.process(&eval).unwrap();

    assert_eq!(h.last_plan().unwrap().placements().count(), 8);
    let created = h.created_evals();
    assert_eq!(created.len(), 1);
    let blocked = &created[0];
    assert_eq!(blocked.status, EvalStatus::Blocked);
    assert_eq!(blocked.triggered_by, EvalTrigger::QueuedAllocs);
    assert_eq!(blocked.previous_eval, Some(eval.id));
    assert!(!blocked.class_eligibility.is_empty());

    let update = h.last_update().unwrap();
    assert_eq!(update.status, EvalStatus::Complete);
    assert_eq!(update.blocked_eval, Some(blocked.id));
    assert_eq!(update.queued_allocations["web"], 2);
    let metric = &update.failed_tg_allocs["web"];
    assert_eq!(metric.coalesced_failures, 1);
    assert_eq!(metric.nodes_exhausted, 1);
    assert_eq!(metric.dimension_exhausted.get("disk"), Some(&1));
    assert_eq!(live_allocs(&h, &job).len(), 8);
}

#[test]
fn oversized_disk_ask_places_one_and_blocks() {
    let h = harness_with(&[mock::node()]);
    let mut job = mock::job();
    job.task_groups[0].count = 2;
    job.task_groups[0].ephemeral_disk.size_mb = 60 * 1024;
    let (job, eval) = register(&h, job);

    h.process(&eval).unwrap();

    assert_eq!(h.plans().len(), 1);
    let plan = h.last_plan().unwrap();
    assert!(plan.annotations.is_none());
    assert_eq!(plan.placements().count(), 1);
    assert_eq!(live_allocs(&h, &job).len(), 1);

    let created = h.created_evals();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].status, EvalStatus::Blocked);
    assert_eq!(created[0].triggered_by, EvalTrigger::QueuedAllocs);

    let update = h.last_update().unwrap();
    assert_eq!(update.status, EvalStatus::Complete);
    assert_eq!(update.blocked_eval, Some(created[0].id));
    assert_eq!(update.queued_allocations["web"], 1);
    let metric = &update.failed_tg_allocs["web"];
    assert_eq!(metric.dimension_exhausted.get("disk"), Some(&1));
    // The first failure carries the metric; only later ones coalesce.
    assert_eq!(metric.coalesced_failures, 0);
}

#[test]
fn unblocked_rerun_still_short_blocks_again() {
    let mut node = mock::node();
    node.resources.cpu_shares = 1_000;
    let h = harness_with(&[node]);
    let (_, eval) = register(&h, mock::job());
    h.process(&eval).unwrap();
    let blocked = h.created_evals().pop().unwrap();

    let rerun = blocked.create_unblocked_eval(h.now());
    h.process(&rerun).unwrap();

    let created = h.created_evals();
    assert_eq!(created.len(), 2);
    let again = &created[1];
    assert_ne!(again.id, blocked.id);
    assert_eq!(again.status, EvalStatus::Blocked);
    assert_eq!(again.previous_eval, Some(rerun.id));

    let update = h.last_update().unwrap();
    assert_eq!(update.id, rerun.id);
    assert_eq!(update.status, EvalStatus::Complete);
    assert_eq!(update.blocked_eval, Some(again.id));
}

#[test]
fn destructive_update_respects_max_parallel() {
    let nodes: Vec<_> = (0..10).map(|_| mock::node()).collect();
    let h = harness_with(&nodes);

    let mut job = mock::job();
    job.update = Some(UpdateStrategy {
        max_parallel: 4,
        ..Default::default()
    });
    let old = h.store.upsert_job(job).unwrap();
    let existing: Vec<_> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| mock::alloc_for(&old, n, i as u32))
        .collect();
    h.store.upsert_allocs(existing.clone());

    let mut next = (*old).clone();
    next.task_groups[0].tasks[0].config = serde_json::json!({ "command": "/bin/true" });
    let (new, eval) = register(&h, next);
    assert_eq!(new.version, 1);

    h.process(&eval).unwrap();

    let plan = h.last_plan().unwrap();
    let stops: Vec<_> = plan.stops().collect();
    let placed: Vec<_> = plan.placements().collect();
    assert_eq!(stops.len(), 4);
    assert_eq!(placed.len(), 4);

    let deployment = plan.deployment.clone().expect("deployment created");
    assert_eq!(deployment.job_version, 1);
    assert_eq!(deployment.task_groups["web"].desired_total, 10);

    let replaced: BTreeSet<_> = stops.iter().map(|a| a.id).collect();
    for alloc in &placed {
        assert_eq!(alloc.deployment_id, Some(deployment.id));
        assert_eq!(alloc.job_version(), 1);
        let prev = alloc.previous_allocation.expect("links to replaced alloc");
        assert!(replaced.contains(&prev));
        // Names carry over from what they replace.
        let prev_name = &existing.iter().find(|a| a.id == prev).unwrap().name;
        assert_eq!(&alloc.name, prev_name);
    }
}

#[test]
fn distinct_hosts_limits_one_per_node() {
    let nodes = [mock::node(), mock::node()];
    let h = harness_with(&nodes);
    let mut job = mock::job();
    job.task_groups[0].count = 3;
    job.constraints.push(Constraint::distinct_hosts());
    let (_, eval) = register(&h, job);

    h.process(&eval).unwrap();

    let plan = h.last_plan().unwrap();
    let hosts: BTreeSet<_> = plan.placements().map(|a| a.node_id).collect();
    assert_eq!(plan.placements().count(), 2);
    assert_eq!(hosts.len(), 2);

    let update = h.last_update().unwrap();
    assert_eq!(update.queued_allocations["web"], 1);
    let metric = &update.failed_tg_allocs["web"];
    assert_eq!(metric.nodes_filtered, 2);
    assert!(update.blocked_eval.is_some());
}

#[test]
fn distinct_property_spreads_over_racks() {
    let mut nodes = vec![mock::node(), mock::node(), mock::node()];
    nodes[2].meta.insert("rack".into(), "r2".into());
    let h = harness_with(&nodes);

    let mut job = mock::job();
    job.task_groups[0].count = 2;
    job.task_groups[0]
        .constraints
        .push(Constraint::distinct_property("${meta.rack}", 1));
    let (_, eval) = register(&h, job);

    h.process(&eval).unwrap();

    let snap = h.store.snapshot();
    let racks: BTreeSet<_> = h
        .last_plan()
        .unwrap()
        .placements()
        .map(|a| snap.node_by_id(&a.node_id).unwrap().meta["rack"].clone())
        .collect();
    assert_eq!(racks, BTreeSet::from(["r1".to_string(), "r2".to_string()]));
    assert!(h.last_update().unwrap().failed_tg_allocs.is_empty());
}

#[rstest]
#[case::service(mock::job(), 5)]
#[case::batch(mock::batch_job(), 2)]
fn eval_fails_after_max_attempts(#[case] job: Job, #[case] attempts: usize) {
    let h = harness_with(&[mock::node(), mock::node()]);
    h.set_reject_plans(true);
    let (_, eval) = register(&h, job);

    h.process(&eval).unwrap();

    assert_eq!(h.plans().len(), attempts);
    let update = h.last_update().unwrap();
    assert_eq!(update.status, EvalStatus::Failed);
    assert_eq!(update.status_description, EVAL_DESC_MAX_PLANS);
    assert!(h.created_evals().is_empty());
}

#[test]
fn annotated_eval_records_desired_updates() {
    let h = harness_with(&[mock::node(), mock::node()]);
    let (_, mut eval) = register(&h, mock::job());
    eval.annotate_plan = true;

    h.process(&eval).unwrap();

    let annotations = h.last_plan().unwrap().annotations.unwrap();
    assert_eq!(annotations.desired_tg_updates["web"].place, 10);
}

#[test]
fn stopped_job_stops_all_allocations() {
    let nodes = [mock::node(), mock::node()];
    let h = harness_with(&nodes);
    let (job, eval) = register(&h, mock::job());
    h.process(&eval).unwrap();

    let mut stopped = (*job).clone();
    stopped.stop = true;
    let (job, eval) = register(&h, stopped);
    h.process(&eval).unwrap();

    let plan = h.last_plan().unwrap();
    assert_eq!(plan.stops().count(), 10);
    assert_eq!(plan.placements().count(), 0);
    assert!(live_allocs(&h, &job)
        .iter()
        .all(|a| a.desired_status != convoy_structs::AllocDesiredStatus::Run));
}

#[test]
fn failed_alloc_is_rescheduled_after_delay() {
    let nodes = [mock::node(), mock::node()];
    let h = harness_with(&nodes);
    let mut job = mock::job();
    job.task_groups[0].count = 2;
    let (job, eval) = register(&h, job);
    h.process(&eval).unwrap();

    let victim = live_allocs(&h, &job).remove(0);
    h.store
        .update_alloc_client_status(&victim.id, AllocClientStatus::Failed, h.now())
        .unwrap();

    let failure = convoy_structs::Evaluation::for_job(&job, EvalTrigger::AllocFailure, h.now());
    h.process(&failure).unwrap();

    // Reschedule policy delays by 5s: a follow-up is created, nothing placed.
    let followup = h
        .created_evals()
        .into_iter()
        .find(|e| e.triggered_by == EvalTrigger::RetryFailedAlloc)
        .expect("follow-up evaluation");
    assert!(followup.wait_until.unwrap() > h.now());
    let plan = h.last_plan().unwrap();
    assert_eq!(plan.placements().filter(|a| a.id != victim.id).count(), 0);
    let marked = h.store.snapshot().alloc_by_id(&victim.id).unwrap();
    assert_eq!(marked.followup_eval_id, Some(followup.id));

    h.advance(ChronoDuration::seconds(6));
    h.process(&followup).unwrap();

    let replacement = h
        .last_plan()
        .unwrap()
        .placements()
        .find(|a| a.previous_allocation == Some(victim.id))
        .cloned()
        .expect("replacement placed");
    assert_eq!(replacement.name, victim.name);
    let tracker = replacement.reschedule_tracker.expect("tracker carried");
    assert_eq!(tracker.events.len(), 1);
    assert_eq!(tracker.events[0].prev_alloc_id, victim.id);
    assert_eq!(tracker.events[0].prev_node_id, victim.node_id);
}

#[test]
fn down_node_allocations_are_replaced() {
    let nodes = [mock::node(), mock::node()];
    let h = harness_with(&nodes);
    let mut job = mock::job();
    job.task_groups[0].count = 4;
    let (job, eval) = register(&h, job);
    h.process(&eval).unwrap();

    let down = nodes[0].id;
    let on_down = live_allocs(&h, &job)
        .iter()
        .filter(|a| a.node_id == down)
        .count();
    h.store
        .update_node_status(&down, convoy_structs::NodeStatus::Down, h.now())
        .unwrap();

    let node_eval = convoy_structs::Evaluation::for_job(&job, EvalTrigger::NodeUpdate, h.now());
    h.process(&node_eval).unwrap();

    let plan = h.last_plan().unwrap();
    if on_down > 0 {
        assert_eq!(plan.stops().count(), on_down);
        assert!(plan
            .stops()
            .all(|a| a.client_status == AllocClientStatus::Lost));
        assert_eq!(plan.placements().count(), on_down);
        assert!(plan.placements().all(|a| a.node_id != down));
    }
    let live: Vec<_> = live_allocs(&h, &job)
        .into_iter()
        .filter(|a| a.client_status != AllocClientStatus::Lost)
        .collect();
    assert_eq!(live.len(), 4);
}
