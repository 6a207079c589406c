mod common;

use std::sync::Arc;

use convoy_scheduler::worker::process_eval;
use convoy_scheduler::{MemStore, Server, State, SystemClock};
use convoy_structs::{mock, AllocClientStatus, EvalStatus, EvalTrigger, NodeStatus};

fn server() -> Server {
    common::init_tracing();
    Server::new(MemStore::new(), 3, Arc::new(SystemClock))
}

/// Runs everything ready in the broker to completion.
fn drain(server: &Server) -> usize {
    let mut processed = 0;
    while let Some(delivery) = server.broker().try_dequeue().unwrap() {
        process_eval(server, &delivery.eval).unwrap();
        server.broker().ack(&delivery.eval.id, &delivery.token).unwrap();
        server.reap_broker().unwrap();
        processed += 1;
    }
    processed
}

#[test]
fn blocked_eval_runs_when_capacity_arrives() {
    let server = server();
    let mut small = mock::node();
    small.resources.cpu_shares = 2_000;
    server.upsert_node(small).unwrap();

    let job = mock::job();
    let (ns, id) = (job.namespace.clone(), job.id.clone());
    let eval = server.register_job(job).unwrap();
    assert_eq!(drain(&server), 1);

    let snap = server.store().snapshot();
    assert_eq!(snap.allocs_by_job(&ns, &id, false).len(), 4);
    let settled = snap.eval_by_id(&eval.id).unwrap();
    assert_eq!(settled.status, EvalStatus::Complete);
    let blocked_id = settled.blocked_eval.expect("blocked eval");
    assert_eq!(server.blocked_len(), 1);

    server.upsert_node(mock::node()).unwrap();
    assert_eq!(server.blocked_len(), 0);
    assert_eq!(drain(&server), 1);

    let snap = server.store().snapshot();
    assert_eq!(snap.allocs_by_job(&ns, &id, false).len(), 10);
    let superseded = snap.eval_by_id(&blocked_id).unwrap();
    assert_eq!(superseded.status, EvalStatus::Cancelled);
    let rerun_id = superseded.next_eval.expect("successor");
    assert_ne!(rerun_id, blocked_id);
    let rerun = snap.eval_by_id(&rerun_id).unwrap();
    assert_eq!(rerun.status, EvalStatus::Complete);
    assert_eq!(rerun.previous_eval, Some(blocked_id));
    assert!(server.broker().is_idle());
}

#[test]
fn deregister_stops_allocations() {
    let server = server();
    server.upsert_node(mock::node()).unwrap();
    server.upsert_node(mock::node()).unwrap();
    let job = mock::job();
    let (ns, id) = (job.namespace.clone(), job.id.clone());
    server.register_job(job).unwrap();
    drain(&server);
    assert_eq!(server.store().snapshot().allocs_by_job(&ns, &id, false).len(), 10);

    let eval = server.deregister_job(&ns, &id).unwrap();
    assert_eq!(eval.triggered_by, EvalTrigger::JobDeregister);
    drain(&server);

    assert!(server.store().snapshot().allocs_by_job(&ns, &id, false).is_empty());
    assert!(server.deregister_job(&ns, "missing").is_err());
}

#[test]
fn system_job_follows_new_nodes() {
    let server = server();
    server.upsert_node(mock::node()).unwrap();
    let job = mock::system_job();
    let (ns, id) = (job.namespace.clone(), job.id.clone());
    server.register_job(job).unwrap();
    drain(&server);

    let evals = server.upsert_node(mock::node()).unwrap();
    assert_eq!(evals.len(), 1);
    assert_eq!(evals[0].triggered_by, EvalTrigger::NodeUpdate);
    drain(&server);
    assert_eq!(server.store().snapshot().allocs_by_job(&ns, &id, false).len(), 2);
}

#[test]
fn node_down_replaces_service_allocations() {
    let server = server();
    let first = mock::node();
    server.upsert_node(first.clone()).unwrap();
    let mut job = mock::job();
    job.task_groups[0].count = 2;
    let (ns, id) = (job.namespace.clone(), job.id.clone());
    server.register_job(job).unwrap();
    drain(&server);

    let second = mock::node();
    server.upsert_node(second.clone()).unwrap();
    let evals = server.update_node_status(&first.id, NodeStatus::Down).unwrap();
    assert_eq!(evals.len(), 1);
    drain(&server);

    let live = server.store().snapshot().allocs_by_job(&ns, &id, false);
    let running: Vec<_> = live
        .iter()
        .filter(|a| a.client_status != AllocClientStatus::Lost)
        .collect();
    assert_eq!(running.len(), 2);
    assert!(running.iter().all(|a| a.node_id == second.id));
}

#[test]
fn failed_alloc_schedules_delayed_followup() {
    let server = server();
    server.upsert_node(mock::node()).unwrap();
    server.upsert_node(mock::node()).unwrap();
    let mut job = mock::job();
    job.task_groups[0].count = 2;
    let (ns, id) = (job.namespace.clone(), job.id.clone());
    server.register_job(job).unwrap();
    drain(&server);

    let victim = server.store().snapshot().allocs_by_job(&ns, &id, false)[0].clone();
    let eval = server
        .update_alloc_client_status(&victim.id, AllocClientStatus::Failed)
        .unwrap()
        .expect("failure eval");
    assert_eq!(eval.triggered_by, EvalTrigger::AllocFailure);
    drain(&server);

    // The reschedule policy delays the replacement, so it waits in the broker.
    assert_eq!(server.broker().stats().total_waiting, 1);
    let marked = server.store().snapshot().alloc_by_id(&victim.id).unwrap();
    assert!(marked.followup_eval_id.is_some());
}
