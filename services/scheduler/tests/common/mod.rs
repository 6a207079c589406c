#![allow(dead_code)]

use std::sync::Arc;

use convoy_scheduler::testing::Harness;
use convoy_scheduler::{Clock, State};
use convoy_structs::{Allocation, EvalTrigger, Evaluation, Job, Node};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Harness with `nodes` registered.
pub fn harness_with(nodes: &[Node]) -> Harness {
    init_tracing();
    let h = Harness::new();
    for node in nodes {
        h.store.upsert_node(node.clone());
    }
    h
}

/// Stores `job` and returns the stored version with a registration eval.
pub fn register(h: &Harness, job: Job) -> (Arc<Job>, Evaluation) {
    let job = h.store.upsert_job(job).expect("valid job");
    let eval = Evaluation::for_job(&job, EvalTrigger::JobRegister, h.now());
    (job, eval)
}

/// Non-terminal allocations of a job.
pub fn live_allocs(h: &Harness, job: &Job) -> Vec<Allocation> {
    h.store
        .snapshot()
        .allocs_by_job(&job.namespace, &job.id, false)
}
