//! Evaluation workers.
//!
//! Each worker takes one evaluation from the broker, runs the matching
//! driver to completion on the blocking pool, then acks or nacks it.

use std::sync::Arc;
use std::time::Duration;

use convoy_structs::Evaluation;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::Delivery;
use crate::error::Result;
use crate::scheduler::new_scheduler;
use crate::server::Server;
use crate::state::State;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long one dequeue waits before checking for shutdown again.
    pub dequeue_timeout: Duration,
    /// Pause after a broker error.
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            dequeue_timeout: Duration::from_millis(500),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Runs one evaluation against the latest snapshot. Evaluations already
/// settled in the store are skipped.
pub fn process_eval(server: &Server, eval: &Evaluation) -> Result<()> {
    let snapshot = server.store().snapshot();
    if snapshot.eval_by_id(&eval.id).is_some_and(|e| e.terminal_status()) {
        debug!(eval_id = %eval.id, "Skipping settled evaluation");
        return Ok(());
    }
    let mut scheduler = new_scheduler(eval.job_type, snapshot, server, server.clock());
    scheduler.process(eval)
}

pub struct Worker {
    id: usize,
    server: Arc<Server>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(id: usize, server: Arc<Server>, config: WorkerConfig) -> Self {
        Self { id, server, config }
    }

    /// Run the worker until shutdown is signaled.
    #[instrument(skip(self, shutdown), fields(worker_id = self.id))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting evaluation worker");

        loop {
            tokio::select! {
                dequeued = self.server.broker().dequeue(self.config.dequeue_timeout) => {
                    match dequeued {
                        Ok(Some(delivery)) => self.handle(delivery).await,
                        Ok(None) => {}
                        Err(e) => {
                            warn!(error = %e, "Dequeue failed");
                            tokio::time::sleep(self.config.error_backoff).await;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Evaluation worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn handle(&self, delivery: Delivery) {
        let Delivery { eval, token } = delivery;
        let eval_id = eval.id;
        let job_id = eval.job_id.clone();

        let server = Arc::clone(&self.server);
        let outcome = tokio::task::spawn_blocking(move || process_eval(&server, &eval)).await;

        let acked = match outcome {
            Ok(Ok(())) => {
                debug!(eval_id = %eval_id, job_id = %job_id, "Evaluation processed");
                self.server.broker().ack(&eval_id, &token)
            }
            Ok(Err(e)) => {
                error!(eval_id = %eval_id, job_id = %job_id, error = %e, "Evaluation failed");
                self.server.broker().nack(&eval_id, &token)
            }
            Err(e) => {
                error!(
                    eval_id = %eval_id,
                    job_id = %job_id,
                    error = %e,
                    "Evaluation task panicked"
                );
                self.server.broker().nack(&eval_id, &token)
            }
        };
        if let Err(e) = acked {
            warn!(eval_id = %eval_id, error = %e, "Failed to settle evaluation with broker");
        }
        if let Err(e) = self.server.reap_broker() {
            error!(error = %e, "Failed to reap broker");
        }
    }
}

/// Spawns `count` workers sharing `server`.
pub fn spawn_workers(
    count: usize,
    server: &Arc<Server>,
    config: &WorkerConfig,
    shutdown: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|id| {
            let worker = Worker::new(id, Arc::clone(server), config.clone());
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SystemClock;
    use crate::state::MemStore;
    use convoy_structs::{mock, EvalStatus};

    #[tokio::test]
    async fn test_worker_processes_and_acks() {
        let server = Arc::new(Server::new(MemStore::new(), 3, Arc::new(SystemClock)));
        for _ in 0..3 {
            server.upsert_node(mock::node()).unwrap();
        }
        let eval = server.register_job(mock::job()).unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = WorkerConfig {
            dequeue_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let handles = spawn_workers(2, &server, &config, &shutdown_rx);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !server.broker().is_idle() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown_tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }

        let stored = server.store().snapshot().eval_by_id(&eval.id).unwrap();
        assert_eq!(stored.status, EvalStatus::Complete);
        let job = mock::job();
        let placed: usize = server
            .store()
            .snapshot()
            .allocs()
            .filter(|a| a.task_group == job.task_groups[0].name)
            .count();
        assert_eq!(placed, 10);
    }

    #[test]
    fn test_settled_eval_is_skipped() {
        let server = Server::new(MemStore::new(), 3, Arc::new(SystemClock));
        let mut eval = mock::eval();
        eval.status = EvalStatus::Cancelled;
        server.store().upsert_evals(std::slice::from_ref(&eval));
        process_eval(&server, &eval).unwrap();
        assert!(server.store().snapshot().allocs().next().is_none());
    }
}
