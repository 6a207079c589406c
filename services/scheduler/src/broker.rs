//! Evaluation broker.
//!
//! Ready evaluations are handed out highest priority first, oldest first
//! within a priority. At most one evaluation per job is ready or unacked at
//! any time; a later evaluation for a busy job waits in the job's single
//! pending slot, and whatever it displaces there is parked as cancelable.
//! Evaluations with a `wait_until` sit in a delay heap until they are due.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use convoy_id::{EvalId, Ulid};
use convoy_structs::Evaluation;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("evaluation {0} is not outstanding")]
    NotOutstanding(EvalId),

    #[error("token does not match outstanding evaluation {0}")]
    TokenMismatch(EvalId),

    #[error("eval broker disabled")]
    Disabled,
}

/// Point-in-time broker counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BrokerStats {
    pub total_ready: usize,
    pub total_unacked: usize,
    pub total_pending: usize,
    pub total_waiting: usize,
    pub total_failed: usize,
    pub total_cancelable: usize,
}

/// A dequeued evaluation and the token that must accompany its ack or nack.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub eval: Evaluation,
    pub token: String,
}

struct ReadyEntry {
    priority: u8,
    seq: u64,
    eval: Evaluation,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    // Max-heap: higher priority first, then lower sequence.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct DelayedEntry {
    wait_until: DateTime<Utc>,
    seq: u64,
    eval: Evaluation,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DelayedEntry {}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    // Max-heap turned min-heap: earliest deadline on top.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .wait_until
            .cmp(&self.wait_until)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

type JobKey = (String, String);

fn job_key(eval: &Evaluation) -> JobKey {
    (eval.namespace.clone(), eval.job_id.clone())
}

struct Unacked {
    eval: Evaluation,
    token: String,
}

#[derive(Default)]
struct Inner {
    enabled: bool,
    seq: u64,
    ready: BinaryHeap<ReadyEntry>,
    unacked: BTreeMap<EvalId, Unacked>,
    /// Job -> the one evaluation that is ready or unacked for it.
    in_flight: BTreeMap<JobKey, EvalId>,
    pending: BTreeMap<JobKey, Evaluation>,
    cancelable: Vec<Evaluation>,
    delayed: BinaryHeap<DelayedEntry>,
    failed: Vec<Evaluation>,
    deliveries: BTreeMap<EvalId, u32>,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn push_ready(&mut self, eval: Evaluation) {
        let seq = self.next_seq();
        self.ready.push(ReadyEntry {
            priority: eval.priority,
            seq,
            eval,
        });
    }

    /// Makes `eval` ready unless its job is busy, in which case it takes
    /// the job's pending slot.
    fn enqueue_ready(&mut self, eval: Evaluation) {
        let key = job_key(&eval);
        match self.in_flight.get(&key) {
            Some(id) if *id == eval.id => self.push_ready(eval),
            Some(_) => {
                debug!(eval_id = %eval.id, job_id = %eval.job_id, "Job busy, evaluation pending");
                if let Some(old) = self.pending.insert(key, eval) {
                    self.cancelable.push(old);
                }
            }
            None => {
                self.in_flight.insert(key, eval.id);
                self.push_ready(eval);
            }
        }
    }

    /// The job's in-flight evaluation is done; its pending one goes next.
    fn release_job(&mut self, key: &JobKey) {
        self.in_flight.remove(key);
        if let Some(next) = self.pending.remove(key) {
            self.enqueue_ready(next);
        }
    }

    fn check_token(&self, id: &EvalId, token: &str) -> Result<(), BrokerError> {
        let unacked = self.unacked.get(id).ok_or(BrokerError::NotOutstanding(*id))?;
        if unacked.token != token {
            return Err(BrokerError::TokenMismatch(*id));
        }
        Ok(())
    }
}

pub struct EvalBroker {
    inner: Mutex<Inner>,
    ready_notify: Notify,
    delivery_limit: u32,
}

impl EvalBroker {
    /// A nacked evaluation that has been delivered `delivery_limit` times
    /// moves to the failed queue.
    pub fn new(delivery_limit: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                enabled: true,
                ..Default::default()
            }),
            ready_notify: Notify::new(),
            delivery_limit: delivery_limit.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Disabling drops everything held and fails later calls.
    pub fn set_enabled(&self, enabled: bool) {
        let mut inner = self.lock();
        if !enabled {
            *inner = Inner::default();
        }
        inner.enabled = enabled;
        drop(inner);
        self.ready_notify.notify_waiters();
    }

    pub fn enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn enqueue(&self, eval: Evaluation) -> Result<(), BrokerError> {
        let mut inner = self.lock();
        if !inner.enabled {
            return Err(BrokerError::Disabled);
        }
        if let Some(wait_until) = eval.wait_until {
            debug!(eval_id = %eval.id, %wait_until, "Delaying evaluation");
            let seq = inner.next_seq();
            inner.delayed.push(DelayedEntry {
                wait_until,
                seq,
                eval,
            });
            return Ok(());
        }
        inner.enqueue_ready(eval);
        drop(inner);
        self.ready_notify.notify_waiters();
        Ok(())
    }

    /// Moves delayed evaluations due at `now` to the ready queue.
    pub fn promote_delayed(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.lock();
        let mut promoted = 0;
        while inner.delayed.peek().is_some_and(|d| d.wait_until <= now) {
            let Some(entry) = inner.delayed.pop() else {
                break;
            };
            inner.enqueue_ready(entry.eval);
            promoted += 1;
        }
        drop(inner);
        if promoted > 0 {
            debug!(promoted, "Promoted delayed evaluations");
            self.ready_notify.notify_waiters();
        }
        promoted
    }

    /// Takes the next ready evaluation without waiting.
    pub fn try_dequeue(&self) -> Result<Option<Delivery>, BrokerError> {
        let mut inner = self.lock();
        if !inner.enabled {
            return Err(BrokerError::Disabled);
        }
        let Some(entry) = inner.ready.pop() else {
            return Ok(None);
        };
        let eval = entry.eval;
        let token = Ulid::new().to_string();
        *inner.deliveries.entry(eval.id).or_default() += 1;
        inner.unacked.insert(
            eval.id,
            Unacked {
                eval: eval.clone(),
                token: token.clone(),
            },
        );
        Ok(Some(Delivery { eval, token }))
    }

    /// Waits up to `timeout` for a ready evaluation.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.ready_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_dequeue()? {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    /// Token of an outstanding evaluation.
    pub fn outstanding(&self, id: &EvalId) -> Option<String> {
        self.lock().unacked.get(id).map(|u| u.token.clone())
    }

    /// Completes an outstanding evaluation and releases its job.
    pub fn ack(&self, id: &EvalId, token: &str) -> Result<(), BrokerError> {
        let mut inner = self.lock();
        inner.check_token(id, token)?;
        let Some(unacked) = inner.unacked.remove(id) else {
            return Err(BrokerError::NotOutstanding(*id));
        };
        inner.deliveries.remove(id);
        inner.release_job(&job_key(&unacked.eval));
        drop(inner);
        self.ready_notify.notify_waiters();
        Ok(())
    }

    /// Returns an outstanding evaluation for another try, or fails it once
    /// the delivery limit is reached.
    pub fn nack(&self, id: &EvalId, token: &str) -> Result<(), BrokerError> {
        let mut inner = self.lock();
        inner.check_token(id, token)?;
        let Some(unacked) = inner.unacked.remove(id) else {
            return Err(BrokerError::NotOutstanding(*id));
        };
        let deliveries = inner.deliveries.get(id).copied().unwrap_or(0);
        if deliveries >= self.delivery_limit {
            warn!(eval_id = %id, deliveries, "Evaluation reached delivery limit");
            inner.deliveries.remove(id);
            let key = job_key(&unacked.eval);
            inner.failed.push(unacked.eval);
            inner.release_job(&key);
        } else {
            inner.push_ready(unacked.eval);
        }
        drop(inner);
        self.ready_notify.notify_waiters();
        Ok(())
    }

    /// Evaluations superseded in a pending slot.
    pub fn take_cancelable(&self) -> Vec<Evaluation> {
        std::mem::take(&mut self.lock().cancelable)
    }

    /// Evaluations that reached the delivery limit.
    pub fn take_failed(&self) -> Vec<Evaluation> {
        std::mem::take(&mut self.lock().failed)
    }

    pub fn stats(&self) -> BrokerStats {
        let inner = self.lock();
        BrokerStats {
            total_ready: inner.ready.len(),
            total_unacked: inner.unacked.len(),
            total_pending: inner.pending.len(),
            total_waiting: inner.delayed.len(),
            total_failed: inner.failed.len(),
            total_cancelable: inner.cancelable.len(),
        }
    }

    /// Nothing ready, outstanding, pending or delayed.
    pub fn is_idle(&self) -> bool {
        let inner = self.lock();
        inner.ready.is_empty()
            && inner.unacked.is_empty()
            && inner.pending.is_empty()
            && inner.delayed.is_empty()
    }

    /// Promotes delayed evaluations on every tick until shutdown.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, tick: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(tick_ms = tick.as_millis() as u64, "Starting delayed evaluation promoter");

        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.promote_delayed(Utc::now());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Delayed evaluation promoter shutting down");
                        break;
                    }
                }
            }
        }
    }
}
