//! Scheduler driver interfaces and the driver factory.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use convoy_structs::{Evaluation, JobType, Plan, PlanResult};

use crate::error::Result;
use crate::generic::GenericScheduler;
use crate::state::State;
use crate::system::SystemScheduler;

/// Processes one evaluation to completion.
pub trait Scheduler {
    fn process(&mut self, eval: &Evaluation) -> Result<()>;
}

/// Where a driver sends its decisions.
pub trait Planner: Send + Sync {
    /// Commits what it can of `plan`. When part of it was rejected the
    /// result carries a `refresh_index` and, if available, a snapshot at
    /// least that fresh.
    fn submit_plan(&self, plan: &Plan) -> Result<(PlanResult, Option<Arc<dyn State>>)>;

    /// Records the final status of an evaluation.
    fn update_eval(&self, eval: &Evaluation) -> Result<()>;

    /// Creates a follow-up or blocked evaluation.
    fn create_eval(&self, eval: &Evaluation) -> Result<()>;
}

/// Source of `now` for one evaluation attempt.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Picks the driver for a job type.
pub fn new_scheduler<'a>(
    job_type: JobType,
    state: Arc<dyn State>,
    planner: &'a dyn Planner,
    clock: &'a dyn Clock,
) -> Box<dyn Scheduler + 'a> {
    match job_type {
        JobType::Service => Box::new(GenericScheduler::new(false, state, planner, clock)),
        JobType::Batch => Box::new(GenericScheduler::new(true, state, planner, clock)),
        JobType::System => Box::new(SystemScheduler::new(false, state, planner, clock)),
        JobType::Sysbatch => Box::new(SystemScheduler::new(true, state, planner, clock)),
    }
}

/// Retries `attempt` until it reports done. An attempt that made progress
/// resets the count; `limit` attempts in a row without progress fail.
pub(crate) fn retry_max(limit: u32, mut attempt: impl FnMut() -> Result<Attempt>) -> Result<()> {
    let mut attempts = 0;
    while attempts < limit {
        match attempt()? {
            Attempt::Done => return Ok(()),
            Attempt::Retry { progress: true } => attempts = 0,
            Attempt::Retry { progress: false } => attempts += 1,
        }
    }
    Err(crate::error::SchedulerError::MaxAttempts(limit))
}

/// Outcome of one pass over an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Attempt {
    Done,
    /// The plan was partly rejected; `progress` if anything committed.
    Retry { progress: bool },
}

/// Whether a committed result changed anything.
pub(crate) fn progress_made(result: &PlanResult) -> bool {
    !result.node_update.is_empty()
        || !result.node_allocation.is_empty()
        || !result.node_preemptions.is_empty()
        || result.deployment.is_some()
        || !result.deployment_updates.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchedulerError;

    #[test]
    fn test_retry_max_stops_after_limit() {
        let mut calls = 0;
        let err = retry_max(3, || {
            calls += 1;
            Ok(Attempt::Retry { progress: false })
        })
        .unwrap_err();
        assert!(matches!(err, SchedulerError::MaxAttempts(3)));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_max_progress_resets_count() {
        let mut calls = 0;
        retry_max(2, || {
            calls += 1;
            Ok(match calls {
                1 | 3 => Attempt::Retry { progress: false },
                2 => Attempt::Retry { progress: true },
                _ => Attempt::Done,
            })
        })
        .unwrap();
        assert_eq!(calls, 4);
    }
}
