//! In-process harness for driving the schedulers in tests.
//!
//! [`Harness`] is both the [`Planner`] and the [`Clock`]: plans are
//! committed to its own [`MemStore`] and every call is recorded so tests can
//! assert on what a driver decided.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use convoy_structs::{Evaluation, Plan, PlanResult};

use crate::error::Result;
use crate::scheduler::{new_scheduler, Clock, Planner};
use crate::state::{MemStore, State};

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub struct Harness {
    pub store: MemStore,
    plans: Mutex<Vec<Plan>>,
    results: Mutex<Vec<PlanResult>>,
    updated_evals: Mutex<Vec<Evaluation>>,
    created_evals: Mutex<Vec<Evaluation>>,
    now: Mutex<DateTime<Utc>>,
    reject_plans: AtomicBool,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(MemStore::new())
    }

    pub fn with_store(store: MemStore) -> Self {
        Self {
            store,
            plans: Mutex::default(),
            results: Mutex::default(),
            updated_evals: Mutex::default(),
            created_evals: Mutex::default(),
            now: Mutex::new(Utc::now()),
            reject_plans: AtomicBool::new(false),
        }
    }

    pub fn set_now(&self, now: DateTime<Utc>) {
        *locked(&self.now) = now;
    }

    pub fn advance(&self, by: ChronoDuration) {
        let mut now = locked(&self.now);
        *now += by;
    }

    /// While set, every plan is refused without committing anything.
    pub fn set_reject_plans(&self, reject: bool) {
        self.reject_plans.store(reject, Ordering::SeqCst);
    }

    /// Stores `eval` and runs the driver for its job type against the
    /// current state.
    pub fn process(&self, eval: &Evaluation) -> Result<()> {
        self.store.upsert_evals(std::slice::from_ref(eval));
        let mut scheduler = new_scheduler(eval.job_type, self.store.snapshot(), self, self);
        scheduler.process(eval)
    }

    pub fn plans(&self) -> Vec<Plan> {
        locked(&self.plans).clone()
    }

    pub fn last_plan(&self) -> Option<Plan> {
        locked(&self.plans).last().cloned()
    }

    pub fn results(&self) -> Vec<PlanResult> {
        locked(&self.results).clone()
    }

    pub fn updated_evals(&self) -> Vec<Evaluation> {
        locked(&self.updated_evals).clone()
    }

    /// Final status of the last evaluation the driver settled.
    pub fn last_update(&self) -> Option<Evaluation> {
        locked(&self.updated_evals).last().cloned()
    }

    pub fn created_evals(&self) -> Vec<Evaluation> {
        locked(&self.created_evals).clone()
    }
}

impl Clock for Harness {
    fn now(&self) -> DateTime<Utc> {
        *locked(&self.now)
    }
}

impl Planner for Harness {
    fn submit_plan(&self, plan: &Plan) -> Result<(PlanResult, Option<Arc<dyn State>>)> {
        locked(&self.plans).push(plan.clone());

        if self.reject_plans.load(Ordering::SeqCst) {
            let result = PlanResult {
                refresh_index: self.store.index(),
                ..Default::default()
            };
            locked(&self.results).push(result.clone());
            let fresh: Arc<dyn State> = self.store.snapshot();
            return Ok((result, Some(fresh)));
        }

        let applied = self.store.apply_plan(plan, self.now());
        locked(&self.created_evals).extend(applied.preemption_evals);
        locked(&self.results).push(applied.result.clone());

        let fresh = (applied.result.refresh_index != 0).then(|| {
            let snapshot: Arc<dyn State> = self.store.snapshot();
            snapshot
        });
        Ok((applied.result, fresh))
    }

    fn update_eval(&self, eval: &Evaluation) -> Result<()> {
        self.store.upsert_evals(std::slice::from_ref(eval));
        locked(&self.updated_evals).push(eval.clone());
        Ok(())
    }

    fn create_eval(&self, eval: &Evaluation) -> Result<()> {
        self.store.upsert_evals(std::slice::from_ref(eval));
        locked(&self.created_evals).push(eval.clone());
        Ok(())
    }
}
