//! Tracker for evaluations waiting on cluster capacity.
//!
//! A blocked evaluation is indexed by the computed node classes it found
//! feasible. A capacity change on a class wakes every evaluation that did
//! not rule that class out, plus every escaped evaluation, whose class
//! results can't be trusted. At most one blocked evaluation is kept per job.

use std::collections::BTreeMap;

use convoy_id::EvalId;
use convoy_structs::Evaluation;
use tracing::debug;

/// Result of handing an evaluation to the tracker. `replaced` is the job's
/// previous blocked evaluation, which the caller should cancel.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockOutcome {
    /// Waiting for a capacity change.
    Tracked { replaced: Option<Evaluation> },
    /// Capacity changed after the evaluation's snapshot was taken, so it
    /// should run again right away.
    Unblocked { replaced: Option<Evaluation> },
    /// The job already has a newer blocked evaluation; this one should be
    /// cancelled.
    Duplicate,
}

#[derive(Debug, Default, Clone)]
pub struct BlockedStats {
    pub total_blocked: u64,
    pub total_escaped: u64,
    pub total_unblocked: u64,
    pub total_duplicates: u64,
}

#[derive(Debug, Default)]
pub struct BlockedEvals {
    captured: BTreeMap<EvalId, Evaluation>,
    escaped: BTreeMap<EvalId, Evaluation>,
    /// (namespace, job) -> its blocked evaluation.
    jobs: BTreeMap<(String, String), EvalId>,
    /// Computed class -> index of the last capacity change seen for it.
    unblock_indexes: BTreeMap<String, u64>,
    stats: BlockedStats,
}

/// The later write wins.
fn latest_index(eval: &Evaluation) -> u64 {
    eval.modify_index.max(eval.create_index).max(eval.snapshot_index)
}

impl BlockedEvals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.captured.len() + self.escaped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &EvalId) -> bool {
        self.captured.contains_key(id) || self.escaped.contains_key(id)
    }

    pub fn stats(&self) -> BlockedStats {
        self.stats.clone()
    }

    /// Starts tracking `eval`.
    pub fn block(&mut self, eval: Evaluation) -> BlockOutcome {
        let job_key = (eval.namespace.clone(), eval.job_id.clone());

        let mut replaced = None;
        if let Some(existing_id) = self.jobs.get(&job_key).copied() {
            if let Some(existing) = self.remove(&existing_id) {
                if latest_index(&existing) > latest_index(&eval) {
                    self.insert(existing);
                    self.stats.total_duplicates += 1;
                    debug!(
                        eval_id = %eval.id,
                        job_id = %eval.job_id,
                        "Dropping duplicate blocked evaluation"
                    );
                    return BlockOutcome::Duplicate;
                }
                self.stats.total_duplicates += 1;
                replaced = Some(existing);
            }
        }

        if self.missed_unblock(&eval) {
            self.stats.total_unblocked += 1;
            debug!(
                eval_id = %eval.id,
                job_id = %eval.job_id,
                "Capacity changed since snapshot, unblocking"
            );
            return BlockOutcome::Unblocked { replaced };
        }

        debug!(
            eval_id = %eval.id,
            job_id = %eval.job_id,
            escaped = eval.escaped_computed_class,
            "Tracking blocked evaluation"
        );
        self.insert(eval);
        BlockOutcome::Tracked { replaced }
    }

    /// Whether a class the evaluation could use changed after its snapshot.
    fn missed_unblock(&self, eval: &Evaluation) -> bool {
        self.unblock_indexes.iter().any(|(class, index)| {
            *index > eval.snapshot_index
                && (eval.escaped_computed_class
                    || eval.class_eligibility.get(class).copied().unwrap_or(true))
        })
    }

    fn insert(&mut self, eval: Evaluation) {
        self.jobs
            .insert((eval.namespace.clone(), eval.job_id.clone()), eval.id);
        if eval.escaped_computed_class {
            self.stats.total_escaped += 1;
            self.escaped.insert(eval.id, eval);
        } else {
            self.stats.total_blocked += 1;
            self.captured.insert(eval.id, eval);
        }
    }

    fn remove(&mut self, id: &EvalId) -> Option<Evaluation> {
        let eval = self.captured.remove(id).or_else(|| self.escaped.remove(id))?;
        let job_key = (eval.namespace.clone(), eval.job_id.clone());
        if self.jobs.get(&job_key) == Some(id) {
            self.jobs.remove(&job_key);
        }
        Some(eval)
    }

    /// Capacity changed on `class` at `index`. Returns the evaluations to
    /// run again, no longer tracked.
    pub fn unblock(&mut self, class: &str, index: u64) -> Vec<Evaluation> {
        let seen = self.unblock_indexes.entry(class.to_string()).or_default();
        *seen = (*seen).max(index);

        let ids: Vec<EvalId> = self
            .escaped
            .keys()
            .copied()
            .chain(
                self.captured
                    .values()
                    .filter(|e| e.class_eligibility.get(class).copied().unwrap_or(true))
                    .map(|e| e.id),
            )
            .collect();

        let unblocked: Vec<Evaluation> = ids.iter().filter_map(|id| self.remove(id)).collect();
        if !unblocked.is_empty() {
            self.stats.total_unblocked += unblocked.len() as u64;
            debug!(class, index, count = unblocked.len(), "Unblocked evaluations");
        }
        unblocked
    }

    /// Stops tracking the job's blocked evaluation, returning it.
    pub fn untrack(&mut self, namespace: &str, job_id: &str) -> Option<Evaluation> {
        let id = self
            .jobs
            .get(&(namespace.to_string(), job_id.to_string()))
            .copied()?;
        self.remove(&id)
    }
}
