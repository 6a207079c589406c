//! Evaluations: units of scheduling work.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use convoy_id::{DeploymentId, EvalId, NodeId};
use serde::{Deserialize, Serialize};

use crate::{AllocMetric, Job, JobType};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalStatus {
    #[default]
    Pending,
    Blocked,
    Complete,
    Failed,
    Cancelled,
}

impl EvalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvalStatus::Pending => "pending",
            EvalStatus::Blocked => "blocked",
            EvalStatus::Complete => "complete",
            EvalStatus::Failed => "failed",
            EvalStatus::Cancelled => "cancelled",
        }
    }
}

/// Why an evaluation was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvalTrigger {
    JobRegister,
    JobDeregister,
    NodeUpdate,
    NodeDrain,
    AllocStop,
    AllocFailure,
    RollingUpdate,
    DeploymentWatcher,
    RetryFailedAlloc,
    QueuedAllocs,
    Preemption,
    MaxDisconnectTimeout,
    ReconnectTimeout,
    #[serde(rename = "max-plan-attempts")]
    MaxPlans,
    #[serde(rename = "failed-eval-follow-up")]
    FailedFollowUp,
}

impl EvalTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvalTrigger::JobRegister => "job-register",
            EvalTrigger::JobDeregister => "job-deregister",
            EvalTrigger::NodeUpdate => "node-update",
            EvalTrigger::NodeDrain => "node-drain",
            EvalTrigger::AllocStop => "alloc-stop",
            EvalTrigger::AllocFailure => "alloc-failure",
            EvalTrigger::RollingUpdate => "rolling-update",
            EvalTrigger::DeploymentWatcher => "deployment-watcher",
            EvalTrigger::RetryFailedAlloc => "retry-failed-alloc",
            EvalTrigger::QueuedAllocs => "queued-allocs",
            EvalTrigger::Preemption => "preemption",
            EvalTrigger::MaxDisconnectTimeout => "max-disconnect-timeout",
            EvalTrigger::ReconnectTimeout => "reconnect-timeout",
            EvalTrigger::MaxPlans => "max-plan-attempts",
            EvalTrigger::FailedFollowUp => "failed-eval-follow-up",
        }
    }
}

impl std::fmt::Display for EvalTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const EVAL_DESC_BLOCKED: &str = "created to place remaining allocations";
pub const EVAL_DESC_RESCHEDULE_LATER: &str = "created for delayed rescheduling";
pub const EVAL_DESC_DISCONNECT_TIMEOUT: &str = "created for delayed disconnect timeout";
pub const EVAL_DESC_PREEMPTION: &str = "created after allocations were preempted";
pub const EVAL_DESC_SUPERSEDED: &str = "evaluation superseded by a newer one";
pub const EVAL_DESC_MAX_PLANS: &str = "maximum attempts reached";

/// A unit of scheduling work for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: EvalId,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub priority: u8,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub triggered_by: EvalTrigger,
    pub job_id: String,
    #[serde(default)]
    pub job_modify_index: u64,
    #[serde(default)]
    pub node_id: Option<NodeId>,
    #[serde(default)]
    pub node_modify_index: u64,
    #[serde(default)]
    pub deployment_id: Option<DeploymentId>,
    #[serde(default)]
    pub status: EvalStatus,
    #[serde(default)]
    pub status_description: String,
    /// Not dispatched before this instant.
    #[serde(default)]
    pub wait_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_eval: Option<EvalId>,
    #[serde(default)]
    pub previous_eval: Option<EvalId>,
    #[serde(default)]
    pub blocked_eval: Option<EvalId>,
    /// Computed node class -> whether it was feasible.
    #[serde(default)]
    pub class_eligibility: BTreeMap<String, bool>,
    /// Feasibility depended on per-node data, so class eligibility is incomplete.
    #[serde(default)]
    pub escaped_computed_class: bool,
    #[serde(default)]
    pub annotate_plan: bool,
    #[serde(default)]
    pub queued_allocations: BTreeMap<String, u32>,
    #[serde(default)]
    pub failed_tg_allocs: BTreeMap<String, AllocMetric>,
    /// State index the evaluation was last processed against.
    #[serde(default)]
    pub snapshot_index: u64,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
    #[serde(default = "Utc::now")]
    pub create_time: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub modify_time: DateTime<Utc>,
}

fn default_namespace() -> String {
    crate::DEFAULT_NAMESPACE.to_string()
}

impl Evaluation {
    /// Fresh pending evaluation for `job`.
    pub fn for_job(job: &Job, triggered_by: EvalTrigger, now: DateTime<Utc>) -> Self {
        Self {
            id: EvalId::new(),
            namespace: job.namespace.clone(),
            priority: job.priority,
            job_type: job.job_type,
            triggered_by,
            job_id: job.id.clone(),
            job_modify_index: job.modify_index,
            node_id: None,
            node_modify_index: 0,
            deployment_id: None,
            status: EvalStatus::Pending,
            status_description: String::new(),
            wait_until: None,
            next_eval: None,
            previous_eval: None,
            blocked_eval: None,
            class_eligibility: BTreeMap::new(),
            escaped_computed_class: false,
            annotate_plan: false,
            queued_allocations: BTreeMap::new(),
            failed_tg_allocs: BTreeMap::new(),
            snapshot_index: 0,
            create_index: 0,
            modify_index: 0,
            create_time: now,
            modify_time: now,
        }
    }

    pub fn terminal_status(&self) -> bool {
        matches!(
            self.status,
            EvalStatus::Complete | EvalStatus::Failed | EvalStatus::Cancelled
        )
    }

    /// Whether the evaluation belongs in the broker.
    pub fn should_enqueue(&self) -> bool {
        self.status == EvalStatus::Pending
    }

    /// Whether the evaluation belongs in the blocked tracker.
    pub fn should_block(&self) -> bool {
        self.status == EvalStatus::Blocked
    }

    fn successor(&self, triggered_by: EvalTrigger, now: DateTime<Utc>) -> Self {
        Self {
            id: EvalId::new(),
            triggered_by,
            previous_eval: Some(self.id),
            status: EvalStatus::Pending,
            status_description: String::new(),
            wait_until: None,
            next_eval: None,
            blocked_eval: None,
            node_id: None,
            node_modify_index: 0,
            class_eligibility: BTreeMap::new(),
            escaped_computed_class: false,
            annotate_plan: false,
            queued_allocations: BTreeMap::new(),
            failed_tg_allocs: BTreeMap::new(),
            snapshot_index: 0,
            create_index: 0,
            modify_index: 0,
            create_time: now,
            modify_time: now,
            ..self.clone()
        }
    }

    /// Blocked successor carrying the class eligibility found by this run.
    pub fn create_blocked_eval(
        &self,
        class_eligibility: BTreeMap<String, bool>,
        escaped: bool,
        failed_tg_allocs: BTreeMap<String, AllocMetric>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut eval = self.successor(EvalTrigger::QueuedAllocs, now);
        eval.status = EvalStatus::Blocked;
        eval.status_description = EVAL_DESC_BLOCKED.to_string();
        eval.class_eligibility = class_eligibility;
        eval.escaped_computed_class = escaped;
        eval.failed_tg_allocs = failed_tg_allocs;
        eval
    }

    /// Pending successor of a blocked evaluation once capacity changed.
    /// Priority, trigger and job carry over.
    pub fn create_unblocked_eval(&self, now: DateTime<Utc>) -> Self {
        self.successor(self.triggered_by, now)
    }

    /// Delayed successor dispatched at `wait_until`.
    pub fn create_delayed_eval(
        &self,
        triggered_by: EvalTrigger,
        wait_until: DateTime<Utc>,
        description: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let mut eval = self.successor(triggered_by, now);
        eval.wait_until = Some(wait_until);
        eval.status_description = description.to_string();
        eval
    }
}
