//! Allocations: one task group instance bound to one node.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use convoy_id::{AllocId, DeploymentId, EvalId, NodeId};
use serde::{Deserialize, Serialize};

use crate::{AllocMetric, AllocatedResources, ComparableResources, Job, StructsError, TaskGroup};

/// What the servers want the allocation to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocDesiredStatus {
    #[default]
    Run,
    Stop,
    Evict,
}

/// What the node reports the allocation is doing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocClientStatus {
    #[default]
    Pending,
    Running,
    Complete,
    Failed,
    Lost,
    Unknown,
}

impl AllocClientStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AllocClientStatus::Complete | AllocClientStatus::Failed | AllocClientStatus::Lost
        )
    }
}

// Descriptions the scheduler attaches to desired-status changes.
pub const ALLOC_NOT_NEEDED: &str = "alloc not needed due to job update";
pub const ALLOC_MIGRATING: &str = "alloc is being migrated";
pub const ALLOC_UPDATING: &str = "alloc is being updated due to job update";
pub const ALLOC_LOST: &str = "alloc is lost since its node is down";
pub const ALLOC_UNKNOWN: &str = "alloc is unknown since its node is disconnected";
pub const ALLOC_RESCHEDULED: &str = "alloc was rescheduled because it failed";
pub const ALLOC_CANARY: &str = "alloc is a canary that was stopped";
pub const ALLOC_NODE_TAINTED: &str = "alloc not needed as node is tainted";
pub const ALLOC_JOB_STOPPED: &str = "alloc not needed since job was stopped";
pub const ALLOC_PREEMPTED: &str = "alloc preempted by a higher priority allocation";
pub const ALLOC_RECONNECTED: &str = "alloc reconnected after its node came back";

/// Operator- or drainer-requested transitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredTransition {
    #[serde(default)]
    pub migrate: bool,
    #[serde(default)]
    pub reschedule: bool,
    #[serde(default)]
    pub force_reschedule: bool,
}

/// One past replacement of a failed allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RescheduleEvent {
    pub reschedule_time: DateTime<Utc>,
    pub prev_alloc_id: AllocId,
    pub prev_node_id: NodeId,
    pub delay: Duration,
}

/// Bounded history of replacements along a replacement chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RescheduleTracker {
    #[serde(default)]
    pub events: Vec<RescheduleEvent>,
}

/// Deployment-related health of an allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocDeploymentStatus {
    /// `None` until the health watcher decides.
    #[serde(default)]
    pub healthy: Option<bool>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub canary: bool,
    #[serde(default)]
    pub modify_index: u64,
}

impl AllocDeploymentStatus {
    pub fn is_healthy(&self) -> bool {
        self.healthy == Some(true)
    }

    pub fn is_unhealthy(&self) -> bool {
        self.healthy == Some(false)
    }
}

/// A client-status transition, kept to time disconnects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocStateEvent {
    pub client_status: AllocClientStatus,
    pub time: DateTime<Utc>,
}

/// Placement of one task group instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocId,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub eval_id: EvalId,
    /// `{job}.{group}[{index}]`.
    pub name: String,
    pub node_id: NodeId,
    #[serde(default)]
    pub node_name: String,
    pub job_id: String,
    /// Job version the allocation runs. Absent on legacy records.
    #[serde(default)]
    pub job: Option<Arc<Job>>,
    pub task_group: String,
    #[serde(default)]
    pub allocated_resources: AllocatedResources,
    #[serde(default)]
    pub metrics: Option<AllocMetric>,
    #[serde(default)]
    pub desired_status: AllocDesiredStatus,
    #[serde(default)]
    pub desired_description: String,
    #[serde(default)]
    pub desired_transition: DesiredTransition,
    #[serde(default)]
    pub client_status: AllocClientStatus,
    #[serde(default)]
    pub client_description: String,
    #[serde(default)]
    pub deployment_id: Option<DeploymentId>,
    #[serde(default)]
    pub deployment_status: Option<AllocDeploymentStatus>,
    #[serde(default)]
    pub reschedule_tracker: Option<RescheduleTracker>,
    #[serde(default)]
    pub followup_eval_id: Option<EvalId>,
    #[serde(default)]
    pub previous_allocation: Option<AllocId>,
    #[serde(default)]
    pub next_allocation: Option<AllocId>,
    #[serde(default)]
    pub preempted_allocations: Vec<AllocId>,
    #[serde(default)]
    pub preempted_by_allocation: Option<AllocId>,
    #[serde(default)]
    pub alloc_states: Vec<AllocStateEvent>,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
    #[serde(default)]
    pub alloc_modify_index: u64,
    #[serde(default = "Utc::now")]
    pub create_time: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub modify_time: DateTime<Utc>,
}

fn default_namespace() -> String {
    crate::DEFAULT_NAMESPACE.to_string()
}

impl Allocation {
    /// Terminal from either the server's or the client's point of view.
    pub fn terminal_status(&self) -> bool {
        self.server_terminal_status() || self.client_terminal_status()
    }

    pub fn server_terminal_status(&self) -> bool {
        matches!(
            self.desired_status,
            AllocDesiredStatus::Stop | AllocDesiredStatus::Evict
        )
    }

    pub fn client_terminal_status(&self) -> bool {
        self.client_status.is_terminal()
    }

    pub fn ran_successfully(&self) -> bool {
        self.client_status == AllocClientStatus::Complete
    }

    /// Index parsed from the name suffix, if the name is well formed.
    pub fn index(&self) -> Option<u32> {
        alloc_index(&self.name)
    }

    pub fn job_version(&self) -> u64 {
        self.job.as_ref().map_or(0, |j| j.version)
    }

    pub fn job_priority(&self) -> u8 {
        self.job
            .as_ref()
            .map_or(crate::JOB_DEFAULT_PRIORITY, |j| j.priority)
    }

    /// The allocation's task group in its own job version.
    pub fn task_group_spec(&self) -> Option<&TaskGroup> {
        self.job.as_ref()?.lookup_task_group(&self.task_group)
    }

    pub fn comparable_resources(&self) -> ComparableResources {
        self.allocated_resources.comparable()
    }

    pub fn is_canary(&self) -> bool {
        self.deployment_status.as_ref().is_some_and(|s| s.canary)
    }

    pub fn is_healthy(&self) -> bool {
        self.deployment_status
            .as_ref()
            .is_some_and(AllocDeploymentStatus::is_healthy)
    }

    pub fn is_unhealthy(&self) -> bool {
        self.deployment_status
            .as_ref()
            .is_some_and(AllocDeploymentStatus::is_unhealthy)
    }

    pub fn reschedule_events(&self) -> &[RescheduleEvent] {
        self.reschedule_tracker
            .as_ref()
            .map_or(&[], |t| t.events.as_slice())
    }

    /// Time the allocation last changed client status to `unknown`.
    pub fn last_unknown(&self) -> Option<DateTime<Utc>> {
        self.alloc_states
            .iter()
            .rev()
            .find(|s| s.client_status == AllocClientStatus::Unknown)
            .map(|s| s.time)
    }

    /// Whether an `unknown` allocation has outlived its disconnect grace
    /// period. Allocations in any other state never expire.
    pub fn disconnect_expired(&self, now: DateTime<Utc>) -> bool {
        if self.client_status != AllocClientStatus::Unknown {
            return false;
        }
        let (Some(lost_after), Some(since)) = (
            self.task_group_spec().and_then(TaskGroup::lost_after),
            self.last_unknown(),
        ) else {
            return false;
        };
        chrono::Duration::from_std(lost_after)
            .ok()
            .and_then(|grace| since.checked_add_signed(grace))
            .is_some_and(|deadline| deadline <= now)
    }

    /// The last client status the servers recorded is `unknown`, so the
    /// allocation has not been seen reconnecting yet.
    pub fn needs_to_reconnect(&self) -> bool {
        self.alloc_states
            .last()
            .is_some_and(|s| s.client_status == AllocClientStatus::Unknown)
    }

    /// Time at which a disconnected allocation becomes lost.
    pub fn disconnect_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let lost_after = self
            .task_group_spec()
            .and_then(TaskGroup::lost_after)
            .unwrap_or_default();
        let since = self.last_unknown().unwrap_or(now);
        chrono::Duration::from_std(lost_after)
            .ok()
            .and_then(|grace| since.checked_add_signed(grace))
            .unwrap_or(since)
    }

    /// Copy carrying only what a plan needs to record a state change.
    pub fn stub_for_update(&self) -> Allocation {
        let mut stub = self.clone();
        stub.metrics = None;
        stub
    }
}

/// Canonical allocation name.
pub fn alloc_name(job_id: &str, group: &str, index: u32) -> String {
    format!("{job_id}.{group}[{index}]")
}

/// Index from a `...[n]` name.
pub fn alloc_index(name: &str) -> Option<u32> {
    let open = name.rfind('[')?;
    let close = name.rfind(']')?;
    if close <= open + 1 {
        return None;
    }
    name[open + 1..close].parse().ok()
}

/// The `[n]` suffix of an allocation name, or an empty string.
pub fn alloc_suffix(name: &str) -> &str {
    name.rfind('[').map_or("", |open| &name[open..])
}

/// Splits a canonical name into `(job, group, index)`.
pub fn parse_alloc_name(name: &str) -> Result<(&str, &str, u32), StructsError> {
    let bad = || StructsError::InvalidAllocName(name.to_string());
    let index = alloc_index(name).ok_or_else(bad)?;
    let open = name.rfind('[').ok_or_else(bad)?;
    let (job, group) = name[..open].rsplit_once('.').ok_or_else(bad)?;
    Ok((job, group, index))
}
