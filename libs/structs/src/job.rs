//! Job specifications: the declared intent the scheduler converges toward.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Affinity, Constraint, NetworkResource, Resources, Spread, StructsError};

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_NODE_POOL: &str = "default";
pub const ALL_NODE_POOL: &str = "all";

pub const JOB_DEFAULT_PRIORITY: u8 = 50;
pub const JOB_MIN_PRIORITY: u8 = 1;
pub const JOB_MAX_PRIORITY: u8 = 100;

/// Kind of workload; selects the scheduler driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Service,
    Batch,
    System,
    Sysbatch,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Service => "service",
            JobType::Batch => "batch",
            JobType::System => "system",
            JobType::Sysbatch => "sysbatch",
        }
    }

    /// Batch-like jobs run to completion and keep successful terminal allocs.
    pub fn is_batch(&self) -> bool {
        matches!(self, JobType::Batch | JobType::Sysbatch)
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = StructsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "service" => Ok(JobType::Service),
            "batch" => Ok(JobType::Batch),
            "system" => Ok(JobType::System),
            "sysbatch" => Ok(JobType::Sysbatch),
            other => Err(StructsError::UnknownJobType(other.to_string())),
        }
    }
}

/// How deployments judge allocation health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckMode {
    #[default]
    Checks,
    TaskStates,
    Manual,
}

/// Rolling-update and canary behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStrategy {
    #[serde(default)]
    pub stagger: Duration,
    /// Zero disables deployments for the group.
    #[serde(default)]
    pub max_parallel: u32,
    #[serde(default)]
    pub health_check: HealthCheckMode,
    #[serde(default)]
    pub min_healthy_time: Duration,
    #[serde(default)]
    pub healthy_deadline: Duration,
    #[serde(default)]
    pub progress_deadline: Duration,
    #[serde(default)]
    pub auto_revert: bool,
    #[serde(default)]
    pub auto_promote: bool,
    #[serde(default)]
    pub canary: u32,
}

impl Default for UpdateStrategy {
    fn default() -> Self {
        Self {
            stagger: Duration::from_secs(30),
            max_parallel: 1,
            health_check: HealthCheckMode::Checks,
            min_healthy_time: Duration::from_secs(10),
            healthy_deadline: Duration::from_secs(5 * 60),
            progress_deadline: Duration::from_secs(10 * 60),
            auto_revert: false,
            auto_promote: false,
            canary: 0,
        }
    }
}

impl UpdateStrategy {
    pub fn is_empty(&self) -> bool {
        self.max_parallel == 0
    }
}

/// Growth function for the delay between reschedule attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayFunction {
    #[default]
    Constant,
    Linear,
    Exponential,
    Fibonacci,
}

/// Replacement policy for failed allocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReschedulePolicy {
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub interval: Duration,
    #[serde(default)]
    pub delay: Duration,
    #[serde(default)]
    pub delay_function: DelayFunction,
    #[serde(default)]
    pub max_delay: Duration,
    #[serde(default)]
    pub unlimited: bool,
}

impl ReschedulePolicy {
    pub fn service_default() -> Self {
        Self {
            attempts: 0,
            interval: Duration::ZERO,
            delay: Duration::from_secs(30),
            delay_function: DelayFunction::Exponential,
            max_delay: Duration::from_secs(60 * 60),
            unlimited: true,
        }
    }

    pub fn batch_default() -> Self {
        Self {
            attempts: 1,
            interval: Duration::from_secs(24 * 60 * 60),
            delay: Duration::from_secs(5),
            delay_function: DelayFunction::Constant,
            max_delay: Duration::ZERO,
            unlimited: false,
        }
    }

    pub fn enabled(&self) -> bool {
        self.unlimited || self.attempts > 0
    }
}

/// Limits for drain-driven migrations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateStrategy {
    pub max_parallel: u32,
    #[serde(default)]
    pub health_check: HealthCheckMode,
    #[serde(default)]
    pub min_healthy_time: Duration,
    #[serde(default)]
    pub healthy_deadline: Duration,
}

impl Default for MigrateStrategy {
    fn default() -> Self {
        Self {
            max_parallel: 1,
            health_check: HealthCheckMode::Checks,
            min_healthy_time: Duration::from_secs(10),
            healthy_deadline: Duration::from_secs(5 * 60),
        }
    }
}

/// Behaviour when an allocation's node stops heartbeating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectStrategy {
    /// How long an allocation may stay `unknown` before it is treated as lost.
    /// Zero disables the grace period.
    #[serde(default)]
    pub lost_after: Duration,
}

/// Scratch disk shared by a group's tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralDisk {
    #[serde(default)]
    pub sticky: bool,
    #[serde(default = "default_disk_mb")]
    pub size_mb: u64,
    #[serde(default)]
    pub migrate: bool,
}

fn default_disk_mb() -> u64 {
    300
}

impl Default for EphemeralDisk {
    fn default() -> Self {
        Self {
            sticky: false,
            size_mb: default_disk_mb(),
            migrate: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeKind {
    Host,
    Csi,
}

/// CSI access modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CsiAccessMode {
    SingleNodeReader,
    #[default]
    SingleNodeWriter,
    MultiNodeReader,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
}

/// A volume requested by a task group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: VolumeKind,
    pub source: String,
    #[serde(default)]
    pub read_only: bool,
    /// Replacements prefer the node (host) or volume claim (CSI) of the
    /// allocation they replace.
    #[serde(default)]
    pub sticky: bool,
    /// Each allocation `i` gets `source[i]`.
    #[serde(default)]
    pub per_alloc: bool,
    #[serde(default)]
    pub access_mode: CsiAccessMode,
}

impl VolumeRequest {
    /// Source identity for a given allocation name.
    pub fn source_for(&self, alloc_name: &str) -> String {
        if self.per_alloc {
            format!("{}{}", self.source, crate::alloc_suffix(alloc_name))
        } else {
            self.source.clone()
        }
    }
}

/// A unit of work inside a task group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub driver: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub affinities: Vec<Affinity>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

/// A set of tasks co-scheduled on one node, run `count` times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub name: String,
    pub count: u32,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub affinities: Vec<Affinity>,
    #[serde(default)]
    pub spreads: Vec<Spread>,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub ephemeral_disk: EphemeralDisk,
    #[serde(default)]
    pub networks: Vec<NetworkResource>,
    #[serde(default)]
    pub volumes: BTreeMap<String, VolumeRequest>,
    #[serde(default)]
    pub update: Option<UpdateStrategy>,
    #[serde(default)]
    pub reschedule_policy: Option<ReschedulePolicy>,
    #[serde(default)]
    pub migrate: Option<MigrateStrategy>,
    #[serde(default)]
    pub disconnect: Option<DisconnectStrategy>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl TaskGroup {
    pub fn lookup_task(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Update strategy if it enables deployments.
    pub fn update_strategy(&self) -> Option<&UpdateStrategy> {
        self.update.as_ref().filter(|u| !u.is_empty())
    }

    /// Grace period before an unreachable allocation is lost.
    pub fn lost_after(&self) -> Option<Duration> {
        self.disconnect
            .as_ref()
            .map(|d| d.lost_after)
            .filter(|d| !d.is_zero())
    }

    /// Whether replacements should prefer the previous node.
    pub fn is_sticky(&self) -> bool {
        self.ephemeral_disk.sticky || self.volumes.values().any(|v| v.sticky)
    }

    pub fn uses_cores(&self) -> bool {
        self.tasks.iter().any(|t| t.resources.cores > 0)
    }
}

/// Declared workload, immutable per version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_datacenters")]
    pub datacenters: Vec<String>,
    #[serde(default = "default_node_pool")]
    pub node_pool: String,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub affinities: Vec<Affinity>,
    #[serde(default)]
    pub spreads: Vec<Spread>,
    pub task_groups: Vec<TaskGroup>,
    /// Job-level default merged into groups by `canonicalize`.
    #[serde(default)]
    pub update: Option<UpdateStrategy>,
    #[serde(default)]
    pub stop: bool,
    #[serde(default)]
    pub stable: bool,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
    #[serde(default)]
    pub job_modify_index: u64,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_priority() -> u8 {
    JOB_DEFAULT_PRIORITY
}

fn default_datacenters() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_node_pool() -> String {
    DEFAULT_NODE_POOL.to_string()
}

impl Job {
    pub fn lookup_task_group(&self, name: &str) -> Option<&TaskGroup> {
        self.task_groups.iter().find(|tg| tg.name == name)
    }

    pub fn stopped(&self) -> bool {
        self.stop
    }

    /// Fills defaults that depend on the job type and propagates the
    /// job-level update strategy into groups that don't set one.
    pub fn canonicalize(&mut self) {
        if self.name.is_empty() {
            self.name = self.id.clone();
        }
        let job_update = self.update.clone();
        let allows_updates = matches!(self.job_type, JobType::Service | JobType::System);
        for tg in &mut self.task_groups {
            if tg.update.is_none() && allows_updates {
                tg.update = job_update.clone();
            }
            if tg.reschedule_policy.is_none() {
                tg.reschedule_policy = match self.job_type {
                    JobType::Service => Some(ReschedulePolicy::service_default()),
                    JobType::Batch => Some(ReschedulePolicy::batch_default()),
                    JobType::System | JobType::Sysbatch => None,
                };
            }
            if tg.migrate.is_none() && self.job_type == JobType::Service {
                tg.migrate = Some(MigrateStrategy::default());
            }
        }
    }

    /// Structural checks run before a job is admitted.
    pub fn validate(&self) -> Result<(), StructsError> {
        if self.id.is_empty() {
            return Err(StructsError::InvalidJob("missing job ID".into()));
        }
        if !(JOB_MIN_PRIORITY..=JOB_MAX_PRIORITY).contains(&self.priority) {
            return Err(StructsError::InvalidJob(format!(
                "priority {} outside {}..={}",
                self.priority, JOB_MIN_PRIORITY, JOB_MAX_PRIORITY
            )));
        }
        if self.task_groups.is_empty() {
            return Err(StructsError::InvalidJob("job has no task groups".into()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for tg in &self.task_groups {
            if !seen.insert(tg.name.as_str()) {
                return Err(StructsError::InvalidJob(format!(
                    "duplicate task group {:?}",
                    tg.name
                )));
            }
            if tg.tasks.is_empty() {
                return Err(StructsError::InvalidJob(format!(
                    "task group {:?} has no tasks",
                    tg.name
                )));
            }
            if let Some(policy) = &tg.reschedule_policy {
                if policy.attempts > 0 && !policy.unlimited && policy.interval.is_zero() {
                    return Err(StructsError::InvalidJob(format!(
                        "task group {:?}: limited reschedule policy needs an interval",
                        tg.name
                    )));
                }
            }
            if matches!(self.job_type, JobType::System | JobType::Sysbatch)
                && tg.update.as_ref().is_some_and(|u| u.canary > 0)
            {
                return Err(StructsError::InvalidJob(format!(
                    "task group {:?}: system jobs do not support canaries",
                    tg.name
                )));
            }
        }
        Ok(())
    }

    /// Whether `datacenter` is covered by the job's datacenter globs.
    pub fn targets_datacenter(&self, datacenter: &str) -> bool {
        self.datacenters
            .iter()
            .any(|pattern| glob_match(pattern, datacenter))
    }

    /// Whether the job may run in `pool`.
    pub fn targets_pool(&self, pool: &str) -> bool {
        self.node_pool == ALL_NODE_POOL || self.node_pool == pool
    }

    pub fn has_update_strategy(&self) -> bool {
        self.task_groups
            .iter()
            .any(|tg| tg.update_strategy().is_some())
    }
}

/// Minimal `*`-only glob, as used in datacenter lists.
fn glob_match(pattern: &str, value: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == value;
    }
    let mut rest = value;
    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            let Some(stripped) = rest.strip_prefix(part) else {
                return false;
            };
            rest = stripped;
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else if let Some(pos) = rest.find(part) {
            rest = &rest[pos + part.len()..];
        } else {
            return false;
        }
    }
    true
}
