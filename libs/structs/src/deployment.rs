//! Rollout tracking for a job version.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use convoy_id::{AllocId, DeploymentId};
use serde::{Deserialize, Serialize};

use crate::Job;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    #[default]
    Running,
    Paused,
    Successful,
    Failed,
    Cancelled,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Running => "running",
            DeploymentStatus::Paused => "paused",
            DeploymentStatus::Successful => "successful",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Cancelled => "cancelled",
        }
    }
}

pub const DEPLOYMENT_DESC_RUNNING: &str = "Deployment is running";
pub const DEPLOYMENT_DESC_RUNNING_NEEDS_PROMOTION: &str =
    "Deployment is running but requires manual promotion";
pub const DEPLOYMENT_DESC_RUNNING_AUTO_PROMOTION: &str =
    "Deployment is running pending automatic promotion";
pub const DEPLOYMENT_DESC_SUCCESSFUL: &str = "Deployment completed successfully";
pub const DEPLOYMENT_DESC_STOPPED_JOB: &str = "Cancelled because job is stopped";
pub const DEPLOYMENT_DESC_NEWER_JOB: &str = "Cancelled due to newer version of job";

/// Per-group rollout progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentState {
    #[serde(default)]
    pub auto_revert: bool,
    #[serde(default)]
    pub auto_promote: bool,
    #[serde(default)]
    pub promoted: bool,
    #[serde(default)]
    pub placed_canaries: Vec<AllocId>,
    #[serde(default)]
    pub desired_canaries: u32,
    #[serde(default)]
    pub desired_total: u32,
    #[serde(default)]
    pub placed_allocs: u32,
    #[serde(default)]
    pub healthy_allocs: u32,
    #[serde(default)]
    pub unhealthy_allocs: u32,
    #[serde(default)]
    pub progress_deadline: Duration,
    #[serde(default)]
    pub require_progress_by: Option<DateTime<Utc>>,
}

impl DeploymentState {
    /// Canaries are placed but not yet promoted.
    pub fn awaiting_promotion(&self) -> bool {
        self.desired_canaries > 0 && !self.promoted
    }
}

/// A rolling update of one job version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub job_id: String,
    pub job_version: u64,
    pub job_modify_index: u64,
    pub job_create_index: u64,
    #[serde(default)]
    pub task_groups: BTreeMap<String, DeploymentState>,
    #[serde(default)]
    pub status: DeploymentStatus,
    #[serde(default)]
    pub status_description: String,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

fn default_namespace() -> String {
    crate::DEFAULT_NAMESPACE.to_string()
}

impl Deployment {
    pub fn new(job: &Job) -> Self {
        Self {
            id: DeploymentId::new(),
            namespace: job.namespace.clone(),
            job_id: job.id.clone(),
            job_version: job.version,
            job_modify_index: job.modify_index,
            job_create_index: job.create_index,
            task_groups: BTreeMap::new(),
            status: DeploymentStatus::Running,
            status_description: DEPLOYMENT_DESC_RUNNING.to_string(),
            create_index: 0,
            modify_index: 0,
        }
    }

    /// Running or paused deployments still govern placements.
    pub fn active(&self) -> bool {
        matches!(
            self.status,
            DeploymentStatus::Running | DeploymentStatus::Paused
        )
    }

    pub fn has_placed_canaries(&self) -> bool {
        self.task_groups.values().any(|s| !s.placed_canaries.is_empty())
    }

    pub fn requires_promotion(&self) -> bool {
        self.task_groups.values().any(DeploymentState::awaiting_promotion)
    }

    pub fn has_auto_promote(&self) -> bool {
        let mut any = false;
        for state in self.task_groups.values().filter(|s| s.desired_canaries > 0) {
            if !state.auto_promote {
                return false;
            }
            any = true;
        }
        any
    }

    /// Whether the deployment was built for this exact job version.
    pub fn matches_job(&self, job: &Job) -> bool {
        self.job_id == job.id
            && self.job_version == job.version
            && self.job_create_index == job.create_index
    }
}

/// Status change for an existing deployment, applied with a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStatusUpdate {
    pub deployment_id: DeploymentId,
    pub status: DeploymentStatus,
    pub status_description: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock;

    #[test]
    fn test_auto_promote_needs_every_canary_group() {
        let job = mock::job();
        let mut d = Deployment::new(&job);
        d.task_groups.insert(
            "a".into(),
            DeploymentState {
                desired_canaries: 1,
                auto_promote: true,
                ..Default::default()
            },
        );
        assert!(d.has_auto_promote());
        assert!(d.requires_promotion());

        d.task_groups.insert(
            "b".into(),
            DeploymentState {
                desired_canaries: 2,
                auto_promote: false,
                ..Default::default()
            },
        );
        assert!(!d.has_auto_promote());
    }

    #[test]
    fn test_new_deployment_tracks_job_version() {
        let mut job = mock::job();
        job.version = 4;
        let d = Deployment::new(&job);
        assert!(d.active());
        assert!(d.matches_job(&job));
        job.version = 5;
        assert!(!d.matches_job(&job));
    }
}
