//! Cluster-scope scheduler configuration.

use serde::{Deserialize, Serialize};

use crate::{JobType, NodePool, StructsError};

/// Node scoring strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerAlgorithm {
    #[default]
    Binpack,
    Spread,
}

impl std::str::FromStr for SchedulerAlgorithm {
    type Err = StructsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binpack" => Ok(SchedulerAlgorithm::Binpack),
            "spread" => Ok(SchedulerAlgorithm::Spread),
            other => Err(StructsError::InvalidJob(format!(
                "unknown scheduler algorithm {other:?}"
            ))),
        }
    }
}

/// Which job types may evict lower-priority work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreemptionConfig {
    #[serde(default = "crate::default_true")]
    pub system_scheduler_enabled: bool,
    #[serde(default)]
    pub sysbatch_scheduler_enabled: bool,
    #[serde(default)]
    pub batch_scheduler_enabled: bool,
    #[serde(default)]
    pub service_scheduler_enabled: bool,
}

impl Default for PreemptionConfig {
    fn default() -> Self {
        Self {
            system_scheduler_enabled: true,
            sysbatch_scheduler_enabled: false,
            batch_scheduler_enabled: false,
            service_scheduler_enabled: false,
        }
    }
}

impl PreemptionConfig {
    pub fn enabled_for(&self, job_type: JobType) -> bool {
        match job_type {
            JobType::System => self.system_scheduler_enabled,
            JobType::Sysbatch => self.sysbatch_scheduler_enabled,
            JobType::Batch => self.batch_scheduler_enabled,
            JobType::Service => self.service_scheduler_enabled,
        }
    }
}

/// Operator-tunable scheduler settings stored with cluster state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfiguration {
    #[serde(default)]
    pub scheduler_algorithm: SchedulerAlgorithm,
    #[serde(default)]
    pub preemption_config: PreemptionConfig,
    #[serde(default)]
    pub memory_oversubscription_enabled: bool,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl SchedulerConfiguration {
    /// Algorithm for a pool; a pool-level setting wins over the cluster one.
    pub fn effective_algorithm(&self, pool: Option<&NodePool>) -> SchedulerAlgorithm {
        pool.and_then(|p| p.scheduler_configuration.as_ref())
            .and_then(|c| c.scheduler_algorithm)
            .unwrap_or(self.scheduler_algorithm)
    }

    pub fn effective_memory_oversubscription(&self, pool: Option<&NodePool>) -> bool {
        pool.and_then(|p| p.scheduler_configuration.as_ref())
            .and_then(|c| c.memory_oversubscription_enabled)
            .unwrap_or(self.memory_oversubscription_enabled)
    }
}
