use std::path::PathBuf;

use anyhow::{Context, Result};
use convoy_structs::{SchedulerAlgorithm, SchedulerConfiguration};

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub num_workers: usize,
    pub cluster_file: Option<PathBuf>,
    pub exit_when_idle: bool,
    pub scheduler_algorithm: SchedulerAlgorithm,
    pub memory_oversubscription: bool,
    pub nack_delivery_limit: u32,
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let log_level = std::env::var("CONVOY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let default_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let num_workers = match std::env::var("CONVOY_NUM_WORKERS") {
            Ok(v) => v
                .parse()
                .with_context(|| format!("CONVOY_NUM_WORKERS: invalid value {v:?}"))?,
            Err(_) => default_workers,
        };

        let cluster_file = std::env::var("CONVOY_CLUSTER_FILE").ok().map(PathBuf::from);

        let exit_when_idle = env_flag("CONVOY_EXIT_WHEN_IDLE");

        let scheduler_algorithm = std::env::var("CONVOY_SCHEDULER_ALGORITHM")
            .unwrap_or_else(|_| "binpack".to_string())
            .parse()?;

        let memory_oversubscription = env_flag("CONVOY_MEMORY_OVERSUBSCRIPTION");

        let nack_delivery_limit = std::env::var("CONVOY_NACK_DELIVERY_LIMIT")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .context("CONVOY_NACK_DELIVERY_LIMIT")?;

        Ok(Self {
            log_level,
            num_workers: num_workers.max(1),
            cluster_file,
            exit_when_idle,
            scheduler_algorithm,
            memory_oversubscription,
            nack_delivery_limit,
        })
    }

    /// Cluster-scope scheduler settings seeded into the store at startup.
    pub fn scheduler_configuration(&self) -> SchedulerConfiguration {
        SchedulerConfiguration {
            scheduler_algorithm: self.scheduler_algorithm,
            memory_oversubscription_enabled: self.memory_oversubscription,
            ..Default::default()
        }
    }
}
