//! JSON cluster fixtures for the binary and tests.

use std::path::Path;

use convoy_structs::{Evaluation, Job, Node, NodePool, SchedulerConfiguration};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::server::Server;

/// Nodes, pools and jobs to seed a cluster with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterFixture {
    #[serde(default)]
    pub scheduler_config: Option<SchedulerConfiguration>,
    #[serde(default)]
    pub node_pools: Vec<NodePool>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub jobs: Vec<Job>,
}

impl ClusterFixture {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Loads the fixture into `server`: nodes first, then one registration
    /// evaluation per job.
    pub fn apply(self, server: &Server) -> Result<Vec<Evaluation>> {
        if let Some(config) = self.scheduler_config {
            server.store().set_scheduler_config(config);
        }
        for pool in self.node_pools {
            server.store().upsert_node_pool(pool);
        }
        let node_count = self.nodes.len();
        for node in self.nodes {
            server.store().upsert_node(node);
        }

        let mut evals = Vec::with_capacity(self.jobs.len());
        for job in self.jobs {
            evals.push(server.register_job(job)?);
        }
        info!(nodes = node_count, jobs = evals.len(), "Cluster fixture loaded");
        Ok(evals)
    }
}
