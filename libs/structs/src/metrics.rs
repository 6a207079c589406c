//! Placement diagnostics.

use std::collections::BTreeMap;
use std::time::Duration;

use convoy_id::NodeId;
use serde::{Deserialize, Serialize};

use crate::Node;

/// How many scored nodes are kept per placement.
pub const MAX_RETAINED_NODE_SCORES: usize = 5;

/// Score breakdown for one candidate node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeScoreMeta {
    pub node_id: NodeId,
    pub scores: BTreeMap<String, f64>,
    pub norm_score: f64,
}

/// Diagnostics for one placement attempt or one failed task group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocMetric {
    pub nodes_evaluated: u32,
    pub nodes_filtered: u32,
    pub nodes_in_pool: u32,
    /// Datacenter -> ready nodes considered.
    #[serde(default)]
    pub nodes_available: BTreeMap<String, u32>,
    #[serde(default)]
    pub class_filtered: BTreeMap<String, u32>,
    #[serde(default)]
    pub constraint_filtered: BTreeMap<String, u32>,
    pub nodes_exhausted: u32,
    #[serde(default)]
    pub class_exhausted: BTreeMap<String, u32>,
    #[serde(default)]
    pub dimension_exhausted: BTreeMap<String, u32>,
    #[serde(default)]
    pub score_meta_data: Vec<NodeScoreMeta>,
    #[serde(default)]
    pub allocation_time: Duration,
    /// Further placements of the same group that failed the same way.
    pub coalesced_failures: u32,
    #[serde(skip)]
    pending_scores: BTreeMap<NodeId, NodeScoreMeta>,
}

impl AllocMetric {
    pub fn evaluate_node(&mut self) {
        self.nodes_evaluated += 1;
    }

    pub fn filter_node(&mut self, node: &Node, reason: &str) {
        self.nodes_filtered += 1;
        if !node.node_class.is_empty() {
            *self.class_filtered.entry(node.node_class.clone()).or_default() += 1;
        }
        if !reason.is_empty() {
            *self.constraint_filtered.entry(reason.to_string()).or_default() += 1;
        }
    }

    pub fn exhausted_node(&mut self, node: &Node, dimension: &str) {
        self.nodes_exhausted += 1;
        if !node.node_class.is_empty() {
            *self.class_exhausted.entry(node.node_class.clone()).or_default() += 1;
        }
        if !dimension.is_empty() {
            *self.dimension_exhausted.entry(dimension.to_string()).or_default() += 1;
        }
    }

    /// Records one score component for a node.
    pub fn score_node(&mut self, node: &Node, name: &str, score: f64) {
        self.pending_scores
            .entry(node.id)
            .or_insert_with(|| NodeScoreMeta {
                node_id: node.id,
                scores: BTreeMap::new(),
                norm_score: 0.0,
            })
            .scores
            .insert(name.to_string(), score);
    }

    pub fn norm_score_node(&mut self, node: &Node, score: f64) {
        if let Some(meta) = self.pending_scores.get_mut(&node.id) {
            meta.norm_score = score;
        }
    }

    /// Keeps the top scored nodes, highest first.
    pub fn populate_score_meta_data(&mut self) {
        let mut all: Vec<NodeScoreMeta> = std::mem::take(&mut self.pending_scores)
            .into_values()
            .collect();
        all.sort_by(|a, b| {
            b.norm_score
                .total_cmp(&a.norm_score)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        all.truncate(MAX_RETAINED_NODE_SCORES);
        self.score_meta_data = all;
    }

    /// Whether no node was even considered.
    pub fn no_nodes(&self) -> bool {
        self.nodes_evaluated == 0
    }
}
