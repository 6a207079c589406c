//! CSI volumes and their claims.

use std::collections::BTreeMap;

use convoy_id::{AllocId, NodeId};
use serde::{Deserialize, Serialize};

use crate::CsiAccessMode;

/// A registered CSI volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsiVolume {
    pub id: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub plugin_id: String,
    #[serde(default)]
    pub access_mode: CsiAccessMode,
    /// Segments the volume is reachable from. Empty means everywhere.
    #[serde(default)]
    pub topologies: Vec<BTreeMap<String, String>>,
    #[serde(default = "crate::default_true")]
    pub schedulable: bool,
    #[serde(default)]
    pub read_claims: BTreeMap<AllocId, NodeId>,
    #[serde(default)]
    pub write_claims: BTreeMap<AllocId, NodeId>,
}

fn default_namespace() -> String {
    crate::DEFAULT_NAMESPACE.to_string()
}

impl CsiVolume {
    /// Whether any segment in `topologies` is fully satisfied by `segments`.
    pub fn reachable_from(&self, segments: &BTreeMap<String, String>) -> bool {
        self.topologies.is_empty()
            || self
                .topologies
                .iter()
                .any(|topo| topo.iter().all(|(k, v)| segments.get(k) == Some(v)))
    }

    /// Whether a new claim of the given kind can be granted. Claims held by
    /// `ignore` (typically the allocation being replaced) don't count.
    pub fn claimable(&self, read_only: bool, ignore: Option<AllocId>) -> bool {
        let others = |claims: &BTreeMap<AllocId, NodeId>| {
            claims.keys().filter(|id| Some(**id) != ignore).count()
        };
        match self.access_mode {
            CsiAccessMode::SingleNodeReader => {
                read_only && others(&self.write_claims) == 0 && self.claims_on_one_node(ignore)
            }
            CsiAccessMode::SingleNodeWriter => {
                others(&self.write_claims) == 0 && (read_only || others(&self.read_claims) == 0)
            }
            CsiAccessMode::MultiNodeReader => read_only,
            CsiAccessMode::MultiNodeSingleWriter => read_only || others(&self.write_claims) == 0,
            CsiAccessMode::MultiNodeMultiWriter => true,
        }
    }

    fn claims_on_one_node(&self, ignore: Option<AllocId>) -> bool {
        let mut nodes = self
            .read_claims
            .iter()
            .filter(|(id, _)| Some(**id) != ignore)
            .map(|(_, node)| node);
        match nodes.next() {
            None => true,
            Some(first) => nodes.all(|n| n == first),
        }
    }

    /// Nodes currently holding a claim on the volume.
    pub fn claimed_nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.read_claims.values().chain(self.write_claims.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock;

    #[test]
    fn test_single_writer_claims() {
        let mut vol = mock::csi_volume("data", "ebs");
        assert!(vol.claimable(false, None));

        let holder = AllocId::new();
        vol.write_claims.insert(holder, NodeId::new());
        assert!(!vol.claimable(false, None));
        assert!(vol.claimable(false, Some(holder)));
    }

    #[test]
    fn test_topology_match() {
        let mut vol = mock::csi_volume("data", "ebs");
        vol.topologies = vec![BTreeMap::from([("zone".to_string(), "a".to_string())])];

        let zone_a = BTreeMap::from([("zone".to_string(), "a".to_string())]);
        let zone_b = BTreeMap::from([("zone".to_string(), "b".to_string())]);
        assert!(vol.reachable_from(&zone_a));
        assert!(!vol.reachable_from(&zone_b));
    }
}
