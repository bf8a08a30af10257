//! Replica Node Selection
//!
//! Produces a deterministic, ordered list of nodes a new replica of a volume
//! may be placed on, given the pods that use the volume.

use super::policy::PlacementPolicy;
use crate::registry::{NodeInfo, NodeInventory, RelationshipIndex};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// =============================================================================
// Node Selector
// =============================================================================

/// Ranks inventory nodes for replica placement
#[derive(Clone)]
pub struct NodeSelector {
    inventory: Arc<NodeInventory>,
    index: Arc<RelationshipIndex>,
    policy: PlacementPolicy,
}

impl NodeSelector {
    pub fn new(
        inventory: Arc<NodeInventory>,
        index: Arc<RelationshipIndex>,
        policy: PlacementPolicy,
    ) -> Self {
        Self {
            inventory,
            index,
            policy,
        }
    }

    /// Ready nodes that satisfy every pod's node selector, in policy order.
    ///
    /// Nodes already running one of the pods stay candidates.
    pub fn candidate_nodes(&self, pods: &[String]) -> Vec<String> {
        let placements: Vec<_> = pods
            .iter()
            .filter_map(|p| self.index.pod_placement(p))
            .collect();

        let eligible: Vec<NodeInfo> = self
            .inventory
            .ready_nodes()
            .into_iter()
            .filter(|n| placements.iter().all(|p| p.allows(&n.labels)))
            .collect();

        match self.policy {
            PlacementPolicy::Lexical => eligible.into_iter().map(|n| n.name).collect(),
            PlacementPolicy::SpreadZones => Self::spread_across_zones(eligible),
        }
    }

    /// At most `count` candidates, skipping the nodes in `exclude`
    pub fn select(
        &self,
        pods: &[String],
        exclude: &BTreeSet<String>,
        count: usize,
    ) -> Vec<String> {
        self.candidate_nodes(pods)
            .into_iter()
            .filter(|node| !exclude.contains(node))
            .take(count)
            .collect()
    }

    /// Round-robin across zones, zones and nodes in name order. Nodes without
    /// a zone label form a zone of their own.
    fn spread_across_zones(nodes: Vec<NodeInfo>) -> Vec<String> {
        let mut by_zone: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for node in nodes {
            let zone = node
                .zone()
                .map(str::to_string)
                .unwrap_or_else(|| node.name.clone());
            by_zone.entry(zone).or_default().push(node.name);
        }

        let total: usize = by_zone.values().map(Vec::len).sum();
        let mut queues: Vec<std::vec::IntoIter<String>> =
            by_zone.into_values().map(Vec::into_iter).collect();

        let mut ordered = Vec::with_capacity(total);
        while ordered.len() < total {
            for queue in queues.iter_mut() {
                if let Some(node) = queue.next() {
                    ordered.push(node);
                }
            }
        }
        ordered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{PodPlacement, ZONE_LABEL};

    fn inventory(nodes: &[(&str, &str)]) -> Arc<NodeInventory> {
        let inventory = Arc::new(NodeInventory::new());
        for (name, zone) in nodes {
            inventory.upsert(NodeInfo::new(*name).with_label(ZONE_LABEL, *zone));
        }
        inventory
    }

    #[test]
    fn test_lexical_order() {
        let selector = NodeSelector::new(
            inventory(&[("node-2", "a"), ("node-0", "a"), ("node-1", "b")]),
            Arc::new(RelationshipIndex::new()),
            PlacementPolicy::Lexical,
        );
        assert_eq!(selector.candidate_nodes(&[]), vec!["node-0", "node-1", "node-2"]);
        assert_eq!(selector.select(&[], &BTreeSet::new(), 2), vec!["node-0", "node-1"]);
    }

    #[test]
    fn test_spread_zones_round_robin() {
        let selector = NodeSelector::new(
            inventory(&[
                ("node-0", "a"),
                ("node-1", "a"),
                ("node-2", "b"),
                ("node-3", "c"),
                ("node-4", "c"),
            ]),
            Arc::new(RelationshipIndex::new()),
            PlacementPolicy::SpreadZones,
        );
        assert_eq!(
            selector.candidate_nodes(&[]),
            vec!["node-0", "node-2", "node-3", "node-1", "node-4"]
        );
    }

    #[test]
    fn test_pod_node_selector_filters_candidates() {
        let inventory = Arc::new(NodeInventory::new());
        inventory.upsert(NodeInfo::new("node-0").with_label("disktype", "ssd"));
        inventory.upsert(NodeInfo::new("node-1").with_label("disktype", "hdd"));
        inventory.upsert(NodeInfo::new("node-2").with_label("disktype", "ssd"));

        let index = Arc::new(RelationshipIndex::new());
        index.insert_pod(
            "default/web-0",
            BTreeSet::from(["default/data".to_string()]),
            PodPlacement {
                node_selector: BTreeMap::from([("disktype".to_string(), "ssd".to_string())]),
                node_name: Some("node-0".into()),
            },
        );

        let selector = NodeSelector::new(inventory, index, PlacementPolicy::Lexical);
        let pods = vec!["default/web-0".to_string()];
        // The pod's own node remains a candidate
        assert_eq!(selector.candidate_nodes(&pods), vec!["node-0", "node-2"]);
    }

    #[test]
    fn test_unready_nodes_excluded() {
        let inventory = inventory(&[("node-0", "a")]);
        let mut down = NodeInfo::new("node-1");
        down.ready = false;
        inventory.upsert(down);

        let selector = NodeSelector::new(
            inventory,
            Arc::new(RelationshipIndex::new()),
            PlacementPolicy::Lexical,
        );
        assert_eq!(selector.candidate_nodes(&[]), vec!["node-0"]);
        assert!(selector.select(&[], &BTreeSet::new(), 0).is_empty());
    }

    #[test]
    fn test_select_skips_excluded_nodes() {
        let selector = NodeSelector::new(
            inventory(&[("node-0", "a"), ("node-1", "a"), ("node-2", "b"), ("node-3", "b")]),
            Arc::new(RelationshipIndex::new()),
            PlacementPolicy::SpreadZones,
        );
        let occupied = BTreeSet::from(["node-0".to_string(), "node-2".to_string()]);

        assert_eq!(selector.select(&[], &occupied, 1), vec!["node-1"]);
        assert_eq!(selector.select(&[], &occupied, 5), vec!["node-1", "node-3"]);
    }
}
