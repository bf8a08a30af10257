//! Node Inventory
//!
//! Process-local registry of cluster nodes, fed by a node watch. The
//! placement policy ranks the ready nodes it reports.

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Well-known label carrying a node's availability zone
pub const ZONE_LABEL: &str = "topology.kubernetes.io/zone";

// =============================================================================
// Node Info
// =============================================================================

/// Scheduling-relevant view of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Node name
    pub name: String,
    /// Node labels
    pub labels: BTreeMap<String, String>,
    /// Whether the node is Ready and schedulable
    pub ready: bool,
}

impl NodeInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
            ready: true,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Availability zone of the node
    pub fn zone(&self) -> Option<&str> {
        self.labels.get(ZONE_LABEL).map(String::as_str)
    }
}

impl From<&Node> for NodeInfo {
    fn from(node: &Node) -> Self {
        let unschedulable = node
            .spec
            .as_ref()
            .and_then(|s| s.unschedulable)
            .unwrap_or(false);
        let ready = node
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false);

        Self {
            name: node.name_any(),
            labels: node.labels().clone(),
            ready: ready && !unschedulable,
        }
    }
}

// =============================================================================
// Node Inventory
// =============================================================================

/// Registry of known nodes, kept in name order
#[derive(Debug, Default)]
pub struct NodeInventory {
    nodes: RwLock<BTreeMap<String, NodeInfo>>,
}

impl NodeInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a node
    pub fn upsert(&self, info: NodeInfo) {
        self.nodes.write().insert(info.name.clone(), info);
    }

    /// Remove a node
    pub fn remove(&self, name: &str) -> Option<NodeInfo> {
        self.nodes.write().remove(name)
    }

    /// Replace the whole inventory (watch restart)
    pub fn replace_all(&self, nodes: impl IntoIterator<Item = NodeInfo>) {
        let fresh: BTreeMap<String, NodeInfo> =
            nodes.into_iter().map(|n| (n.name.clone(), n)).collect();
        *self.nodes.write() = fresh;
    }

    /// Ready nodes in name order
    pub fn ready_nodes(&self) -> Vec<NodeInfo> {
        self.nodes
            .read()
            .values()
            .filter(|n| n.ready)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}
