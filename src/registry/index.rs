//! Shared Relationship Index
//!
//! Concurrency-safe bidirectional maps linking pods, claims and volumes. The
//! index is rebuilt from watches and never authoritative; it answers "which
//! pods use volume V" and "where may pod P be scheduled" for replica
//! placement.
//!
//! Keys for pods and claims are `namespace/name`.

use super::locks::LockRegistry;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

/// Build a `namespace/name` key
pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

// =============================================================================
// Pod Placement
// =============================================================================

/// Scheduling constraints of a pod relevant to replica placement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodPlacement {
    /// Node labels the pod requires
    pub node_selector: BTreeMap<String, String>,
    /// Node the pod is bound to, if scheduled
    pub node_name: Option<String>,
}

impl PodPlacement {
    /// Whether a node with `labels` satisfies the pod's node selector
    pub fn allows(&self, labels: &BTreeMap<String, String>) -> bool {
        self.node_selector
            .iter()
            .all(|(k, v)| labels.get(k).map(|l| l == v).unwrap_or(false))
    }
}

// =============================================================================
// Relationship Index
// =============================================================================

/// Pod, claim and volume relationships
#[derive(Debug, Default)]
pub struct RelationshipIndex {
    pod_to_claims: DashMap<String, BTreeSet<String>>,
    claim_to_pods: DashMap<String, BTreeSet<String>>,
    volume_to_claim: DashMap<String, String>,
    pod_placements: DashMap<String, PodPlacement>,
    pod_locks: LockRegistry,
}

impl RelationshipIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a pod by the claims its volumes reference. Pods without claims
    /// are ignored.
    pub fn add_pod(&self, pod: &Pod) {
        let namespace = pod.namespace().unwrap_or_default();
        let key = object_key(&namespace, &pod.name_any());

        let spec = match &pod.spec {
            Some(spec) => spec,
            None => return,
        };

        let claims: BTreeSet<String> = spec
            .volumes
            .iter()
            .flatten()
            .filter_map(|v| v.persistent_volume_claim.as_ref())
            .map(|c| object_key(&namespace, &c.claim_name))
            .collect();

        let placement = PodPlacement {
            node_selector: spec.node_selector.clone().unwrap_or_default(),
            node_name: spec.node_name.clone(),
        };

        self.insert_pod(&key, claims, placement);
    }

    /// Index a pod by key. Re-inserting a pod replaces its claims.
    pub fn insert_pod(&self, key: &str, claims: BTreeSet<String>, placement: PodPlacement) {
        if claims.is_empty() {
            return;
        }

        let previous = self.pod_to_claims.insert(key.to_string(), claims.clone());
        for stale in previous.iter().flatten().filter(|c| !claims.contains(*c)) {
            self.unlink_claim(stale, key);
        }

        for claim in &claims {
            self.claim_to_pods
                .entry(claim.clone())
                .or_default()
                .insert(key.to_string());
        }
        self.pod_placements.insert(key.to_string(), placement);
    }

    /// Remove a pod once it is torn down. Waits for the pod's lock so an
    /// in-flight replica placement finishes first.
    pub async fn remove_pod(&self, key: &str) {
        let guard = self.pod_locks.lock(key).await;

        if let Some((_, claims)) = self.pod_to_claims.remove(key) {
            for claim in &claims {
                self.unlink_claim(claim, key);
            }
        }
        self.pod_placements.remove(key);

        drop(guard);
        self.pod_locks.remove(key);
        debug!("Removed pod {} from relationship index", key);
    }

    fn unlink_claim(&self, claim: &str, pod: &str) {
        let now_empty = match self.claim_to_pods.get_mut(claim) {
            Some(mut pods) => {
                pods.remove(pod);
                pods.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.claim_to_pods.remove_if(claim, |_, pods| pods.is_empty());
        }
    }

    /// Associate a volume with the claim bound to it
    pub fn add_volume(&self, volume: &str, claim: &str) {
        self.volume_to_claim
            .insert(volume.to_string(), claim.to_string());
    }

    /// Drop a volume's association
    pub fn remove_volume(&self, volume: &str) {
        self.volume_to_claim.remove(volume);
    }

    /// Claim bound to `volume`
    pub fn claim_for_volume(&self, volume: &str) -> Option<String> {
        self.volume_to_claim.get(volume).map(|c| c.clone())
    }

    /// Pods using `volume` through its claim, in key order
    pub fn pods_for_volume(&self, volume: &str) -> Vec<String> {
        let claim = match self.claim_for_volume(volume) {
            Some(claim) => claim,
            None => return Vec::new(),
        };
        self.claim_to_pods
            .get(&claim)
            .map(|pods| pods.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Placement constraints of a pod
    pub fn pod_placement(&self, pod: &str) -> Option<PodPlacement> {
        self.pod_placements.get(pod).map(|p| p.clone())
    }

    /// Wait for exclusive access to a pod's placement
    pub async fn pod_lock(&self, pod: &str) -> OwnedMutexGuard<()> {
        self.pod_locks.lock(pod).await
    }

    /// Number of indexed pods
    pub fn pod_count(&self) -> usize {
        self.pod_to_claims.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimVolumeSource, PodSpec, Volume};

    fn pod(namespace: &str, name: &str, claims: &[&str]) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.namespace = Some(namespace.to_string());
        pod.spec = Some(PodSpec {
            volumes: Some(
                claims
                    .iter()
                    .map(|c| Volume {
                        name: format!("vol-{}", c),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: c.to_string(),
                            read_only: None,
                        }),
                        ..Default::default()
                    })
                    .collect(),
            ),
            node_selector: Some(BTreeMap::from([("disktype".to_string(), "ssd".to_string())])),
            ..Default::default()
        });
        pod
    }

    #[test]
    fn test_pods_for_volume() {
        let index = RelationshipIndex::new();
        index.add_pod(&pod("default", "web-0", &["data-0"]));
        index.add_pod(&pod("default", "web-1", &["data-0", "logs"]));
        index.add_pod(&pod("other", "web-0", &["data-0"]));
        index.add_volume("pv-0", "default/data-0");

        assert_eq!(
            index.pods_for_volume("pv-0"),
            vec!["default/web-0".to_string(), "default/web-1".to_string()]
        );
        assert!(index.pods_for_volume("pv-unknown").is_empty());
        assert_eq!(index.claim_for_volume("pv-0").as_deref(), Some("default/data-0"));

        let placement = index.pod_placement("default/web-0").unwrap();
        assert_eq!(placement.node_selector.get("disktype").map(String::as_str), Some("ssd"));
    }

    #[test]
    fn test_pods_without_claims_are_ignored() {
        let index = RelationshipIndex::new();
        index.add_pod(&pod("default", "stateless", &[]));
        assert_eq!(index.pod_count(), 0);
        assert!(index.pod_placement("default/stateless").is_none());
    }

    #[test]
    fn test_reinsert_replaces_claims() {
        let index = RelationshipIndex::new();
        index.add_volume("pv-0", "default/a");
        index.add_volume("pv-1", "default/b");

        index.insert_pod("default/p", BTreeSet::from(["default/a".to_string()]), PodPlacement::default());
        index.insert_pod("default/p", BTreeSet::from(["default/b".to_string()]), PodPlacement::default());

        assert!(index.pods_for_volume("pv-0").is_empty());
        assert_eq!(index.pods_for_volume("pv-1"), vec!["default/p".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_pod() {
        let index = RelationshipIndex::new();
        index.add_pod(&pod("default", "web-0", &["data-0"]));
        index.add_volume("pv-0", "default/data-0");

        index.remove_pod("default/web-0").await;
        assert!(index.pods_for_volume("pv-0").is_empty());
        assert_eq!(index.pod_count(), 0);
        assert!(index.pod_placement("default/web-0").is_none());
    }

    #[test]
    fn test_remove_volume() {
        let index = RelationshipIndex::new();
        index.add_volume("pv-0", "default/data-0");
        index.remove_volume("pv-0");
        assert!(index.claim_for_volume("pv-0").is_none());
        assert!(index.pods_for_volume("pv-0").is_empty());
    }

    #[test]
    fn test_placement_allows() {
        let placement = PodPlacement {
            node_selector: BTreeMap::from([("zone".to_string(), "a".to_string())]),
            node_name: None,
        };
        assert!(placement.allows(&BTreeMap::from([("zone".to_string(), "a".to_string())])));
        assert!(!placement.allows(&BTreeMap::new()));
    }
}
