//! Replica Count Controller
//!
//! Keeps the number of replica attachments of a volume at its
//! `maxMountReplicaCount`, creating the deficit on nodes picked by the
//! [`NodeSelector`]. All work for a volume is serialized on its lock.

use super::attach::{publish, replica_selector, volume_selector};
use super::config::ReplicaConfig;
use super::gc::GarbageCollector;
use super::metrics::ControllerMetrics;
use crate::crd::{Attachment, Role, VolumeState};
use crate::domain::ports::{ObjectStoreRef, VolumeProvisionerRef};
use crate::error::{Error, Result};
use crate::placement::NodeSelector;
use crate::registry::{LockRegistry, RelationshipIndex};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use dashmap::DashSet;
use kube::ResourceExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Creates and replaces replica attachments
pub struct ReplicaManager {
    namespace: String,
    store: ObjectStoreRef,
    provisioner: VolumeProvisionerRef,
    volume_locks: Arc<LockRegistry>,
    index: Arc<RelationshipIndex>,
    selector: NodeSelector,
    gc: Arc<GarbageCollector>,
    config: ReplicaConfig,
    metrics: ControllerMetrics,
    /// Attachment names with a live replacement task
    replacements: DashSet<String>,
}

impl ReplicaManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        namespace: impl Into<String>,
        store: ObjectStoreRef,
        provisioner: VolumeProvisionerRef,
        volume_locks: Arc<LockRegistry>,
        index: Arc<RelationshipIndex>,
        selector: NodeSelector,
        gc: Arc<GarbageCollector>,
        config: ReplicaConfig,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            store,
            provisioner,
            volume_locks,
            index,
            selector,
            gc,
            config,
            metrics,
            replacements: DashSet::new(),
        }
    }

    // =========================================================================
    // Replica Count
    // =========================================================================

    /// Create missing replica attachments for `volume_name`.
    ///
    /// Returns the number of replicas created, at most
    /// `max_replica_update_count` per call.
    pub async fn manage_replicas(&self, volume_name: &str) -> Result<usize> {
        let _volume_guard = self.volume_locks.lock(volume_name).await;

        let volume = match self.store.get_volume(volume_name).await {
            Ok(volume) => volume,
            Err(e) if e.is_not_found() => return Ok(0),
            Err(e) => return Err(e),
        };
        let detail = volume.detail().cloned().ok_or_else(|| {
            Error::aborted(format!(
                "volume {} has not been created yet, cannot manage replicas",
                volume_name
            ))
        })?;

        let current = self
            .store
            .list_attachments(&replica_selector(volume_name))
            .await?
            .len();
        let desired = volume.spec.max_mount_replica_count as usize;
        if volume.deletion_requested() || desired <= current {
            return Ok(0);
        }
        if matches!(volume.state(), VolumeState::Deleting | VolumeState::Deleted) {
            return Ok(0);
        }
        if self.gc.is_scheduled(volume_name) {
            debug!(
                "Volume {} is awaiting garbage collection, not adding replicas",
                volume_name
            );
            return Ok(0);
        }

        let batch = self.config.max_replica_update_count.min(desired - current);

        // Sorted keys keep the acquisition order consistent across callers
        let pods = self.index.pods_for_volume(volume_name);
        let mut pod_guards = Vec::with_capacity(pods.len());
        for pod in &pods {
            pod_guards.push(self.index.pod_lock(pod).await);
        }

        let occupied: BTreeSet<String> = self
            .store
            .list_attachments(&volume_selector(volume_name))
            .await?
            .into_iter()
            .map(|a| a.spec.node_name)
            .collect();
        let nodes = self.selector.select(&pods, &occupied, batch);

        if nodes.is_empty() {
            warn!(
                "No eligible node for a new replica of volume {} ({} of {} present)",
                volume_name, current, desired
            );
            return Ok(0);
        }

        let mut created = 0;
        for node in nodes {
            let mut attachment = Attachment::build(
                &self.namespace,
                volume_name,
                &detail.volume_id,
                &node,
                Role::Replica,
            );
            attachment.spec.volume_context = detail.volume_context.clone();

            let stored = match self.store.create_attachment(&attachment).await {
                Ok(stored) => stored,
                Err(e) if e.is_already_exists() => {
                    debug!("Replica {} already exists", attachment.name_any());
                    continue;
                }
                Err(e) => {
                    return Err(Error::ReplicaCreationFailed {
                        volume: volume_name.to_string(),
                        node,
                        reason: e.to_string(),
                    })
                }
            };

            publish(self.store.as_ref(), self.provisioner.as_ref(), stored)
                .await
                .map_err(|e| Error::ReplicaCreationFailed {
                    volume: volume_name.to_string(),
                    node: node.clone(),
                    reason: e.to_string(),
                })?;

            created += 1;
            self.metrics.replicas_created.inc();
            info!("Created replica of volume {} on node {}", volume_name, node);
        }

        drop(pod_guards);
        Ok(created)
    }

    // =========================================================================
    // Replacement
    // =========================================================================

    /// Replace the replica `attachment` once it is gone.
    ///
    /// Returns false if a replacement task for this attachment is already
    /// running.
    pub fn spawn_replacement(self: &Arc<Self>, attachment: &Attachment) -> bool {
        let name = attachment.name_any();
        if !self.replacements.insert(name.clone()) {
            debug!("Replacement for {} already running", name);
            return false;
        }

        let manager = Arc::clone(self);
        let volume = attachment.spec.volume_name.clone();
        tokio::spawn(async move {
            manager.await_removal(&name).await;
            if let Ok(created) = manager.replace_replica(&volume).await {
                info!(
                    "Replacement for {} finished, {} replica(s) created",
                    name, created
                );
            }
            manager.replacements.remove(&name);
        });
        true
    }

    pub fn replacement_running(&self, attachment: &str) -> bool {
        self.replacements.contains(attachment)
    }

    /// Poll until the attachment no longer exists
    async fn await_removal(&self, name: &str) {
        let mut ticker = tokio::time::interval(self.config.deletion_poll_interval);
        loop {
            ticker.tick().await;
            match self.store.get_attachment(name).await {
                Err(e) if e.is_not_found() => return,
                Ok(_) => debug!("Waiting for {} to be removed", name),
                Err(e) => warn!("Failed to look up {}: {}", name, e),
            }
        }
    }

    /// Run `manage_replicas` with exponential backoff between attempts
    async fn replace_replica(&self, volume: &str) -> Result<usize> {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.retry_initial_interval)
            .with_max_interval(self.config.retry_max_interval)
            .with_max_elapsed_time(None)
            .build();

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.manage_replicas(volume).await {
                Ok(created) => {
                    self.metrics
                        .replica_replacements
                        .with_label_values(&["replaced"])
                        .inc();
                    return Ok(created);
                }
                Err(e) if attempts >= self.config.max_replica_retries => {
                    let exhausted = Error::ReplicaRetriesExhausted {
                        volume: volume.to_string(),
                        attempts,
                    };
                    warn!("{}: last error: {}", exhausted, e);
                    self.metrics
                        .replica_replacements
                        .with_label_values(&["exhausted"])
                        .inc();
                    return Err(exhausted);
                }
                Err(e) => {
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(self.config.retry_max_interval);
                    debug!(
                        "Replica management for {} failed (attempt {}), retrying in {:?}: {}",
                        volume, attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backends::{InMemoryProvisioner, InMemoryStore};
    use crate::domain::ports::{CreateVolumeRequest, ObjectStore, VolumeProvisioner};
    use crate::crd::{
        AttachmentDetail, AttachmentState, AttachmentStatus, CapacityRange, Volume, VolumeDetail,
        VolumeSpec, VolumeStatus,
    };
    use crate::placement::PlacementPolicy;
    use crate::registry::{NodeInfo, NodeInventory, PodPlacement};
    use prometheus::Registry;
    use std::collections::BTreeMap;
    use std::time::Duration;

    pub(crate) struct Fixture {
        pub store: Arc<InMemoryStore>,
        pub provisioner: Arc<InMemoryProvisioner>,
        pub locks: Arc<LockRegistry>,
        pub index: Arc<RelationshipIndex>,
        pub inventory: Arc<NodeInventory>,
        pub gc: Arc<GarbageCollector>,
        pub metrics: ControllerMetrics,
        pub manager: Arc<ReplicaManager>,
    }

    pub(crate) fn fixture(nodes: usize, config: ReplicaConfig) -> Fixture {
        let store = Arc::new(InMemoryStore::new("test"));
        let provisioner = Arc::new(InMemoryProvisioner::new());
        let locks = Arc::new(LockRegistry::new());
        let index = Arc::new(RelationshipIndex::new());
        let inventory = Arc::new(NodeInventory::new());
        for i in 0..nodes {
            inventory.upsert(NodeInfo::new(format!("node-{}", i)));
        }
        let metrics = ControllerMetrics::new(&Registry::new()).unwrap();
        let gc = Arc::new(GarbageCollector::new(
            store.clone(),
            locks.clone(),
            Duration::from_secs(300),
            metrics.clone(),
        ));
        let selector = NodeSelector::new(inventory.clone(), index.clone(), PlacementPolicy::Lexical);
        let manager = Arc::new(ReplicaManager::new(
            "test",
            store.clone(),
            provisioner.clone(),
            locks.clone(),
            index.clone(),
            selector,
            gc.clone(),
            config,
            metrics.clone(),
        ));
        Fixture {
            store,
            provisioner,
            locks,
            index,
            inventory,
            gc,
            metrics,
            manager,
        }
    }

    /// Provision a disk and store a Created volume for it
    pub(crate) async fn created_volume(fx: &Fixture, name: &str, replicas: u32) -> VolumeDetail {
        let detail = fx
            .provisioner
            .create_volume(CreateVolumeRequest {
                name: name.to_string(),
                capacity_range: CapacityRange {
                    required_bytes: 1 << 30,
                    limit_bytes: 0,
                },
                ..Default::default()
            })
            .await
            .unwrap();

        let mut volume = Volume::build(
            name,
            "test",
            VolumeSpec {
                volume_name: name.to_string(),
                capacity_range: CapacityRange {
                    required_bytes: 1 << 30,
                    limit_bytes: 0,
                },
                max_mount_replica_count: replicas,
                volume_capabilities: vec![],
                parameters: BTreeMap::new(),
                secrets: BTreeMap::new(),
                content_source: None,
                accessibility_requirement: None,
            },
        );
        volume.status = Some(VolumeStatus {
            state: VolumeState::Created,
            phase: None,
            detail: Some(detail.clone()),
            error: None,
        });
        fx.store.insert_volume(volume);
        detail
    }

    /// Store an attached attachment
    pub(crate) fn attached(fx: &Fixture, volume: &str, volume_id: &str, node: &str, role: Role) {
        let mut attachment = Attachment::build("test", volume, volume_id, node, role);
        attachment.status = Some(AttachmentStatus {
            state: AttachmentState::Attached,
            detail: Some(AttachmentDetail {
                role,
                publish_context: BTreeMap::new(),
            }),
        });
        fx.store.insert_attachment(attachment);
    }

    fn replica_nodes(fx: &Fixture, volume: &str) -> Vec<String> {
        fx.store
            .attachments()
            .into_iter()
            .filter(|a| a.spec.volume_name == volume && a.spec.role == Role::Replica)
            .map(|a| a.spec.node_name)
            .collect()
    }

    #[tokio::test]
    async fn test_creates_one_replica_per_pass() {
        let fx = fixture(4, ReplicaConfig::default());
        let detail = created_volume(&fx, "pv-0", 2).await;
        attached(&fx, "pv-0", &detail.volume_id, "node-0", Role::Primary);

        assert_eq!(fx.manager.manage_replicas("pv-0").await.unwrap(), 1);
        // The primary's node is excluded
        assert_eq!(replica_nodes(&fx, "pv-0"), vec!["node-1"]);

        assert_eq!(fx.manager.manage_replicas("pv-0").await.unwrap(), 1);
        assert_eq!(fx.manager.manage_replicas("pv-0").await.unwrap(), 0);
        assert_eq!(replica_nodes(&fx, "pv-0"), vec!["node-1", "node-2"]);

        let replica = fx.store.attachment("pv-0-node-1-attachment").unwrap();
        assert!(replica.is_attached());
        assert_eq!(
            fx.provisioner.published_nodes(&detail.volume_id).await,
            vec!["node-1", "node-2"]
        );
        assert_eq!(fx.metrics.replicas_created.get(), 2);
    }

    #[tokio::test]
    async fn test_batch_bounded_by_deficit_and_cap() {
        let config = ReplicaConfig {
            max_replica_update_count: 5,
            ..Default::default()
        };
        let fx = fixture(6, config);
        created_volume(&fx, "pv-0", 2).await;

        assert_eq!(fx.manager.manage_replicas("pv-0").await.unwrap(), 2);
        assert_eq!(replica_nodes(&fx, "pv-0"), vec!["node-0", "node-1"]);
    }

    #[tokio::test]
    async fn test_truncates_to_available_nodes() {
        let config = ReplicaConfig {
            max_replica_update_count: 5,
            ..Default::default()
        };
        let fx = fixture(3, config);
        let detail = created_volume(&fx, "pv-0", 4).await;
        attached(&fx, "pv-0", &detail.volume_id, "node-1", Role::Primary);

        assert_eq!(fx.manager.manage_replicas("pv-0").await.unwrap(), 2);
        assert_eq!(replica_nodes(&fx, "pv-0"), vec!["node-0", "node-2"]);
        assert_eq!(fx.manager.manage_replicas("pv-0").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_passes_never_duplicate() {
        let config = ReplicaConfig {
            max_replica_update_count: 2,
            ..Default::default()
        };
        let fx = fixture(5, config);
        created_volume(&fx, "pv-0", 3).await;

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let manager = fx.manager.clone();
            tasks.push(tokio::spawn(async move {
                manager.manage_replicas("pv-0").await
            }));
        }
        let mut total = 0;
        for task in tasks {
            total += task.await.unwrap().unwrap();
        }

        assert_eq!(total, 3);
        let nodes = replica_nodes(&fx, "pv-0");
        let unique: BTreeSet<_> = nodes.iter().collect();
        assert_eq!(nodes.len(), 3);
        assert_eq!(unique.len(), 3);
    }

    #[tokio::test]
    async fn test_preconditions() {
        let fx = fixture(3, ReplicaConfig::default());

        // Missing volume
        assert_eq!(fx.manager.manage_replicas("pv-x").await.unwrap(), 0);

        // Not created yet
        let volume = Volume::build(
            "pv-1",
            "test",
            VolumeSpec {
                volume_name: "pv-1".into(),
                capacity_range: CapacityRange::default(),
                max_mount_replica_count: 1,
                volume_capabilities: vec![],
                parameters: BTreeMap::new(),
                secrets: BTreeMap::new(),
                content_source: None,
                accessibility_requirement: None,
            },
        );
        fx.store.insert_volume(volume);
        assert!(fx.manager.manage_replicas("pv-1").await.unwrap_err().is_aborted());

        // Garbage collection outstanding
        created_volume(&fx, "pv-2", 1).await;
        fx.gc.trigger("pv-2");
        assert_eq!(fx.manager.manage_replicas("pv-2").await.unwrap(), 0);
        fx.gc.cancel("pv-2");
        assert_eq!(fx.manager.manage_replicas("pv-2").await.unwrap(), 1);

        // Deleting
        created_volume(&fx, "pv-3", 1).await;
        let mut deleting = fx.store.volume("pv-3").unwrap();
        if let Some(status) = deleting.status.as_mut() {
            status.state = VolumeState::Deleting;
        }
        fx.store.insert_volume(deleting);
        assert_eq!(fx.manager.manage_replicas("pv-3").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_respects_pod_node_selector() {
        let config = ReplicaConfig {
            max_replica_update_count: 3,
            ..Default::default()
        };
        let fx = fixture(0, config);
        fx.inventory
            .upsert(NodeInfo::new("node-a").with_label("pool", "fast"));
        fx.inventory
            .upsert(NodeInfo::new("node-b").with_label("pool", "slow"));
        fx.inventory
            .upsert(NodeInfo::new("node-c").with_label("pool", "fast"));
        fx.index.add_volume("pv-0", "default/data");
        fx.index.insert_pod(
            "default/db-0",
            BTreeSet::from(["default/data".to_string()]),
            PodPlacement {
                node_selector: BTreeMap::from([("pool".to_string(), "fast".to_string())]),
                node_name: Some("node-a".into()),
            },
        );
        let detail = created_volume(&fx, "pv-0", 3).await;
        attached(&fx, "pv-0", &detail.volume_id, "node-a", Role::Primary);

        assert_eq!(fx.manager.manage_replicas("pv-0").await.unwrap(), 1);
        assert_eq!(replica_nodes(&fx, "pv-0"), vec!["node-c"]);
    }

    #[tokio::test]
    async fn test_creation_failure_is_returned() {
        let config = ReplicaConfig {
            max_replica_update_count: 2,
            ..Default::default()
        };
        let fx = fixture(3, config);
        created_volume(&fx, "pv-0", 2).await;
        fx.store.fail_operation("create_attachment", 1);

        let err = fx.manager.manage_replicas("pv-0").await.unwrap_err();
        assert!(matches!(err, Error::ReplicaCreationFailed { ref node, .. } if node == "node-0"));
        // The first failure stops the pass
        assert_eq!(fx.store.call_count("create_attachment"), 1);
        assert!(replica_nodes(&fx, "pv-0").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacement_waits_for_removal() {
        let fx = fixture(3, ReplicaConfig::default());
        let detail = created_volume(&fx, "pv-0", 1).await;
        attached(&fx, "pv-0", &detail.volume_id, "node-0", Role::Primary);
        attached(&fx, "pv-0", &detail.volume_id, "node-1", Role::Replica);

        let old = fx.store.attachment("pv-0-node-1-attachment").unwrap();
        fx.store.delete_attachment(&old.name_any()).await.unwrap();
        let old = fx.store.attachment("pv-0-node-1-attachment").unwrap();

        assert!(fx.manager.spawn_replacement(&old));
        assert!(!fx.manager.spawn_replacement(&old));

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(fx.store.call_count("create_attachment"), 0);

        // Release the finalizer so the object goes away
        let mut gone = old.clone();
        gone.finalizers_mut().clear();
        fx.store.replace_attachment(&gone).await.unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!fx.manager.replacement_running("pv-0-node-1-attachment"));
        assert_eq!(fx.store.call_count("create_attachment"), 1);
        // node-1 is free again and first in order
        assert_eq!(replica_nodes(&fx, "pv-0"), vec!["node-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacement_gives_up_after_retries() {
        let config = ReplicaConfig {
            max_replica_retries: 3,
            ..Default::default()
        };
        let fx = fixture(3, config);
        let detail = created_volume(&fx, "pv-0", 1).await;
        let mut old = Attachment::build("test", "pv-0", &detail.volume_id, "node-1", Role::Replica);
        old.finalizers_mut().clear();
        fx.store.fail_operation("get_volume", 10);

        assert!(fx.manager.spawn_replacement(&old));
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert!(!fx.manager.replacement_running("pv-0-node-1-attachment"));
        assert_eq!(fx.store.call_count("get_volume"), 3);
        assert_eq!(
            fx.metrics
                .replica_replacements
                .with_label_values(&["exhausted"])
                .get(),
            1
        );
    }
}
