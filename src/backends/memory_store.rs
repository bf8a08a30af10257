//! In-Memory Object Store
//!
//! A process-local [`ObjectStore`] used by tests and by standalone mode. It
//! emulates the API server behaviour the reconcilers depend on:
//! - optimistic concurrency through `resourceVersion`
//! - finalizer-gated removal (deletion only stamps `deletionTimestamp` while
//!   finalizers remain)
//! - a broadcast stream of change events standing in for watches

use crate::controller::events::AttachmentEvent;
use crate::crd::{Attachment, AttachmentStatus, Volume, VolumeStatus};
use crate::domain::ports::{LabelSelector, ObjectStore};
use crate::error::{Error, ResourceKind, Result};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

// =============================================================================
// Store Events
// =============================================================================

/// Change notifications emitted by the in-memory store
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A Volume was created or modified
    VolumeApplied(String),
    /// A Volume was removed
    VolumeRemoved(String),
    /// An Attachment changed
    Attachment(AttachmentEvent),
}

// =============================================================================
// Status Access
// =============================================================================

/// Objects with a status subresource
trait StatusObject: Resource + Clone {
    type Status: Clone;
    const KIND: ResourceKind;

    fn status_mut(&mut self) -> &mut Option<Self::Status>;
}

impl StatusObject for Volume {
    type Status = VolumeStatus;
    const KIND: ResourceKind = ResourceKind::Volume;

    fn status_mut(&mut self) -> &mut Option<VolumeStatus> {
        &mut self.status
    }
}

impl StatusObject for Attachment {
    type Status = AttachmentStatus;
    const KIND: ResourceKind = ResourceKind::Attachment;

    fn status_mut(&mut self) -> &mut Option<AttachmentStatus> {
        &mut self.status
    }
}

/// Outcome of a write against one object map
enum WriteOutcome<K> {
    Stored { old: Option<K>, new: K },
    Removed { old: K },
}

// =============================================================================
// In-Memory Store
// =============================================================================

#[derive(Default)]
struct StoreState {
    volumes: BTreeMap<String, Volume>,
    attachments: BTreeMap<String, Attachment>,
    persistent_volumes: BTreeMap<String, PersistentVolume>,
    storage_classes: BTreeMap<String, StorageClass>,
}

/// Object store held entirely in process memory
pub struct InMemoryStore {
    namespace: String,
    state: RwLock<StoreState>,
    resource_version: AtomicU64,
    calls: Mutex<HashMap<&'static str, usize>>,
    failures: Mutex<HashMap<&'static str, usize>>,
    event_sender: broadcast::Sender<StoreEvent>,
}

impl InMemoryStore {
    /// Create an empty store for `namespace`
    pub fn new(namespace: impl Into<String>) -> Self {
        let (event_sender, _) = broadcast::channel(1024);
        Self {
            namespace: namespace.into(),
            state: RwLock::new(StoreState::default()),
            resource_version: AtomicU64::new(1),
            calls: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            event_sender,
        }
    }

    /// Namespace objects are created in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.event_sender.subscribe()
    }

    /// Number of trait calls made for `operation` (e.g. `"create_attachment"`)
    pub fn call_count(&self, operation: &str) -> usize {
        self.calls.lock().get(operation).copied().unwrap_or(0)
    }

    /// Make the next `times` calls of `operation` fail with an internal error
    pub fn fail_operation(&self, operation: &'static str, times: usize) {
        self.failures.lock().insert(operation, times);
    }

    // -------------------------------------------------------------------------
    // Seeding and inspection (bypass call accounting)
    // -------------------------------------------------------------------------

    /// Insert or overwrite a Volume as-is
    pub fn insert_volume(&self, mut volume: Volume) {
        self.prepare(&mut volume);
        let name = volume.name_any();
        self.state.write().volumes.insert(name.clone(), volume);
        self.emit(StoreEvent::VolumeApplied(name));
    }

    /// Insert or overwrite an Attachment as-is
    pub fn insert_attachment(&self, mut attachment: Attachment) {
        self.prepare(&mut attachment);
        let name = attachment.name_any();
        let old = self
            .state
            .write()
            .attachments
            .insert(name, attachment.clone());
        self.emit(StoreEvent::Attachment(AttachmentEvent::applied(
            old, attachment,
        )));
    }

    /// Insert a PersistentVolume
    pub fn insert_persistent_volume(&self, pv: PersistentVolume) {
        self.state
            .write()
            .persistent_volumes
            .insert(pv.name_any(), pv);
    }

    /// Insert a StorageClass
    pub fn insert_storage_class(&self, class: StorageClass) {
        self.state
            .write()
            .storage_classes
            .insert(class.name_any(), class);
    }

    /// Current copy of a Volume
    pub fn volume(&self, name: &str) -> Option<Volume> {
        self.state.read().volumes.get(name).cloned()
    }

    /// Current copy of an Attachment
    pub fn attachment(&self, name: &str) -> Option<Attachment> {
        self.state.read().attachments.get(name).cloned()
    }

    /// All Attachments currently stored
    pub fn attachments(&self) -> Vec<Attachment> {
        self.state.read().attachments.values().cloned().collect()
    }

    /// Names of all stored Volumes
    pub fn volume_names(&self) -> Vec<String> {
        self.state.read().volumes.keys().cloned().collect()
    }

    /// Number of Volumes currently stored
    pub fn volume_count(&self) -> usize {
        self.state.read().volumes.len()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn next_version(&self) -> String {
        self.resource_version
            .fetch_add(1, Ordering::Relaxed)
            .to_string()
    }

    fn prepare<K: Resource>(&self, obj: &mut K) {
        let version = self.next_version();
        let meta = obj.meta_mut();
        if meta.namespace.is_none() {
            meta.namespace = Some(self.namespace.clone());
        }
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(Time(Utc::now()));
        }
        meta.resource_version = Some(version);
    }

    fn record(&self, operation: &'static str) -> Result<()> {
        *self.calls.lock().entry(operation).or_insert(0) += 1;

        let mut failures = self.failures.lock();
        if let Some(remaining) = failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Internal(format!("injected failure: {}", operation)));
            }
        }
        Ok(())
    }

    fn emit(&self, event: StoreEvent) {
        // No subscribers is fine
        let _ = self.event_sender.send(event);
    }

    fn get_from<K: StatusObject>(map: &BTreeMap<String, K>, name: &str) -> Result<K> {
        map.get(name).cloned().ok_or_else(|| Error::ResourceNotFound {
            kind: K::KIND,
            name: name.to_string(),
        })
    }

    fn create_in<K: StatusObject>(&self, map: &mut BTreeMap<String, K>, obj: &K) -> Result<K> {
        let name = obj.name_any();
        if map.contains_key(&name) {
            return Err(Error::ResourceExists {
                kind: K::KIND,
                name,
            });
        }
        let mut created = obj.clone();
        created.meta_mut().deletion_timestamp = None;
        created.meta_mut().resource_version = None;
        self.prepare(&mut created);
        map.insert(name, created.clone());
        Ok(created)
    }

    /// Replace either the spec and metadata or the status of a stored object.
    fn replace_in<K: StatusObject>(
        &self,
        map: &mut BTreeMap<String, K>,
        obj: &K,
        status_only: bool,
    ) -> Result<WriteOutcome<K>> {
        let name = obj.name_any();
        let stored = Self::get_from(map, &name)?;

        if let Some(version) = &obj.meta().resource_version {
            if stored.meta().resource_version.as_ref() != Some(version) {
                return Err(Error::Conflict {
                    kind: K::KIND,
                    name,
                });
            }
        }

        let mut updated = if status_only {
            let mut updated = stored.clone();
            *updated.status_mut() = obj.clone().status_mut().take();
            updated
        } else {
            let mut updated = obj.clone();
            *updated.status_mut() = stored.clone().status_mut().take();
            let meta = updated.meta_mut();
            meta.deletion_timestamp = stored.meta().deletion_timestamp.clone();
            meta.creation_timestamp = stored.meta().creation_timestamp.clone();
            meta.namespace = stored.meta().namespace.clone();
            updated
        };
        updated.meta_mut().resource_version = Some(self.next_version());

        if updated.meta().deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            map.remove(&name);
            debug!("Removed {} {} after its last finalizer", K::KIND, name);
            return Ok(WriteOutcome::Removed { old: stored });
        }

        map.insert(name, updated.clone());
        Ok(WriteOutcome::Stored {
            old: Some(stored),
            new: updated,
        })
    }

    fn delete_in<K: StatusObject>(
        &self,
        map: &mut BTreeMap<String, K>,
        name: &str,
    ) -> Result<WriteOutcome<K>> {
        let stored = Self::get_from(map, name)?;

        if stored.finalizers().is_empty() {
            map.remove(name);
            return Ok(WriteOutcome::Removed { old: stored });
        }

        if stored.meta().deletion_timestamp.is_some() {
            return Ok(WriteOutcome::Stored {
                old: None,
                new: stored,
            });
        }

        let mut updated = stored.clone();
        updated.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
        updated.meta_mut().resource_version = Some(self.next_version());
        map.insert(name.to_string(), updated.clone());
        Ok(WriteOutcome::Stored {
            old: Some(stored),
            new: updated,
        })
    }

    fn emit_volume(&self, outcome: &WriteOutcome<Volume>) {
        match outcome {
            WriteOutcome::Stored { old: None, .. } => {}
            WriteOutcome::Stored { new, .. } => {
                self.emit(StoreEvent::VolumeApplied(new.name_any()))
            }
            WriteOutcome::Removed { old } => self.emit(StoreEvent::VolumeRemoved(old.name_any())),
        }
    }

    fn emit_attachment(&self, outcome: WriteOutcome<Attachment>) {
        let event = match outcome {
            WriteOutcome::Stored { old: None, .. } => return,
            WriteOutcome::Stored { old, new } => AttachmentEvent::applied(old, new),
            WriteOutcome::Removed { old } => AttachmentEvent::removed(old),
        };
        self.emit(StoreEvent::Attachment(event));
    }

    fn stored_volume(outcome: WriteOutcome<Volume>) -> Volume {
        match outcome {
            WriteOutcome::Stored { new, .. } => new,
            WriteOutcome::Removed { old } => old,
        }
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get_volume(&self, name: &str) -> Result<Volume> {
        self.record("get_volume")?;
        Self::get_from(&self.state.read().volumes, name)
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>> {
        self.record("list_volumes")?;
        Ok(self.state.read().volumes.values().cloned().collect())
    }

    async fn create_volume(&self, volume: &Volume) -> Result<Volume> {
        self.record("create_volume")?;
        let created = self.create_in(&mut self.state.write().volumes, volume)?;
        self.emit(StoreEvent::VolumeApplied(created.name_any()));
        Ok(created)
    }

    async fn replace_volume(&self, volume: &Volume) -> Result<Volume> {
        self.record("replace_volume")?;
        let outcome = self.replace_in(&mut self.state.write().volumes, volume, false)?;
        self.emit_volume(&outcome);
        Ok(Self::stored_volume(outcome))
    }

    async fn replace_volume_status(&self, volume: &Volume) -> Result<Volume> {
        self.record("replace_volume_status")?;
        let outcome = self.replace_in(&mut self.state.write().volumes, volume, true)?;
        self.emit_volume(&outcome);
        Ok(Self::stored_volume(outcome))
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        self.record("delete_volume")?;
        let outcome = self.delete_in(&mut self.state.write().volumes, name)?;
        self.emit_volume(&outcome);
        Ok(())
    }

    async fn get_attachment(&self, name: &str) -> Result<Attachment> {
        self.record("get_attachment")?;
        Self::get_from(&self.state.read().attachments, name)
    }

    async fn list_attachments(&self, selector: &LabelSelector) -> Result<Vec<Attachment>> {
        self.record("list_attachments")?;
        Ok(self
            .state
            .read()
            .attachments
            .values()
            .filter(|a| selector.matches(a.labels()))
            .cloned()
            .collect())
    }

    async fn create_attachment(&self, attachment: &Attachment) -> Result<Attachment> {
        self.record("create_attachment")?;
        let created = self.create_in(&mut self.state.write().attachments, attachment)?;
        self.emit(StoreEvent::Attachment(AttachmentEvent::applied(
            None,
            created.clone(),
        )));
        Ok(created)
    }

    async fn replace_attachment(&self, attachment: &Attachment) -> Result<Attachment> {
        self.record("replace_attachment")?;
        let outcome = self.replace_in(&mut self.state.write().attachments, attachment, false)?;
        let stored = match &outcome {
            WriteOutcome::Stored { new, .. } => new.clone(),
            WriteOutcome::Removed { old } => old.clone(),
        };
        self.emit_attachment(outcome);
        Ok(stored)
    }

    async fn replace_attachment_status(&self, attachment: &Attachment) -> Result<Attachment> {
        self.record("replace_attachment_status")?;
        let outcome = self.replace_in(&mut self.state.write().attachments, attachment, true)?;
        let stored = match &outcome {
            WriteOutcome::Stored { new, .. } => new.clone(),
            WriteOutcome::Removed { old } => old.clone(),
        };
        self.emit_attachment(outcome);
        Ok(stored)
    }

    async fn delete_attachment(&self, name: &str) -> Result<()> {
        self.record("delete_attachment")?;
        let outcome = self.delete_in(&mut self.state.write().attachments, name)?;
        self.emit_attachment(outcome);
        Ok(())
    }

    async fn list_persistent_volumes(&self) -> Result<Vec<PersistentVolume>> {
        self.record("list_persistent_volumes")?;
        Ok(self
            .state
            .read()
            .persistent_volumes
            .values()
            .cloned()
            .collect())
    }

    async fn get_storage_class(&self, name: &str) -> Result<StorageClass> {
        self.record("get_storage_class")?;
        self.state
            .read()
            .storage_classes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ResourceNotFound {
                kind: ResourceKind::StorageClass,
                name: name.to_string(),
            })
    }
}
