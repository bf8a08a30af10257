//! Kubernetes Object Store Adapter
//!
//! Implements [`ObjectStore`] over kube `Api` handles. API status codes are
//! mapped onto the operator's error taxonomy so reconcilers behave the same
//! against the cluster and against the in-memory store.

use crate::crd::{Attachment, Volume};
use crate::domain::ports::{LabelSelector, ObjectStore};
use crate::error::{Error, ResourceKind, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, ResourceExt};
use tracing::debug;

// =============================================================================
// Kube Store
// =============================================================================

/// Object store backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    volumes: Api<Volume>,
    attachments: Api<Attachment>,
    persistent_volumes: Api<PersistentVolume>,
    storage_classes: Api<StorageClass>,
}

impl KubeStore {
    /// Create a store scoped to `namespace` for the operator's own resources
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            volumes: Api::namespaced(client.clone(), namespace),
            attachments: Api::namespaced(client.clone(), namespace),
            persistent_volumes: Api::all(client.clone()),
            storage_classes: Api::all(client),
        }
    }
}

/// Map an API error for `kind/name` onto the operator's error taxonomy
fn map_api_error(kind: ResourceKind, name: &str, err: kube::Error) -> Error {
    match &err {
        kube::Error::Api(response) if response.code == 404 => Error::ResourceNotFound {
            kind,
            name: name.to_string(),
        },
        kube::Error::Api(response) if response.code == 409 && response.reason == "AlreadyExists" => {
            Error::ResourceExists {
                kind,
                name: name.to_string(),
            }
        }
        kube::Error::Api(response) if response.code == 409 => Error::Conflict {
            kind,
            name: name.to_string(),
        },
        _ => Error::Kube(err),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_volume(&self, name: &str) -> Result<Volume> {
        self.volumes
            .get(name)
            .await
            .map_err(|e| map_api_error(ResourceKind::Volume, name, e))
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>> {
        let list = self.volumes.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn create_volume(&self, volume: &Volume) -> Result<Volume> {
        let name = volume.name_any();
        self.volumes
            .create(&PostParams::default(), volume)
            .await
            .map_err(|e| map_api_error(ResourceKind::Volume, &name, e))
    }

    async fn replace_volume(&self, volume: &Volume) -> Result<Volume> {
        let name = volume.name_any();
        self.volumes
            .replace(&name, &PostParams::default(), volume)
            .await
            .map_err(|e| map_api_error(ResourceKind::Volume, &name, e))
    }

    async fn replace_volume_status(&self, volume: &Volume) -> Result<Volume> {
        let name = volume.name_any();
        let data = serde_json::to_vec(volume)?;
        self.volumes
            .replace_status(&name, &PostParams::default(), data)
            .await
            .map_err(|e| map_api_error(ResourceKind::Volume, &name, e))
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        debug!("Requesting deletion of Volume {}", name);
        self.volumes
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_api_error(ResourceKind::Volume, name, e))?;
        Ok(())
    }

    async fn get_attachment(&self, name: &str) -> Result<Attachment> {
        self.attachments
            .get(name)
            .await
            .map_err(|e| map_api_error(ResourceKind::Attachment, name, e))
    }

    async fn list_attachments(&self, selector: &LabelSelector) -> Result<Vec<Attachment>> {
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector.to_query());
        }
        let list = self.attachments.list(&params).await?;
        Ok(list.items)
    }

    async fn create_attachment(&self, attachment: &Attachment) -> Result<Attachment> {
        let name = attachment.name_any();
        self.attachments
            .create(&PostParams::default(), attachment)
            .await
            .map_err(|e| map_api_error(ResourceKind::Attachment, &name, e))
    }

    async fn replace_attachment(&self, attachment: &Attachment) -> Result<Attachment> {
        let name = attachment.name_any();
        self.attachments
            .replace(&name, &PostParams::default(), attachment)
            .await
            .map_err(|e| map_api_error(ResourceKind::Attachment, &name, e))
    }

    async fn replace_attachment_status(&self, attachment: &Attachment) -> Result<Attachment> {
        let name = attachment.name_any();
        let data = serde_json::to_vec(attachment)?;
        self.attachments
            .replace_status(&name, &PostParams::default(), data)
            .await
            .map_err(|e| map_api_error(ResourceKind::Attachment, &name, e))
    }

    async fn delete_attachment(&self, name: &str) -> Result<()> {
        debug!("Requesting deletion of Attachment {}", name);
        self.attachments
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_api_error(ResourceKind::Attachment, name, e))?;
        Ok(())
    }

    async fn list_persistent_volumes(&self) -> Result<Vec<PersistentVolume>> {
        let list = self.persistent_volumes.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn get_storage_class(&self, name: &str) -> Result<StorageClass> {
        self.storage_classes
            .get(name)
            .await
            .map_err(|e| map_api_error(ResourceKind::StorageClass, name, e))
    }
}
