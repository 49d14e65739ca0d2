//! Kubernetes access for the Druid controller
//!
//! Everything the reconciler reads or writes goes through [`KubeClient`],
//! so tests can substitute a mock or an in-memory cluster.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PropagationPolicy};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use druid_common::crd::{Druid, DruidClusterStatus};
use druid_common::{Error, FIELD_MANAGER};

use crate::kinds::{Cascade, ChildKind, ChildManifest};

/// Changes to apply to one PersistentVolumeClaim
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VolumeClaimPatch {
    /// Annotation edits: `Some` sets the value, `None` removes the key
    pub annotations: BTreeMap<String, Option<String>>,
    /// VolumeAttributesClass edit: outer `None` leaves it untouched,
    /// `Some(None)` clears it
    pub volume_attributes_class_name: Option<Option<String>>,
    /// New storage request for an expanding claim
    pub storage: Option<String>,
}

impl VolumeClaimPatch {
    /// Returns true if the patch changes nothing
    pub fn is_empty(&self) -> bool {
        self.annotations.is_empty()
            && self.volume_attributes_class_name.is_none()
            && self.storage.is_none()
    }

    /// Render as a JSON merge patch
    pub fn to_merge_patch(&self) -> serde_json::Value {
        let mut patch = serde_json::json!({});
        if !self.annotations.is_empty() {
            patch["metadata"] = serde_json::json!({ "annotations": self.annotations });
        }
        let mut spec = serde_json::Map::new();
        if let Some(class) = &self.volume_attributes_class_name {
            spec.insert("volumeAttributesClassName".to_string(), serde_json::json!(class));
        }
        if let Some(storage) = &self.storage {
            spec.insert(
                "resources".to_string(),
                serde_json::json!({ "requests": { "storage": storage } }),
            );
        }
        if !spec.is_empty() {
            patch["spec"] = serde_json::Value::Object(spec);
        }
        patch
    }
}

/// Trait abstracting Kubernetes client operations for the Druid controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// List the names of child objects of `kind` matching `selector`
    async fn list_names(
        &self,
        kind: ChildKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<String>, Error>;

    /// Delete a child object. A missing object is not an error.
    async fn delete_child(
        &self,
        kind: ChildKind,
        namespace: &str,
        name: &str,
        cascade: Cascade,
    ) -> Result<(), Error>;

    /// Server-side apply a child manifest
    async fn apply_child(&self, namespace: &str, manifest: &ChildManifest) -> Result<(), Error>;

    /// Get a StatefulSet by name
    async fn get_statefulset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StatefulSet>, Error>;

    /// List StatefulSets matching `selector`
    async fn list_statefulsets(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<StatefulSet>, Error>;

    /// List Deployments matching `selector`
    async fn list_deployments(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Deployment>, Error>;

    /// List PersistentVolumeClaims matching `selector`
    async fn list_pvcs(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, Error>;

    /// Merge-patch a PersistentVolumeClaim
    async fn patch_pvc(
        &self,
        namespace: &str,
        name: &str,
        patch: &VolumeClaimPatch,
    ) -> Result<(), Error>;

    /// Delete a PersistentVolumeClaim. A missing claim is not an error.
    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Get a cluster-scoped StorageClass by name
    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>, Error>;

    /// List the names of Pods matching `selector`
    async fn list_pod_names(&self, namespace: &str, selector: &str) -> Result<Vec<String>, Error>;

    /// Add a finalizer to a Druid object (no-op if present)
    async fn add_finalizer(&self, namespace: &str, name: &str, finalizer: &str)
        -> Result<(), Error>;

    /// Remove a finalizer from a Druid object (no-op if absent)
    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error>;

    /// Move the status of a Druid object from `previous` to `status`.
    ///
    /// Fields and node conditions missing from `status` are removed.
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        previous: &DruidClusterStatus,
        status: &DruidClusterStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn names_of<K>(&self, namespace: &str, selector: &str) -> Result<Vec<String>, Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let list = self
            .api::<K>(namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items.iter().map(|o| o.name_any()).collect())
    }

    async fn delete_of<K>(
        &self,
        namespace: &str,
        name: &str,
        params: &DeleteParams,
    ) -> Result<(), Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        match self.api::<K>(namespace).delete(name, params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(%name, kind = %K::kind(&()), "object not found (already deleted)");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_of<K>(&self, namespace: &str, obj: &K) -> Result<(), Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let name = obj.name_any();
        self.api::<K>(namespace)
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(obj),
            )
            .await?;
        Ok(())
    }

    async fn set_finalizers<F>(&self, namespace: &str, name: &str, edit: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Vec<String>) -> bool + Send,
    {
        let api: Api<Druid> = self.api(namespace);

        // Re-read so the edit is based on the current finalizer list
        let Some(druid) = api.get_opt(name).await? else {
            return Ok(());
        };
        let mut finalizers = druid.metadata.finalizers.unwrap_or_default();
        if !edit(&mut finalizers) {
            return Ok(());
        }

        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": druid.metadata.resource_version,
                "finalizers": finalizers
            }
        });
        api.patch(
            name,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

fn delete_params(cascade: Cascade) -> DeleteParams {
    DeleteParams {
        propagation_policy: Some(match cascade {
            Cascade::Background => PropagationPolicy::Background,
            Cascade::Orphan => PropagationPolicy::Orphan,
        }),
        ..Default::default()
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn list_names(
        &self,
        kind: ChildKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<String>, Error> {
        match kind {
            ChildKind::StatefulSet => self.names_of::<StatefulSet>(namespace, selector).await,
            ChildKind::Deployment => self.names_of::<Deployment>(namespace, selector).await,
            ChildKind::Service => self.names_of::<Service>(namespace, selector).await,
            ChildKind::ConfigMap => self.names_of::<ConfigMap>(namespace, selector).await,
            ChildKind::PodDisruptionBudget => {
                self.names_of::<PodDisruptionBudget>(namespace, selector)
                    .await
            }
            ChildKind::HorizontalPodAutoscaler => {
                self.names_of::<HorizontalPodAutoscaler>(namespace, selector)
                    .await
            }
            ChildKind::Ingress => self.names_of::<Ingress>(namespace, selector).await,
        }
    }

    async fn delete_child(
        &self,
        kind: ChildKind,
        namespace: &str,
        name: &str,
        cascade: Cascade,
    ) -> Result<(), Error> {
        let dp = delete_params(cascade);
        match kind {
            ChildKind::StatefulSet => self.delete_of::<StatefulSet>(namespace, name, &dp).await,
            ChildKind::Deployment => self.delete_of::<Deployment>(namespace, name, &dp).await,
            ChildKind::Service => self.delete_of::<Service>(namespace, name, &dp).await,
            ChildKind::ConfigMap => self.delete_of::<ConfigMap>(namespace, name, &dp).await,
            ChildKind::PodDisruptionBudget => {
                self.delete_of::<PodDisruptionBudget>(namespace, name, &dp)
                    .await
            }
            ChildKind::HorizontalPodAutoscaler => {
                self.delete_of::<HorizontalPodAutoscaler>(namespace, name, &dp)
                    .await
            }
            ChildKind::Ingress => self.delete_of::<Ingress>(namespace, name, &dp).await,
        }
    }

    async fn apply_child(&self, namespace: &str, manifest: &ChildManifest) -> Result<(), Error> {
        match manifest {
            ChildManifest::StatefulSet(o) => self.apply_of(namespace, o).await,
            ChildManifest::Deployment(o) => self.apply_of(namespace, o).await,
            ChildManifest::Service(o) => self.apply_of(namespace, o).await,
            ChildManifest::ConfigMap(o) => self.apply_of(namespace, o).await,
            ChildManifest::PodDisruptionBudget(o) => self.apply_of(namespace, o).await,
            ChildManifest::HorizontalPodAutoscaler(o) => self.apply_of(namespace, o).await,
            ChildManifest::Ingress(o) => self.apply_of(namespace, o).await,
        }
    }

    async fn get_statefulset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StatefulSet>, Error> {
        Ok(self.api::<StatefulSet>(namespace).get_opt(name).await?)
    }

    async fn list_statefulsets(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<StatefulSet>, Error> {
        let list = self
            .api::<StatefulSet>(namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items)
    }

    async fn list_deployments(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Deployment>, Error> {
        let list = self
            .api::<Deployment>(namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items)
    }

    async fn list_pvcs(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, Error> {
        let list = self
            .api::<PersistentVolumeClaim>(namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items)
    }

    async fn patch_pvc(
        &self,
        namespace: &str,
        name: &str,
        patch: &VolumeClaimPatch,
    ) -> Result<(), Error> {
        self.api::<PersistentVolumeClaim>(namespace)
            .patch(
                name,
                &PatchParams::default(),
                &Patch::Merge(&patch.to_merge_patch()),
            )
            .await?;
        Ok(())
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.delete_of::<PersistentVolumeClaim>(namespace, name, &DeleteParams::default())
            .await
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>, Error> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn list_pod_names(&self, namespace: &str, selector: &str) -> Result<Vec<String>, Error> {
        self.names_of::<Pod>(namespace, selector).await
    }

    async fn add_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        self.set_finalizers(namespace, name, |finalizers| {
            if finalizers.iter().any(|f| f == finalizer) {
                return false;
            }
            finalizers.push(finalizer.to_string());
            true
        })
        .await
    }

    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        self.set_finalizers(namespace, name, |finalizers| {
            let before = finalizers.len();
            finalizers.retain(|f| f != finalizer);
            finalizers.len() != before
        })
        .await
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        previous: &DruidClusterStatus,
        status: &DruidClusterStatus,
    ) -> Result<(), Error> {
        let api: Api<Druid> = self.api(namespace);
        let status_patch = serde_json::json!({
            "status": status.merge_patch_from(previous)?
        });
        api.patch_status(
            name,
            &PatchParams::default(),
            &Patch::Merge(&status_patch),
        )
        .await?;
        Ok(())
    }
}
