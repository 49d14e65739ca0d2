//! Kubernetes Event recording for the Druid controller.
//!
//! Wraps `kube::runtime::events::Recorder` behind a trait so reconcile
//! code can emit Events visible via `kubectl describe druid <name>` and be
//! tested without an API server.
//!
//! Events are fire-and-forget: failures are logged and never propagated.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (see [`reasons`])
    /// * `action` - What action was taken (see [`actions`])
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `controller_name`.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Publisher that drops every event. Used in tests and dry runs.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// Spec failed validation
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// Deletion finalizer added to the Druid object
    pub const FINALIZER_ADDED: &str = "FinalizerAdded";
    /// Deletion finalizer removed from the Druid object
    pub const FINALIZER_REMOVED: &str = "FinalizerRemoved";
    /// Deletion teardown started
    pub const DELETION_STARTED: &str = "DeletionStarted";
    /// A PersistentVolumeClaim was deleted during teardown
    pub const PVC_DELETED: &str = "PVCDeleted";
    /// A child object no longer in the desired state was deleted
    pub const RESOURCE_DELETED: &str = "ResourceDeleted";
    /// Deleting an unused child object failed
    pub const RESOURCE_DELETE_FAILED: &str = "ResourceDeleteFailed";
    /// Volume claim template drift found on a live StatefulSet
    pub const VCT_CHANGE_DETECTED: &str = "VolumeClaimTemplateChangeDetected";
    /// StatefulSet orphan-deleted so it can be recreated with new templates
    pub const STATEFULSET_ORPHANED: &str = "StatefulSetOrphanedForVolumeClaimTemplateChange";
    /// Migration deferred until every workload is ready
    pub const MIGRATION_DEFERRED: &str = "VolumeClaimTemplateMigrationDeferred";
    /// A PersistentVolumeClaim was patched to match its template
    pub const PVC_UPDATED: &str = "PVCUpdated";
    /// Patching a PersistentVolumeClaim failed
    pub const PVC_UPDATE_FAILED: &str = "PVCUpdateFailed";
    /// Every node reports ready
    pub const CLUSTER_READY: &str = "ClusterReady";
    /// Later nodes wait for this node's workload to finish rolling out
    pub const ROLLING_DEPLOY_WAIT: &str = "RollingDeployWait";
    /// Volume claim template storage cannot be applied to the PVCs
    pub const VOLUME_EXPANSION_REJECTED: &str = "VolumeExpansionRejected";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Removing child objects
    pub const DELETE: &str = "Delete";
    /// Volume claim template migration
    pub const MIGRATE: &str = "Migrate";
    /// Finalizer bookkeeping and teardown
    pub const FINALIZE: &str = "Finalize";
}
