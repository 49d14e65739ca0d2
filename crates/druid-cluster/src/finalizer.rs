//! PVC deletion finalizer
//!
//! While present, the finalizer holds the Druid object until its
//! StatefulSets and PersistentVolumeClaims are gone. StatefulSets go first
//! so no pod re-creates a claim that was just deleted.

use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{info, warn};

use druid_common::crd::Druid;
use druid_common::events::{actions, reasons};
use druid_common::{labels, Error, PVC_DELETION_FINALIZER};

use crate::controller::Context;
use crate::kinds::{Cascade, ChildKind};

/// True if the Druid object carries the PVC deletion finalizer
pub fn has_finalizer(cluster: &Druid) -> bool {
    cluster.finalizers().iter().any(|f| f == PVC_DELETION_FINALIZER)
}

/// Add or remove the finalizer to match `disablePvcDeletionFinalizer`
pub async fn sync_finalizer(ctx: &Context, cluster: &Druid, namespace: &str) -> Result<(), Error> {
    let name = cluster.name_any();
    let wanted = !cluster.spec.disable_pvc_deletion_finalizer;

    match (wanted, has_finalizer(cluster)) {
        (true, false) => {
            ctx.kube
                .add_finalizer(namespace, &name, PVC_DELETION_FINALIZER)
                .await?;
            info!("added PVC deletion finalizer");
            ctx.events
                .publish(
                    &cluster.object_ref(&()),
                    EventType::Normal,
                    reasons::FINALIZER_ADDED,
                    actions::FINALIZE,
                    None,
                )
                .await;
        }
        (false, true) => {
            ctx.kube
                .remove_finalizer(namespace, &name, PVC_DELETION_FINALIZER)
                .await?;
            info!("removed PVC deletion finalizer, PVCs will be kept on deletion");
        }
        _ => {}
    }
    Ok(())
}

/// Tear down a deleting cluster and release it.
///
/// Does nothing when the finalizer is absent. Any failure leaves the
/// finalizer in place so the next pass resumes the teardown.
pub async fn handle_deletion(ctx: &Context, cluster: &Druid, namespace: &str) -> Result<(), Error> {
    if !has_finalizer(cluster) {
        return Ok(());
    }

    let name = cluster.name_any();
    let obj_ref = cluster.object_ref(&());

    if cluster.spec.disable_pvc_deletion_finalizer {
        info!("PVC deletion disabled, releasing without teardown");
        return release(ctx, cluster, namespace).await;
    }

    info!("deleting StatefulSets and PVCs before release");
    ctx.events
        .publish(
            &obj_ref,
            EventType::Normal,
            reasons::DELETION_STARTED,
            actions::DELETE,
            Some("Deleting StatefulSets and PersistentVolumeClaims".to_string()),
        )
        .await;

    let statefulsets = ctx
        .kube
        .list_statefulsets(namespace, &labels::cluster_selector(&name))
        .await?;
    let pvcs = ctx
        .kube
        .list_pvcs(namespace, &labels::pvc_finalizer_selector(&name))
        .await?;

    let mut errors = Vec::new();
    for sts in &statefulsets {
        let sts_name = sts.name_any();
        if let Err(e) = ctx
            .kube
            .delete_child(ChildKind::StatefulSet, namespace, &sts_name, Cascade::Background)
            .await
        {
            warn!(statefulset = %sts_name, error = %e, "failed to delete StatefulSet");
            errors.push(e);
        }
    }
    if let Some(e) = Error::aggregate("finalizer: delete statefulsets", errors) {
        return Err(e);
    }

    let mut errors = Vec::new();
    for pvc in &pvcs {
        let pvc_name = pvc.name_any();
        match ctx.kube.delete_pvc(namespace, &pvc_name).await {
            Ok(()) => {
                ctx.events
                    .publish(
                        &obj_ref,
                        EventType::Normal,
                        reasons::PVC_DELETED,
                        actions::DELETE,
                        Some(format!("Deleted PVC {pvc_name}")),
                    )
                    .await;
            }
            Err(e) => {
                warn!(pvc = %pvc_name, error = %e, "failed to delete PVC");
                errors.push(e);
            }
        }
    }
    if let Some(e) = Error::aggregate("finalizer: delete pvcs", errors) {
        return Err(e);
    }

    info!(
        statefulsets = statefulsets.len(),
        pvcs = pvcs.len(),
        "teardown complete"
    );
    release(ctx, cluster, namespace).await
}

async fn release(ctx: &Context, cluster: &Druid, namespace: &str) -> Result<(), Error> {
    ctx.kube
        .remove_finalizer(namespace, &cluster.name_any(), PVC_DELETION_FINALIZER)
        .await?;
    ctx.events
        .publish(
            &cluster.object_ref(&()),
            EventType::Normal,
            reasons::FINALIZER_REMOVED,
            actions::FINALIZE,
            None,
        )
        .await;
    Ok(())
}
