//! Migration of immutable StatefulSet volume claim template fields
//!
//! Annotations, the VolumeAttributesClass and the storage request of a
//! StatefulSet's `volumeClaimTemplates` cannot be changed in place. When
//! they drift from the desired templates the StatefulSet is deleted with
//! orphan cascade, its PVCs are patched directly, and the next apply
//! recreates the StatefulSet, which adopts the patched PVCs by name.
//!
//! Storage only grows, and only on a StorageClass that allows expansion.
//!
//! The workflow keeps no state between passes. Every decision is made from
//! a fresh read, which is what makes repeated passes converge instead of
//! deleting the StatefulSet again.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{info, warn};

use druid_common::crd::{parse_quantity, Druid, DruidSpec};
use druid_common::events::{actions, reasons};
use druid_common::{labels, Error};

use crate::client::VolumeClaimPatch;
use crate::controller::Context;
use crate::kinds::{Cascade, ChildKind};
use crate::ordering::ResolvedNode;
use crate::status::{deployment_settled, statefulset_settled};

/// Which claim template fields a migration may change
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MigrationScope {
    /// Template and PVC annotations
    pub annotations: bool,
    /// `volumeAttributesClassName`
    pub attributes_class: bool,
    /// Growth of the storage request
    pub storage: bool,
}

impl MigrationScope {
    /// Scope enabled by the cluster's PVC update switches
    pub fn for_cluster(spec: &DruidSpec) -> Self {
        Self {
            annotations: !spec.disable_pvc_updates && !spec.disable_pvc_annotation_update,
            attributes_class: !spec.disable_pvc_updates,
            storage: spec.scale_pvc_sts,
        }
    }

    /// True when no field may change
    pub fn is_disabled(&self) -> bool {
        !(self.annotations || self.attributes_class || self.storage)
    }
}

/// Name of the volume claim template that produced `pvc_name`.
///
/// PVCs are named `{template}-{statefulset}-{ordinal}`; the template is the
/// prefix before the last `-{statefulset}-`. Returns `None` when the PVC
/// does not follow that convention.
pub fn extract_volume_template_name<'a>(pvc_name: &'a str, sts_name: &str) -> Option<&'a str> {
    let needle = format!("-{sts_name}-");
    pvc_name
        .rfind(&needle)
        .map(|idx| &pvc_name[..idx])
        .filter(|prefix| !prefix.is_empty())
}

/// Drift of one volume claim template between the live and desired StatefulSet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemplateDrift {
    /// Template name
    pub template: String,
    /// Annotations differ
    pub annotations_changed: bool,
    /// VolumeAttributesClass changed from `.0` to `.1` ("" when unset)
    pub class_change: Option<(String, String)>,
    /// Storage request changed from `.0` to `.1`
    pub storage_change: Option<(String, String)>,
}

impl TemplateDrift {
    fn describe(&self) -> Vec<String> {
        let mut parts = Vec::new();
        if self.annotations_changed {
            parts.push(format!("VCT {}: annotations changed", self.template));
        }
        if let Some((from, to)) = &self.class_change {
            parts.push(format!(
                "VCT {}: volumeAttributesClassName changed from '{from}' to '{to}'",
                self.template
            ));
        }
        if let Some((from, to)) = &self.storage_change {
            let verb = if self.shrinks_storage() { "decreased" } else { "increased" };
            parts.push(format!(
                "VCT {}: storage {verb} from '{from}' to '{to}'",
                self.template
            ));
        }
        parts
    }

    /// True if the desired storage request is smaller than the live one
    pub fn shrinks_storage(&self) -> bool {
        self.storage_change
            .as_ref()
            .is_some_and(|(from, to)| compare_quantities(to, from) == Some(Ordering::Less))
    }
}

/// Human-readable summary of a drift record
pub fn describe_drift(drift: &[TemplateDrift]) -> String {
    drift
        .iter()
        .flat_map(TemplateDrift::describe)
        .collect::<Vec<_>>()
        .join("; ")
}

fn annotations_of(annotations: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    annotations.cloned().unwrap_or_default()
}

fn class_of(pvc: &PersistentVolumeClaim) -> &str {
    pvc.spec
        .as_ref()
        .and_then(|s| s.volume_attributes_class_name.as_deref())
        .unwrap_or_default()
}

fn storage_of(pvc: &PersistentVolumeClaim) -> Option<&str> {
    pvc.spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")
        .map(|q| q.0.as_str())
}

fn compare_quantities(a: &str, b: &str) -> Option<Ordering> {
    parse_quantity(a)?.partial_cmp(&parse_quantity(b)?)
}

fn templates_of(sts: &StatefulSet) -> BTreeMap<&str, &PersistentVolumeClaim> {
    sts.spec
        .as_ref()
        .and_then(|s| s.volume_claim_templates.as_ref())
        .map(|templates| {
            templates
                .iter()
                .filter_map(|t| t.metadata.name.as_deref().map(|name| (name, t)))
                .collect()
        })
        .unwrap_or_default()
}

/// Compare the claim templates present in both StatefulSets.
///
/// Templates only present on one side are not drift: adding or removing a
/// template is outside what an orphan-and-recreate can repair.
pub fn detect_drift(
    live: &StatefulSet,
    desired: &StatefulSet,
    scope: MigrationScope,
) -> Vec<TemplateDrift> {
    let live_templates = templates_of(live);
    let desired_templates = templates_of(desired);

    desired_templates
        .iter()
        .filter_map(|(name, want)| {
            let have = live_templates.get(name)?;
            let annotations_changed = scope.annotations
                && annotations_of(have.metadata.annotations.as_ref())
                    != annotations_of(want.metadata.annotations.as_ref());
            let (from, to) = (class_of(have), class_of(want));
            let class_change = (scope.attributes_class && from != to)
                .then(|| (from.to_string(), to.to_string()));
            let storage_change = match (storage_of(have), storage_of(want)) {
                (Some(from), Some(to)) if scope.storage => {
                    matches!(compare_quantities(from, to), Some(o) if o != Ordering::Equal)
                        .then(|| (from.to_string(), to.to_string()))
                }
                _ => None,
            };

            let drifted =
                annotations_changed || class_change.is_some() || storage_change.is_some();
            drifted.then(|| TemplateDrift {
                template: name.to_string(),
                annotations_changed,
                class_change,
                storage_change,
            })
        })
        .collect()
}

/// The patch that brings `pvc` in line with `template`.
///
/// Annotations are fully replaced: keys absent from the template are removed.
/// Storage is only ever raised.
pub fn volume_patch(
    pvc: &PersistentVolumeClaim,
    template: &PersistentVolumeClaim,
    scope: MigrationScope,
) -> VolumeClaimPatch {
    let mut patch = VolumeClaimPatch::default();

    if scope.annotations {
        let have = annotations_of(pvc.metadata.annotations.as_ref());
        let want = annotations_of(template.metadata.annotations.as_ref());
        for key in have.keys().filter(|k| !want.contains_key(*k)) {
            patch.annotations.insert(key.clone(), None);
        }
        for (key, value) in &want {
            if have.get(key) != Some(value) {
                patch.annotations.insert(key.clone(), Some(value.clone()));
            }
        }
    }

    let want_class = class_of(template);
    if scope.attributes_class && class_of(pvc) != want_class {
        patch.volume_attributes_class_name =
            Some((!want_class.is_empty()).then(|| want_class.to_string()));
    }

    if scope.storage {
        if let (Some(have), Some(want)) = (storage_of(pvc), storage_of(template)) {
            if compare_quantities(have, want) == Some(Ordering::Less) {
                patch.storage = Some(want.to_string());
            }
        }
    }

    patch
}

/// PVCs of the StatefulSet paired with the patch each one still needs.
///
/// PVCs whose template cannot be resolved, or whose template is not
/// desired, are skipped. The boolean reports whether any PVC was mapped.
fn pending_patches(
    pvcs: &[PersistentVolumeClaim],
    sts_name: &str,
    desired: &StatefulSet,
    scope: MigrationScope,
) -> (bool, Vec<(String, VolumeClaimPatch)>) {
    let templates = templates_of(desired);
    let mut mapped = false;
    let mut pending = Vec::new();

    for pvc in pvcs {
        let name = pvc.name_any();
        let Some(template) = extract_volume_template_name(&name, sts_name)
            .and_then(|t| templates.get(t))
        else {
            continue;
        };
        mapped = true;
        let patch = volume_patch(pvc, template, scope);
        if !patch.is_empty() {
            pending.push((name, patch));
        }
    }

    (mapped, pending)
}

/// Outcome of patching a set of PVCs
#[derive(Debug, Default)]
pub struct VolumePatchReport {
    /// PVCs patched successfully
    pub patched: Vec<String>,
    /// PVCs whose patch failed
    pub failed: Vec<(String, Error)>,
}

/// What the migration workflow decided for one node in this pass
#[derive(Debug)]
pub enum MigrationOutcome {
    /// Every PVC update switch is off
    Disabled,
    /// Not a StatefulSet node
    NotStateful,
    /// No live StatefulSet; lingering PVC patches were retried
    NoWorkload(VolumePatchReport),
    /// Live templates match the desired ones
    NoDrift,
    /// Templates drift but every PVC already carries the desired values
    AlreadyPatched,
    /// Drift found but some workload in the cluster is not ready
    AwaitingClusterReadiness {
        /// Drift summary
        details: String,
    },
    /// StatefulSet orphan-deleted and its PVCs patched
    Migrated {
        /// Drift summary
        details: String,
        /// Per-PVC results
        volumes: VolumePatchReport,
    },
}

impl MigrationOutcome {
    /// True when the StatefulSet was deleted in this pass
    pub fn workload_replaced(&self) -> bool {
        matches!(self, MigrationOutcome::Migrated { .. })
    }

    /// True when the desired StatefulSet must not be applied in this pass.
    ///
    /// A deferred migration keeps the live StatefulSet untouched; applying
    /// the changed templates would be rejected as an immutable-field update.
    pub fn holds_workload(&self) -> bool {
        matches!(
            self,
            MigrationOutcome::AwaitingClusterReadiness { .. } | MigrationOutcome::Migrated { .. }
        )
    }

    /// True while a template change is still being rolled out
    pub fn in_progress(&self) -> bool {
        matches!(
            self,
            MigrationOutcome::AwaitingClusterReadiness { .. }
                | MigrationOutcome::AlreadyPatched
                | MigrationOutcome::Migrated { .. }
        )
    }

    /// PVC patch failures, if any
    pub fn volume_failures(self) -> Vec<(String, Error)> {
        match self {
            MigrationOutcome::NoWorkload(report) => report.failed,
            MigrationOutcome::Migrated { volumes, .. } => volumes.failed,
            _ => vec![],
        }
    }
}

/// True if no StatefulSet or Deployment of the cluster is mid-rollout
async fn cluster_settled(ctx: &Context, namespace: &str, cluster: &str) -> Result<bool, Error> {
    let selector = labels::cluster_selector(cluster);
    let statefulsets = ctx.kube.list_statefulsets(namespace, &selector).await?;
    if !statefulsets.iter().all(statefulset_settled) {
        return Ok(false);
    }
    let deployments = ctx.kube.list_deployments(namespace, &selector).await?;
    Ok(deployments.iter().all(deployment_settled))
}

/// Refuse storage drift the cluster cannot carry out.
///
/// Shrinking is never possible. Growth needs a named StorageClass with
/// `allowVolumeExpansion` set.
async fn check_storage_drift(
    ctx: &Context,
    cluster: &Druid,
    node: &ResolvedNode<'_>,
    desired: &StatefulSet,
    drift: &[TemplateDrift],
) -> Result<(), Error> {
    let templates = templates_of(desired);

    for d in drift.iter().filter(|d| d.storage_change.is_some()) {
        let rejection = if d.shrinks_storage() {
            Some(format!("volume claim template '{}' cannot shrink", d.template))
        } else {
            let class = templates
                .get(d.template.as_str())
                .and_then(|t| t.spec.as_ref())
                .and_then(|s| s.storage_class_name.as_deref());
            match class {
                None => Some(format!(
                    "volume claim template '{}' has no storageClassName to expand",
                    d.template
                )),
                Some(class) => {
                    let expandable = ctx
                        .kube
                        .get_storage_class(class)
                        .await?
                        .and_then(|sc| sc.allow_volume_expansion)
                        .unwrap_or(false);
                    (!expandable).then(|| {
                        format!("StorageClass '{class}' does not allow volume expansion")
                    })
                }
            }
        };

        if let Some(message) = rejection {
            warn!(node = %node.key, template = %d.template, %message, "storage change rejected");
            ctx.events
                .publish(
                    &cluster.object_ref(&()),
                    EventType::Warning,
                    reasons::VOLUME_EXPANSION_REJECTED,
                    actions::MIGRATE,
                    Some(format!("Node {}: {message}", node.key)),
                )
                .await;
            let field = format!("spec.nodes.{}.volumeClaimTemplates", node.key);
            return Err(Error::validation_for_field(cluster.name_any(), field, message));
        }
    }
    Ok(())
}

async fn patch_volumes(
    ctx: &Context,
    cluster: &Druid,
    namespace: &str,
    patches: Vec<(String, VolumeClaimPatch)>,
) -> VolumePatchReport {
    let obj_ref = cluster.object_ref(&());
    let mut report = VolumePatchReport::default();

    for (name, patch) in patches {
        match ctx.kube.patch_pvc(namespace, &name, &patch).await {
            Ok(()) => {
                info!(pvc = %name, "patched PVC to match volume claim template");
                ctx.events
                    .publish(
                        &obj_ref,
                        EventType::Normal,
                        reasons::PVC_UPDATED,
                        actions::MIGRATE,
                        Some(format!("Updated PVC {name}")),
                    )
                    .await;
                report.patched.push(name);
            }
            Err(e) => {
                warn!(pvc = %name, error = %e, "failed to patch PVC");
                ctx.events
                    .publish(
                        &obj_ref,
                        EventType::Warning,
                        reasons::PVC_UPDATE_FAILED,
                        actions::MIGRATE,
                        Some(format!("Failed to update PVC {name}: {e}")),
                    )
                    .await;
                report.failed.push((name, e));
            }
        }
    }

    report
}

/// Run the volume claim template migration for one node.
///
/// `desired` is the StatefulSet the manifest builder rendered for the
/// node, or `None` for Deployment nodes.
pub async fn migrate_volume_templates(
    ctx: &Context,
    cluster: &Druid,
    namespace: &str,
    node: &ResolvedNode<'_>,
    desired: Option<&StatefulSet>,
) -> Result<MigrationOutcome, Error> {
    let scope = MigrationScope::for_cluster(&cluster.spec);
    if scope.is_disabled() {
        return Ok(MigrationOutcome::Disabled);
    }
    let Some(desired) = desired.filter(|_| node.spec.is_stateful()) else {
        return Ok(MigrationOutcome::NotStateful);
    };

    let sts_name = node.unique_name.as_str();
    let node_selector = labels::node_selector(sts_name);

    let Some(live) = ctx.kube.get_statefulset(namespace, sts_name).await? else {
        let pvcs = ctx.kube.list_pvcs(namespace, &node_selector).await?;
        let (_, pending) = pending_patches(&pvcs, sts_name, desired, scope);
        if !pending.is_empty() {
            info!(
                node = %node.key,
                count = pending.len(),
                "retrying PVC patches for absent StatefulSet"
            );
        }
        let report = patch_volumes(ctx, cluster, namespace, pending).await;
        return Ok(MigrationOutcome::NoWorkload(report));
    };

    let drift = detect_drift(&live, desired, scope);
    if drift.is_empty() {
        return Ok(MigrationOutcome::NoDrift);
    }
    let details = describe_drift(&drift);
    check_storage_drift(ctx, cluster, node, desired, &drift).await?;

    let pvcs = ctx.kube.list_pvcs(namespace, &node_selector).await?;
    let (mapped, pending) = pending_patches(&pvcs, sts_name, desired, scope);
    if mapped && pending.is_empty() {
        info!(
            node = %node.key,
            %details,
            "PVCs already match templates, waiting for StatefulSet recreation"
        );
        return Ok(MigrationOutcome::AlreadyPatched);
    }

    let obj_ref = cluster.object_ref(&());
    if !cluster_settled(ctx, namespace, &cluster.name_any()).await? {
        info!(
            node = %node.key,
            %details,
            "deferring volume claim template migration until all workloads are ready"
        );
        ctx.events
            .publish(
                &obj_ref,
                EventType::Normal,
                reasons::MIGRATION_DEFERRED,
                actions::MIGRATE,
                Some(format!("StatefulSet {sts_name}: {details}")),
            )
            .await;
        return Ok(MigrationOutcome::AwaitingClusterReadiness { details });
    }

    // Re-read right before the destructive step
    if ctx.kube.get_statefulset(namespace, sts_name).await?.is_none() {
        return Ok(MigrationOutcome::NoWorkload(VolumePatchReport::default()));
    }

    ctx.events
        .publish(
            &obj_ref,
            EventType::Normal,
            reasons::VCT_CHANGE_DETECTED,
            actions::MIGRATE,
            Some(format!("StatefulSet {sts_name}: {details}")),
        )
        .await;

    ctx.kube
        .delete_child(ChildKind::StatefulSet, namespace, sts_name, Cascade::Orphan)
        .await?;
    info!(
        node = %node.key,
        statefulset = %sts_name,
        "orphan-deleted StatefulSet for volume claim template change"
    );
    ctx.events
        .publish(
            &obj_ref,
            EventType::Normal,
            reasons::STATEFULSET_ORPHANED,
            actions::MIGRATE,
            Some(format!(
                "Deleted StatefulSet {sts_name} with orphan cascade, pods and PVCs are kept"
            )),
        )
        .await;

    let volumes = patch_volumes(ctx, cluster, namespace, pending).await;
    Ok(MigrationOutcome::Migrated { details, volumes })
}
