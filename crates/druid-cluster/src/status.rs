//! Status computation and change-suppressed status writes

use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use druid_common::crd::{
    Druid, DruidClusterStatus, DruidNodeTypeStatus, NodeConditionType, WorkloadKind,
};
use druid_common::events::{actions, reasons};
use druid_common::{labels, Error};

use crate::cleanup::CleanupOutcome;
use crate::controller::Context;
use crate::kinds::ChildKind;
use crate::ordering::ResolvedNode;

/// True if every replica the StatefulSet currently runs is ready
pub fn statefulset_settled(sts: &StatefulSet) -> bool {
    sts.status
        .as_ref()
        .is_none_or(|s| s.replicas == s.ready_replicas.unwrap_or(0))
}

/// True if every replica the Deployment currently runs is ready
pub fn deployment_settled(deployment: &Deployment) -> bool {
    deployment
        .status
        .as_ref()
        .is_none_or(|s| s.replicas.unwrap_or(0) == s.ready_replicas.unwrap_or(0))
}

/// True once the StatefulSet controller has seen the latest spec and every
/// replica runs the update revision and is ready
pub fn statefulset_rolled_out(sts: &StatefulSet) -> bool {
    let desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let generation = sts.metadata.generation.unwrap_or(0);
    sts.status.as_ref().is_some_and(|s| {
        s.observed_generation.unwrap_or(0) >= generation
            && s.current_revision == s.update_revision
            && s.ready_replicas.unwrap_or(0) == desired
    })
}

/// True once every replica of the Deployment is updated and ready
pub fn deployment_rolled_out(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let generation = deployment.metadata.generation.unwrap_or(0);
    deployment.status.as_ref().is_some_and(|s| {
        s.observed_generation.unwrap_or(0) >= generation
            && s.updated_replicas.unwrap_or(0) == desired
            && s.ready_replicas.unwrap_or(0) == desired
    })
}

/// Whether the workload of `node` has finished rolling out.
///
/// A missing workload has not.
pub async fn workload_rolled_out(
    ctx: &Context,
    namespace: &str,
    node: &ResolvedNode<'_>,
) -> Result<bool, Error> {
    match node.spec.kind {
        WorkloadKind::StatefulSet => Ok(ctx
            .kube
            .get_statefulset(namespace, &node.unique_name)
            .await?
            .as_ref()
            .is_some_and(statefulset_rolled_out)),
        WorkloadKind::Deployment => {
            let selector = labels::node_selector(&node.unique_name);
            let deployments = ctx.kube.list_deployments(namespace, &selector).await?;
            Ok(!deployments.is_empty() && deployments.iter().all(deployment_rolled_out))
        }
    }
}

/// Desired and ready replica counts of a live workload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkloadReadiness {
    /// `spec.replicas`
    pub desired: i32,
    /// `status.readyReplicas`
    pub ready: i32,
}

impl WorkloadReadiness {
    fn of_statefulset(sts: &StatefulSet) -> Self {
        Self {
            desired: sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
            ready: sts
                .status
                .as_ref()
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0),
        }
    }

    fn of_deployment(deployment: &Deployment) -> Self {
        Self {
            desired: deployment
                .spec
                .as_ref()
                .and_then(|s| s.replicas)
                .unwrap_or(1),
            ready: deployment
                .status
                .as_ref()
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0),
        }
    }

    fn is_ready(&self) -> bool {
        self.desired == self.ready
    }
}

/// What one node went through in the current pass
#[derive(Clone, Debug, PartialEq)]
pub struct NodeReport {
    /// Key in `spec.nodes`
    pub key: String,
    /// Workload name
    pub unique_name: String,
    /// Workload kind
    pub kind: WorkloadKind,
    /// Error text if building, migrating or applying failed
    pub failure: Option<String>,
    /// The StatefulSet was orphan-deleted for a template change this pass
    pub workload_replaced: bool,
    /// Update held until an earlier node finishes rolling out
    pub rollout_pending: bool,
}

/// Live state read for status, per workload name
#[derive(Clone, Debug, Default)]
pub struct Observation {
    /// Readiness of each StatefulSet, keyed by name
    pub statefulsets: BTreeMap<String, WorkloadReadiness>,
    /// Readiness of each Deployment, keyed by name
    pub deployments: BTreeMap<String, WorkloadReadiness>,
    /// Pod names; `None` when the list failed
    pub pods: Option<Vec<String>>,
    /// PVC names; `None` when the list failed
    pub persistent_volume_claims: Option<Vec<String>>,
}

/// Read the workloads, pods and PVCs of a cluster.
///
/// Failed lists are returned as errors alongside a partial observation so
/// status can still be written from what was read.
pub async fn observe(ctx: &Context, namespace: &str, cluster: &str) -> (Observation, Vec<Error>) {
    let selector = labels::cluster_selector(cluster);
    let mut observation = Observation::default();
    let mut errors = Vec::new();

    match ctx.kube.list_statefulsets(namespace, &selector).await {
        Ok(items) => {
            observation.statefulsets = items
                .iter()
                .map(|s| (s.name_any(), WorkloadReadiness::of_statefulset(s)))
                .collect()
        }
        Err(e) => errors.push(e),
    }
    match ctx.kube.list_deployments(namespace, &selector).await {
        Ok(items) => {
            observation.deployments = items
                .iter()
                .map(|d| (d.name_any(), WorkloadReadiness::of_deployment(d)))
                .collect()
        }
        Err(e) => errors.push(e),
    }
    match ctx.kube.list_pod_names(namespace, &selector).await {
        Ok(mut names) => {
            names.sort();
            observation.pods = Some(names);
        }
        Err(e) => errors.push(e),
    }
    match ctx
        .kube
        .list_pvcs(namespace, &labels::pvc_finalizer_selector(cluster))
        .await
    {
        Ok(items) => {
            let mut names: Vec<String> = items.iter().map(|p| p.name_any()).collect();
            names.sort();
            observation.persistent_volume_claims = Some(names);
        }
        Err(e) => errors.push(e),
    }

    (observation, errors)
}

/// Condition of one node given what happened to it and what is live
pub fn node_condition(report: &NodeReport, observation: &Observation) -> DruidNodeTypeStatus {
    if let Some(failure) = &report.failure {
        return DruidNodeTypeStatus::error(&report.key, failure);
    }
    if report.workload_replaced || report.rollout_pending {
        return DruidNodeTypeStatus::rolling_update(&report.key);
    }

    let live = match report.kind {
        WorkloadKind::StatefulSet => observation.statefulsets.get(&report.unique_name),
        WorkloadKind::Deployment => observation.deployments.get(&report.unique_name),
    };
    match live {
        Some(readiness) if readiness.is_ready() => DruidNodeTypeStatus::ready(&report.key),
        _ => DruidNodeTypeStatus::rolling_update(&report.key),
    }
}

/// Cluster-wide summary of conditions given in rollout order
pub fn summarize<'a>(
    conditions: impl IntoIterator<Item = &'a DruidNodeTypeStatus> + Clone,
) -> DruidNodeTypeStatus {
    let first_of = |wanted: NodeConditionType| {
        conditions
            .clone()
            .into_iter()
            .find(|c| c.druid_node_condition_type == wanted)
            .cloned()
    };

    first_of(NodeConditionType::Error)
        .or_else(|| first_of(NodeConditionType::RollingUpdate))
        .unwrap_or_else(DruidNodeTypeStatus::all_ready)
}

/// Build the next status.
///
/// `reports` must be in rollout order. Kinds the garbage collector could
/// not list, or every kind when it did not run, keep their previous names.
pub fn build_status(
    previous: &DruidClusterStatus,
    generation: Option<i64>,
    reports: &[NodeReport],
    cleanup: Option<&CleanupOutcome>,
    observation: &Observation,
) -> DruidClusterStatus {
    let conditions: Vec<DruidNodeTypeStatus> = reports
        .iter()
        .map(|r| node_condition(r, observation))
        .collect();

    let mut status = DruidClusterStatus {
        observed_generation: generation,
        druid_node_status: Some(summarize(&conditions)),
        node_conditions: reports
            .iter()
            .map(|r| r.key.clone())
            .zip(conditions.iter().cloned())
            .collect(),
        pods: observation
            .pods
            .clone()
            .unwrap_or_else(|| previous.pods.clone()),
        persistent_volume_claims: observation
            .persistent_volume_claims
            .clone()
            .unwrap_or_else(|| previous.persistent_volume_claims.clone()),
        last_attempted_time: previous.last_attempted_time,
        last_successful_time: previous.last_successful_time,
        ..Default::default()
    };

    for kind in ChildKind::ALL {
        let names = cleanup
            .and_then(|c| c.survivors_of(kind))
            .map(<[String]>::to_vec)
            .unwrap_or_else(|| kind.status_names(previous).clone());
        *kind.status_names_mut(&mut status) = names;
    }

    status
}

/// Write `next` if it differs from the cluster's current status.
///
/// Returns whether a write happened. `lastAttemptedTime` is stamped on
/// every write and `lastSuccessfulTime` only when `pass_succeeded`.
pub async fn patch_if_changed(
    ctx: &Context,
    cluster: &Druid,
    namespace: &str,
    mut next: DruidClusterStatus,
    pass_succeeded: bool,
) -> Result<bool, Error> {
    let previous = cluster.status.clone().unwrap_or_default();
    if previous.equivalent(&next) {
        debug!("status unchanged, skipping write");
        return Ok(false);
    }

    let now = Utc::now();
    next.last_attempted_time = Some(now);
    if pass_succeeded {
        next.last_successful_time = Some(now);
    }

    ctx.kube
        .patch_status(namespace, &cluster.name_any(), &previous, &next)
        .await?;

    if next.is_ready() && !previous.is_ready() {
        info!("all Druid nodes are ready");
        ctx.events
            .publish(
                &cluster.object_ref(&()),
                EventType::Normal,
                reasons::CLUSTER_READY,
                actions::RECONCILE,
                Some("All Druid Nodes are in Ready Condition".to_string()),
            )
            .await;
    }
    Ok(true)
}
