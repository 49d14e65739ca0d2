//! Druid controller implementation
//!
//! One pass drives a Druid object toward its spec: finalizer bookkeeping,
//! ordered per-node apply with volume claim template migration, garbage
//! collection of children that left the spec, and a status write when
//! anything observable changed. Every step re-reads live state, so a pass
//! interrupted at any point is safe to run again.
//!
//! With `rollingDeploy` set, an update stops at the first node whose
//! workload has not finished rolling out. Later nodes keep their live
//! objects until a following pass.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{error, info, instrument, warn};

use druid_common::crd::Druid;
use druid_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use druid_common::{labels, Error, FIELD_MANAGER};

use crate::cleanup::{cleanup_unused_resources, CleanupOutcome, ResourceExpectations};
use crate::client::{KubeClient, KubeClientImpl};
use crate::finalizer;
use crate::kinds::{ChildKind, ChildManifest};
use crate::manifest::{DefaultManifestBuilder, ManifestBuilder};
use crate::ordering::{self, ResolvedNode};
use crate::status::{self, NodeReport};
use crate::volume_migration::{self, MigrationOutcome};

/// Resync interval for a settled cluster
pub const DEFAULT_REQUEUE_INTERVAL: Duration = Duration::from_secs(300);

/// Resync interval while nodes roll or a template migration is pending
pub const ROLLING_REQUEUE_INTERVAL: Duration = Duration::from_secs(30);

/// Delay before retrying a pass that failed with a transient error
const ERROR_REQUEUE_INTERVAL: Duration = Duration::from_secs(5);

/// Delay before retrying a pass the API server rejected
const REJECTED_REQUEUE_INTERVAL: Duration = Duration::from_secs(60);

/// Controller context shared by every reconcile pass
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client)
///     .requeue_interval(Duration::from_secs(120))
///     .build();
/// ```
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Kubernetes Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Renders the child manifests of a node
    pub manifests: Arc<dyn ManifestBuilder>,
    /// Resync interval for a settled cluster
    pub requeue_interval: Duration,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Context over an arbitrary client and event sink, with default
    /// manifests and intervals. Used where no API server is available.
    pub fn with_clients(kube: Arc<dyn KubeClient>, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            kube,
            events,
            manifests: Arc::new(DefaultManifestBuilder),
            requeue_interval: DEFAULT_REQUEUE_INTERVAL,
        }
    }

    /// Create a context for testing with a mock client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>) -> Self {
        Self::with_clients(kube, Arc::new(druid_common::events::NoopEventPublisher))
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    requeue_interval: Duration,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            requeue_interval: DEFAULT_REQUEUE_INTERVAL,
        }
    }

    /// Set the resync interval for settled clusters
    pub fn requeue_interval(mut self, interval: Duration) -> Self {
        self.requeue_interval = interval;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: Arc::new(KubeClientImpl::new(self.client.clone())),
            events: Arc::new(KubeEventPublisher::new(self.client, FIELD_MANAGER)),
            manifests: Arc::new(DefaultManifestBuilder),
            requeue_interval: self.requeue_interval,
        }
    }
}

/// Reconcile a Druid resource
///
/// Returns the requeue action for a pass that completed, or the aggregate
/// of every failure it hit. Failures of one node or one child object do
/// not stop the rest of the pass.
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<Druid>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = cluster.name_any();
    let namespace = cluster
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "Druid object has no namespace"))?;

    if cluster.meta().deletion_timestamp.is_some() {
        info!("cluster is being deleted");
        finalizer::handle_deletion(&ctx, &cluster, &namespace).await?;
        return Ok(Action::await_change());
    }

    info!("reconciling cluster");
    finalizer::sync_finalizer(&ctx, &cluster, &namespace).await?;

    let nodes = match cluster
        .spec
        .validate(&name)
        .and_then(|()| ordering::resolve(&name, &cluster.spec))
    {
        Ok(nodes) => nodes,
        Err(e) => {
            warn!(error = %e, "spec validation failed");
            ctx.events
                .publish(
                    &cluster.object_ref(&()),
                    EventType::Warning,
                    reasons::VALIDATION_FAILED,
                    actions::RECONCILE,
                    Some(e.to_string()),
                )
                .await;
            return Err(e);
        }
    };

    let sequential = cluster.spec.rolling_deploy && cluster.meta().generation.unwrap_or(1) > 1;
    let mut pass = Pass::default();
    for (index, node) in nodes.iter().enumerate() {
        if pass.waiting_on.is_some() {
            pass.hold_node(&ctx, &cluster, node);
            continue;
        }
        pass.reconcile_node(&ctx, &cluster, &namespace, node).await;
        if sequential && index + 1 < nodes.len() {
            pass.await_rollout(&ctx, &cluster, &namespace, node).await;
        }
    }

    let cleanup = if pass.build_failed {
        warn!("skipping cleanup, desired state is incomplete");
        None
    } else {
        let outcome = cleanup_unused_resources(
            ctx.kube.as_ref(),
            &namespace,
            &labels::cluster_selector(&name),
            &pass.expectations,
        )
        .await;
        publish_cleanup_events(&ctx, &cluster, &outcome).await;
        Some(outcome)
    };

    let (observation, observe_errors) = status::observe(&ctx, &namespace, &name).await;
    pass.errors.extend(observe_errors);

    let next = status::build_status(
        &cluster.status.clone().unwrap_or_default(),
        cluster.meta().generation,
        &pass.reports,
        cleanup.as_ref(),
        &observation,
    );
    let settled = next.is_ready() && !pass.migrating && pass.waiting_on.is_none();

    if let Some(e) = cleanup.and_then(|c| c.into_error()) {
        pass.errors.push(e);
    }

    let pass_succeeded = pass.errors.is_empty();
    if let Err(e) = status::patch_if_changed(&ctx, &cluster, &namespace, next, pass_succeeded).await
    {
        warn!(error = %e, "failed to write status");
        pass.errors.push(e);
    }

    if let Some(e) = Error::aggregate(format!("reconcile {namespace}/{name}"), pass.errors) {
        return Err(e);
    }

    Ok(Action::requeue(if settled {
        ctx.requeue_interval
    } else {
        ROLLING_REQUEUE_INTERVAL
    }))
}

/// Accumulated state of one reconcile pass
#[derive(Default)]
struct Pass {
    expectations: ResourceExpectations,
    reports: Vec<NodeReport>,
    errors: Vec<Error>,
    build_failed: bool,
    migrating: bool,
    /// Node whose rollout holds back the rest of the pass
    waiting_on: Option<String>,
}

impl Pass {
    fn new_report(node: &ResolvedNode<'_>) -> NodeReport {
        NodeReport {
            key: node.key.to_string(),
            unique_name: node.unique_name.clone(),
            kind: node.spec.kind,
            failure: None,
            workload_replaced: false,
            rollout_pending: false,
        }
    }

    /// Render the node's children and record them as expected.
    ///
    /// On failure the report carries the error and `None` is returned.
    fn render(
        &mut self,
        ctx: &Context,
        cluster: &Druid,
        node: &ResolvedNode<'_>,
        report: &mut NodeReport,
    ) -> Option<Vec<ChildManifest>> {
        match ctx.manifests.build(cluster, node) {
            Ok(manifests) => {
                self.expectations.expect_manifests(&manifests);
                Some(manifests)
            }
            Err(e) => {
                error!(node = %node.key, error = %e, "failed to build manifests");
                self.build_failed = true;
                self.fail(report, e);
                None
            }
        }
    }

    /// Keep a node's live objects while an earlier node rolls out
    fn hold_node(&mut self, ctx: &Context, cluster: &Druid, node: &ResolvedNode<'_>) {
        let mut report = Self::new_report(node);
        if self.render(ctx, cluster, node, &mut report).is_some() {
            report.rollout_pending = true;
        }
        self.reports.push(report);
    }

    async fn await_rollout(
        &mut self,
        ctx: &Context,
        cluster: &Druid,
        namespace: &str,
        node: &ResolvedNode<'_>,
    ) {
        let rolled_out = match status::workload_rolled_out(ctx, namespace, node).await {
            Ok(done) => done,
            Err(e) => {
                warn!(node = %node.key, error = %e, "failed to read rollout progress");
                self.errors.push(e);
                false
            }
        };
        if rolled_out {
            return;
        }

        info!(node = %node.key, "waiting for rollout before updating the next node");
        ctx.events
            .publish(
                &cluster.object_ref(&()),
                EventType::Normal,
                reasons::ROLLING_DEPLOY_WAIT,
                actions::RECONCILE,
                Some(format!(
                    "Waiting for {} to finish rolling out before updating the next node",
                    node.unique_name
                )),
            )
            .await;
        self.waiting_on = Some(node.key.to_string());
    }

    async fn reconcile_node(
        &mut self,
        ctx: &Context,
        cluster: &Druid,
        namespace: &str,
        node: &ResolvedNode<'_>,
    ) {
        let mut report = Self::new_report(node);
        let Some(manifests) = self.render(ctx, cluster, node, &mut report) else {
            self.reports.push(report);
            return;
        };

        let desired = manifests.iter().find_map(ChildManifest::as_stateful_set);
        let hold_workload = match volume_migration::migrate_volume_templates(
            ctx, cluster, namespace, node, desired,
        )
        .await
        {
            Ok(outcome) => {
                report.workload_replaced = outcome.workload_replaced();
                self.migrating |= outcome.in_progress();
                let hold = outcome.holds_workload();
                self.record_volume_failures(&mut report, outcome);
                hold
            }
            Err(e) => {
                warn!(node = %node.key, error = %e, "volume claim template migration failed");
                self.fail(&mut report, e);
                true
            }
        };

        for manifest in &manifests {
            if hold_workload && manifest.kind() == ChildKind::StatefulSet {
                info!(
                    node = %node.key,
                    "holding StatefulSet apply for volume claim template migration"
                );
                continue;
            }
            if let Err(e) = ctx.kube.apply_child(namespace, manifest).await {
                warn!(
                    node = %node.key,
                    kind = %manifest.kind(),
                    name = %manifest.name(),
                    error = %e,
                    "failed to apply child object"
                );
                self.fail(&mut report, e);
                break;
            }
        }

        self.reports.push(report);
    }

    fn record_volume_failures(&mut self, report: &mut NodeReport, outcome: MigrationOutcome) {
        let failures: Vec<Error> = outcome
            .volume_failures()
            .into_iter()
            .map(|(pvc, e)| {
                Error::internal_with_context("volume migration", format!("patch PVC {pvc}: {e}"))
            })
            .collect();
        if let Some(e) = Error::aggregate(format!("node {}", report.key), failures) {
            self.fail(report, e);
        }
    }

    /// Keep the first failure text on the node and collect the error
    fn fail(&mut self, report: &mut NodeReport, e: Error) {
        report.failure.get_or_insert_with(|| e.to_string());
        self.errors.push(e);
    }
}

async fn publish_cleanup_events(ctx: &Context, cluster: &Druid, outcome: &CleanupOutcome) {
    let obj_ref = cluster.object_ref(&());
    for object in &outcome.deleted {
        ctx.events
            .publish(
                &obj_ref,
                EventType::Normal,
                reasons::RESOURCE_DELETED,
                actions::DELETE,
                Some(format!("Deleted unused {} {}", object.kind, object.name)),
            )
            .await;
    }
    for object in &outcome.failed {
        ctx.events
            .publish(
                &obj_ref,
                EventType::Warning,
                reasons::RESOURCE_DELETE_FAILED,
                actions::DELETE,
                Some(format!(
                    "Failed to delete unused {} {}: {}",
                    object.kind, object.name, object.reason
                )),
            )
            .await;
    }
}

/// Error policy for the controller
///
/// Transient failures retry after a short delay and API rejections after
/// a longer one. Invalid specs and unrenderable manifests wait for the
/// object to change.
pub fn error_policy(cluster: Arc<Druid>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        cluster = %cluster.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(ERROR_REQUEUE_INTERVAL)
    } else if error.needs_spec_change() {
        Action::await_change()
    } else {
        Action::requeue(REJECTED_REQUEUE_INTERVAL)
    }
}
