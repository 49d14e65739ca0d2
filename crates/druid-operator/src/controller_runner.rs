//! Controller runner - builds the Druid controller future

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use druid_cluster::{error_policy, reconcile, Context};
use druid_common::crd::Druid;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Settings the controller is built from
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Namespace to watch; all namespaces when `None`
    pub namespace: Option<String>,
    /// Resync interval for settled clusters
    pub requeue_interval: Duration,
    /// Maximum passes running at once across Druid objects
    pub concurrency: u16,
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Run the Druid controller until a shutdown signal arrives
pub async fn run_druid_controller(client: Client, config: RunnerConfig) {
    let ctx = Arc::new(
        Context::builder(client.clone())
            .requeue_interval(config.requeue_interval)
            .build(),
    );
    let namespace = config.namespace.as_deref();

    tracing::info!(
        namespace = namespace.unwrap_or("*"),
        concurrency = config.concurrency,
        requeue_secs = config.requeue_interval.as_secs(),
        "starting Druid controller"
    );

    Controller::new(
        api::<Druid>(&client, namespace),
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .owns(
        api::<StatefulSet>(&client, namespace),
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .owns(
        api::<Deployment>(&client, namespace),
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .with_config(ControllerConfig::default().concurrency(config.concurrency))
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(log_reconcile_result("Druid"))
    .await;

    tracing::info!("Druid controller stopped");
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
