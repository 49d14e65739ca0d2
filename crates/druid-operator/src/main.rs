//! Druid Operator - Kubernetes lifecycle management for Apache Druid clusters

mod controller_runner;

use std::time::Duration;

use clap::Parser;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use druid_common::crd::Druid;
use druid_common::FIELD_MANAGER;

use crate::controller_runner::{run_druid_controller, RunnerConfig};

/// Druid operator - reconciles Druid custom resources into running clusters
#[derive(Parser, Debug)]
#[command(name = "druid-operator", version, about, long_about = None)]
struct Cli {
    /// Print the Druid CRD as YAML and exit
    #[arg(long)]
    crd: bool,

    /// Namespace to watch (all namespaces when unset)
    #[arg(long, env = "DRUID_WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Seconds between resyncs of a settled cluster
    #[arg(long, env = "DRUID_REQUEUE_INTERVAL_SECS", default_value_t = 300)]
    requeue_interval_secs: u64,

    /// Maximum number of Druid objects reconciled at once
    #[arg(long, env = "DRUID_MAX_CONCURRENT_RECONCILES", default_value_t = 4)]
    concurrency: u16,

    /// Server-side apply the Druid CRD on startup
    #[arg(long, env = "DRUID_INSTALL_CRD")]
    install_crd: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Druid::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if cli.install_crd {
        ensure_crd_installed(&client).await?;
    }

    run_druid_controller(
        client,
        RunnerConfig {
            namespace: cli.namespace,
            requeue_interval: Duration::from_secs(cli.requeue_interval_secs),
            concurrency: cli.concurrency,
        },
    )
    .await;

    Ok(())
}

/// Install the Druid CRD using server-side apply.
///
/// Keeps the stored schema in step with the operator version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing Druid CRD...");
    crds.patch(
        "druids.druid.apache.org",
        &params,
        &Patch::Apply(&Druid::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install Druid CRD: {}", e))?;

    Ok(())
}
