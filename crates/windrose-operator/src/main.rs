//! Windrose Operator - declarative Windows worker nodes for Kubernetes

use clap::Parser;
use kube::{Api, Client, CustomResourceExt};

use windrose_common::crd::WindowsMachineConfig;
use windrose_common::telemetry::{init_telemetry, TelemetryConfig};
use windrose_common::CONTROLLER_NAME;

mod runner;

/// Windrose - CRD-driven operator maintaining Windows worker nodes
#[derive(Parser, Debug)]
#[command(name = "windrose", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Cluster service CIDR forwarded to the Windows node bootstrapper
    #[arg(long, env = "CLUSTER_SERVICE_CIDR")]
    cluster_service_cidr: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&WindowsMachineConfig::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "windrose-operator".to_string(),
        ..Default::default()
    })?;

    let cluster_service_cidr = cli
        .cluster_service_cidr
        .ok_or_else(|| anyhow::anyhow!("--cluster-service-cidr is required"))?;

    let client = Client::try_default().await?;
    ensure_crd_installed(&client).await?;

    runner::run_controller(client, cluster_service_cidr).await;

    tracing::info!("controller stopped");
    Ok(())
}

/// Ensure the WindowsMachineConfig CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply, so
/// the CRD version always matches the operator version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(CONTROLLER_NAME).force();

    tracing::info!("Installing WindowsMachineConfig CRD...");
    crds.patch(
        "windowsmachineconfigs.windrose.dev",
        &params,
        &Patch::Apply(&WindowsMachineConfig::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install WindowsMachineConfig CRD: {}", e))?;

    tracing::info!("CRD installed/updated");
    Ok(())
}
