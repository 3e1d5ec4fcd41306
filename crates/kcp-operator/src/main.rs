//! Kamaji control plane provider - Cluster API control planes served by Kamaji

mod controller_runner;

use clap::Parser;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kcp_common::crd::KamajiControlPlane;
use kcp_common::features::{Feature, FeatureGates};
use kcp_common::kube_utils::{create_client, DEFAULT_READ_TIMEOUT};
use kcp_common::retry::{retry_with_backoff, RetryConfig};
use kcp_common::FIELD_MANAGER;
use kcp_remote::DEFAULT_RELAY_CAPACITY;

use controller_runner::RunnerConfig;

/// Cluster API contract label advertising the served version
const CAPI_CONTRACT_LABEL: &str = "cluster.x-k8s.io/v1beta1";

/// Cluster API control plane provider backed by Kamaji
#[derive(Parser, Debug)]
#[command(name = "kcp-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Install or update the CRD with server-side apply on start
    #[arg(long, env = "KCP_INSTALL_CRDS")]
    install_crds: bool,

    /// KamajiControlPlane objects reconciled in parallel
    #[arg(long, env = "KCP_MAX_CONCURRENT_RECONCILES", default_value_t = 1)]
    max_concurrent_reconciles: u16,

    /// Feature gates, as `Name=bool` pairs separated by commas
    #[arg(long, env = "KCP_FEATURE_GATES", default_value = "")]
    feature_gates: String,

    /// Infrastructure cluster kinds patched like the generic providers
    #[arg(long, env = "KCP_DYNAMIC_INFRASTRUCTURE_CLUSTERS", value_delimiter = ',')]
    dynamic_infrastructure_clusters: Vec<String>,

    /// Buffered change notifications from remote clusters
    #[arg(long, env = "KCP_RELAY_CAPACITY", default_value_t = DEFAULT_RELAY_CAPACITY)]
    relay_capacity: usize,

    /// Server-side timeout of watches, below the client read timeout
    #[arg(long, env = "KCP_WATCH_TIMEOUT_SECS", default_value_t = 25)]
    watch_timeout_secs: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&control_plane_crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let config = runner_config(&cli)?;
    run_controller(cli.install_crds, config).await
}

/// Validate flags into the controller wiring configuration
fn runner_config(cli: &Cli) -> anyhow::Result<RunnerConfig> {
    let features: FeatureGates = cli.feature_gates.parse()?;

    let dynamic_kinds: Vec<String> = cli
        .dynamic_infrastructure_clusters
        .iter()
        .map(|kind| kind.trim().to_string())
        .filter(|kind| !kind.is_empty())
        .collect();
    if !dynamic_kinds.is_empty() && !features.enabled(Feature::DynamicInfrastructureClusterPatch) {
        anyhow::bail!(
            "--dynamic-infrastructure-clusters requires the DynamicInfrastructureClusterPatch feature gate"
        );
    }

    let read_timeout = DEFAULT_READ_TIMEOUT.as_secs();
    if cli.watch_timeout_secs == 0 || u64::from(cli.watch_timeout_secs) >= read_timeout {
        anyhow::bail!(
            "--watch-timeout-secs must be between 1 and {} (the client read timeout is {}s)",
            read_timeout - 1,
            read_timeout
        );
    }

    Ok(RunnerConfig {
        features,
        dynamic_kinds,
        max_concurrent_reconciles: cli.max_concurrent_reconciles.max(1),
        relay_capacity: cli.relay_capacity,
        watch_timeout_secs: cli.watch_timeout_secs,
    })
}

/// KamajiControlPlane CRD carrying the Cluster API contract label
fn control_plane_crd() -> CustomResourceDefinition {
    let mut crd = KamajiControlPlane::crd();
    crd.metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(CAPI_CONTRACT_LABEL.to_string(), "v1alpha1".to_string());
    crd
}

/// Ensure the KamajiControlPlane CRD is installed
///
/// Uses server-side apply so the installed schema always matches this build.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let crd = control_plane_crd();
    let name = KamajiControlPlane::crd_name();

    tracing::info!(crd = %name, "Installing KamajiControlPlane CRD...");
    retry_with_backoff(&RetryConfig::with_max_attempts(5), "install_crd", || {
        let crds = crds.clone();
        let params = params.clone();
        let crd = crd.clone();
        async move { crds.patch(name, &params, &Patch::Apply(&crd)).await }
    })
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install KamajiControlPlane CRD: {}", e))?;

    tracing::info!("KamajiControlPlane CRD installed/updated");
    Ok(())
}

async fn run_controller(install_crds: bool, config: RunnerConfig) -> anyhow::Result<()> {
    tracing::info!("Kamaji control plane provider starting...");

    let client = create_client()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if install_crds {
        ensure_crds_installed(&client).await?;
    }

    let kamaji_installed = controller_runner::kamaji_installed(&client).await;
    if !kamaji_installed {
        tracing::warn!("kamaji.clastix.io API group not found, TenantControlPlane changes will not be watched");
    }

    controller_runner::build(client, config, kamaji_installed)
        .run()
        .await;

    tracing::info!("Kamaji control plane provider stopped");
    Ok(())
}
