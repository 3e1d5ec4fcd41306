//! Controller runner - builds the controller futures of the provider
//!
//! The KamajiControlPlane controller always runs. The credential Secret
//! controller, the reference index and the change relay only exist when an
//! external cluster reference feature gate is on.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::discovery::Discovery;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use kcp_common::crd::{KamajiControlPlane, TenantControlPlane};
use kcp_common::features::FeatureGates;
use kcp_controller::{error_policy, reconcile, Context};
use kcp_remote::controller::{orphan_triggers, referenced_secret};
use kcp_remote::{relay, run_index, ReferenceIndex, RemoteConnectionStore, RemoteContext};

/// API group serving TenantControlPlanes
const KAMAJI_GROUP: &str = "kamaji.clastix.io";

/// Buffered orphaned connection keys between the index and the Secret controller
const ORPHAN_CAPACITY: usize = 128;

type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Validated wiring configuration
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub features: FeatureGates,
    pub dynamic_kinds: Vec<String>,
    pub max_concurrent_reconciles: u16,
    pub relay_capacity: usize,
    pub watch_timeout_secs: u32,
}

/// Controller futures plus the tasks and session store they share
pub struct Runner {
    /// Controllers, ending on SIGTERM/SIGINT
    pub controllers: Vec<ControllerFuture>,
    /// Tasks that only end once `shutdown` is cancelled
    pub background: Vec<ControllerFuture>,
    /// Cancelled once every controller has stopped
    pub shutdown: CancellationToken,
    pub store: Arc<RemoteConnectionStore>,
}

impl Runner {
    /// Run until the controllers stop, then wind down background tasks and
    /// remote sessions
    pub async fn run(self) {
        let Runner {
            controllers,
            background,
            shutdown,
            store,
        } = self;

        tracing::info!(controllers = controllers.len(), "Running controllers");
        let controllers = async move {
            futures::future::join_all(controllers).await;
            tracing::info!("Controllers stopped, shutting down background tasks");
            shutdown.cancel();
        };
        futures::future::join(controllers, futures::future::join_all(background)).await;

        store.stop_all();
    }
}

/// Whether the Kamaji API group is served
pub async fn kamaji_installed(client: &Client) -> bool {
    match Discovery::new(client.clone())
        .filter(&[KAMAJI_GROUP])
        .run()
        .await
    {
        Ok(discovery) => discovery.has_group(KAMAJI_GROUP),
        Err(e) => {
            tracing::warn!(error = %e, "API discovery failed, assuming Kamaji is not installed");
            false
        }
    }
}

/// Build every controller future
pub fn build(client: Client, config: RunnerConfig, kamaji_installed: bool) -> Runner {
    let store = Arc::new(RemoteConnectionStore::new());
    let watcher_config = || WatcherConfig::default().timeout(config.watch_timeout_secs);

    let mut ctx_builder = Context::builder(client.clone())
        .features(config.features.clone())
        .dynamic_infrastructure_kinds(config.dynamic_kinds.clone());

    let shutdown = CancellationToken::new();
    let mut controllers: Vec<ControllerFuture> = Vec::new();
    let mut background: Vec<ControllerFuture> = Vec::new();
    let mut control_planes = Controller::new(
        Api::<KamajiControlPlane>::all(client.clone()),
        watcher_config(),
    )
    .with_config(ControllerConfig::default().concurrency(config.max_concurrent_reconciles))
    .owns(Api::<Secret>::all(client.clone()), watcher_config());

    if kamaji_installed {
        control_planes = control_planes.owns(
            Api::<TenantControlPlane>::all(client.clone()),
            watcher_config(),
        );
    }

    if config.features.external_reference_enabled() {
        tracing::info!("External cluster references enabled");
        ctx_builder = ctx_builder.store(store.clone());

        let index = Arc::new(ReferenceIndex::new());
        let (relay_tx, relay_rx) = relay::channel(config.relay_capacity);
        let (orphans_tx, orphans_rx) = mpsc::channel(ORPHAN_CAPACITY);

        control_planes = control_planes.reconcile_on(relay_rx.into_trigger_stream());

        background.push(Box::pin(run_index(
            Api::<KamajiControlPlane>::all(client.clone()),
            watcher_config(),
            index.clone(),
            orphans_tx,
            shutdown.child_token(),
        )));

        let remote_ctx = Arc::new(RemoteContext {
            store: store.clone(),
            index: index.clone(),
            relay: relay_tx,
            watch_timeout_secs: config.watch_timeout_secs,
        });

        tracing::info!("- Secret controller");
        controllers.push(Box::pin(
            Controller::new(Api::<Secret>::all(client.clone()), watcher_config())
                .watches(
                    Api::<KamajiControlPlane>::all(client.clone()),
                    watcher_config(),
                    referenced_secret,
                )
                .reconcile_on(orphan_triggers(orphans_rx, store.clone(), index))
                .shutdown_on_signal()
                .run(
                    kcp_remote::reconcile,
                    kcp_remote::error_policy,
                    remote_ctx,
                )
                .for_each(log_reconcile_result("Secret")),
        ));
    }

    let ctx = Arc::new(ctx_builder.build());

    tracing::info!("- KamajiControlPlane controller");
    controllers.push(Box::pin(
        control_planes
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("KamajiControlPlane")),
    ));

    Runner {
        controllers,
        background,
        shutdown,
        store,
    }
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
