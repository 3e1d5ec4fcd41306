//! KamajiControlPlane controller implementation
//!
//! One pass walks the ordered convergence steps, recording each outcome as a
//! condition, and stops at the first failure. Conditions are persisted at the
//! end of every pass, successful or not.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use kcp_common::conditions::{
    track_step, ConditionSet, CONTROL_PLANE_ENDPOINT_PATCHED, FOUND_EXTERNAL_CLUSTER_REFERENCE,
    INFRASTRUCTURE_CLUSTER_PATCHED, KAMAJI_CONTROL_PLANE_INITIALIZED, KAMAJI_CONTROL_PLANE_READY,
    KUBEADM_RESOURCES_CREATED, TENANT_CONTROL_PLANE_ADDRESS_READY, TENANT_CONTROL_PLANE_CREATED,
};
use kcp_common::crd::{
    has_paused_annotation, ApiEndpoint, Cluster, KamajiControlPlane, KamajiControlPlaneStatus,
    TenantControlPlane, VersionStatus,
};
use kcp_common::features::{Feature, FeatureGates};
use kcp_common::keys::{key_for_control_plane, tenant_name, ConnectionKey};
use kcp_common::retry::retry_on_conflict;
use kcp_common::{Error, Result, EXTERNAL_REFERENCE_FINALIZER, FIELD_MANAGER};
use kcp_remote::RemoteConnectionStore;

use crate::endpoint::control_plane_endpoint;
use crate::infrastructure::{InfraClusterClient, InfrastructureAdapter, KubeInfraClusterClient};
use crate::resources::create_required_resources;
use crate::tenant::desired_tenant;

/// Delay before another pass when waiting on Cluster API or Kamaji
const REQUEUE_DELAY: Duration = Duration::from_secs(10);

/// Management cluster operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a Cluster API Cluster
    async fn get_cluster(&self, name: &str, namespace: &str) -> Result<Option<Cluster>>;

    /// Get a Secret
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>>;

    /// Get a KamajiControlPlane straight from the API server
    async fn get_control_plane(&self, name: &str, namespace: &str) -> Result<Option<KamajiControlPlane>>;

    /// Replace the status of a KamajiControlPlane
    ///
    /// With a `resource_version` the write fails with a conflict when the
    /// object changed in the meantime.
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &KamajiControlPlaneStatus,
        resource_version: Option<String>,
    ) -> Result<()>;

    /// Set `spec.controlPlaneEndpoint` of a KamajiControlPlane
    async fn patch_control_plane_endpoint(
        &self,
        name: &str,
        namespace: &str,
        endpoint: &ApiEndpoint,
    ) -> Result<()>;

    /// Add a finalizer to a KamajiControlPlane
    async fn add_finalizer(&self, name: &str, namespace: &str, finalizer: &str) -> Result<()>;

    /// Remove a finalizer from a KamajiControlPlane
    async fn remove_finalizer(&self, name: &str, namespace: &str, finalizer: &str) -> Result<()>;

    /// Server-side apply a Secret
    async fn apply_secret(&self, secret: &Secret) -> Result<()>;
}

/// Operations against the cluster hosting TenantControlPlanes
///
/// Either the management cluster or a remote one reached through an external
/// cluster reference.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TenantClient: Send + Sync {
    /// Server-side apply a TenantControlPlane, returning the live object
    async fn apply_tenant(&self, tcp: &TenantControlPlane) -> Result<TenantControlPlane>;

    /// Delete a TenantControlPlane; an absent one is not an error
    async fn delete_tenant(&self, name: &str, namespace: &str) -> Result<()>;

    /// Get a Secret next to the TenantControlPlane
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>>;
}

/// Chooses the [`TenantClient`] for a control plane
#[cfg_attr(test, automock)]
pub trait TenantConnector: Send + Sync {
    /// The management cluster
    fn local(&self) -> Arc<dyn TenantClient>;

    /// The remote cluster behind `key`, if a fresh session is running
    fn remote(&self, key: &ConnectionKey, version: &str) -> Option<Arc<dyn TenantClient>>;
}

/// [`KubeClient`] backed by a kube-rs client
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn control_planes(&self, namespace: &str) -> Api<KamajiControlPlane> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_cluster(&self, name: &str, namespace: &str) -> Result<Option<Cluster>> {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_control_plane(&self, name: &str, namespace: &str) -> Result<Option<KamajiControlPlane>> {
        Ok(self.control_planes(namespace).get_opt(name).await?)
    }

    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &KamajiControlPlaneStatus,
        resource_version: Option<String>,
    ) -> Result<()> {
        let patch = match resource_version {
            Some(rv) => json!({ "metadata": { "resourceVersion": rv }, "status": status }),
            None => json!({ "status": status }),
        };
        self.control_planes(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_control_plane_endpoint(
        &self,
        name: &str,
        namespace: &str,
        endpoint: &ApiEndpoint,
    ) -> Result<()> {
        let api = self.control_planes(namespace);
        let patch = json!({ "spec": { "controlPlaneEndpoint": endpoint } });

        retry_on_conflict("patch_control_plane_endpoint", || {
            let api = api.clone();
            let patch = patch.clone();
            async move {
                api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                Ok(())
            }
        })
        .await
        .map_err(|e| e.context("cannot update KamajiControlPlane with ControlPlaneEndpoint"))
    }

    async fn add_finalizer(&self, name: &str, namespace: &str, finalizer: &str) -> Result<()> {
        let api = self.control_planes(namespace);

        retry_on_conflict("add_finalizer", || {
            let api = api.clone();
            async move {
                let kcp = api.get(name).await?;
                let mut finalizers = kcp.finalizers().to_vec();
                if finalizers.iter().any(|f| f == finalizer) {
                    return Ok(());
                }
                finalizers.push(finalizer.to_string());

                // resourceVersion turns the merge patch into an optimistic update
                let patch = json!({
                    "metadata": {
                        "finalizers": finalizers,
                        "resourceVersion": kcp.resource_version(),
                    }
                });
                api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                Ok(())
            }
        })
        .await
    }

    async fn remove_finalizer(&self, name: &str, namespace: &str, finalizer: &str) -> Result<()> {
        let api = self.control_planes(namespace);

        let result = retry_on_conflict("remove_finalizer", || {
            let api = api.clone();
            async move {
                let kcp = api.get(name).await?;
                if !kcp.finalizers().iter().any(|f| f == finalizer) {
                    return Ok(());
                }
                let finalizers: Vec<&String> =
                    kcp.finalizers().iter().filter(|f| *f != finalizer).collect();

                let patch = json!({
                    "metadata": {
                        "finalizers": finalizers,
                        "resourceVersion": kcp.resource_version(),
                    }
                });
                api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                Ok(())
            }
        })
        .await;

        match result {
            Err(e) if e.is_not_found() => {
                debug!(kcp = %name, "KamajiControlPlane already gone");
                Ok(())
            }
            other => other,
        }
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<()> {
        let namespace = secret.namespace().unwrap_or_default();
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(
            &secret.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(secret),
        )
        .await?;
        Ok(())
    }
}

/// [`TenantClient`] backed by a kube-rs client
pub struct KubeTenantClient {
    client: Client,
}

impl KubeTenantClient {
    /// Create a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TenantClient for KubeTenantClient {
    async fn apply_tenant(&self, tcp: &TenantControlPlane) -> Result<TenantControlPlane> {
        let namespace = tcp.namespace().unwrap_or_default();
        let api: Api<TenantControlPlane> = Api::namespaced(self.client.clone(), &namespace);

        let applied = api
            .patch(
                &tcp.name_any(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(tcp),
            )
            .await
            .map_err(|e| Error::from(e).context("cannot create or update TenantControlPlane"))?;
        Ok(applied)
    }

    async fn delete_tenant(&self, name: &str, namespace: &str) -> Result<()> {
        let api: Api<TenantControlPlane> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(tenant = %name, "TenantControlPlane already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

/// [`TenantConnector`] resolving remote clusters through the connection store
pub struct StoreConnector {
    local: Arc<dyn TenantClient>,
    store: Option<Arc<RemoteConnectionStore>>,
}

impl TenantConnector for StoreConnector {
    fn local(&self) -> Arc<dyn TenantClient> {
        self.local.clone()
    }

    fn remote(&self, key: &ConnectionKey, version: &str) -> Option<Arc<dyn TenantClient>> {
        let handle = self.store.as_ref()?.get(key, version)?;
        if !handle.is_running() {
            return None;
        }
        Some(Arc::new(KubeTenantClient::new(handle.client())))
    }
}

/// Controller context
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client)
///     .features(gates)
///     .store(store)
///     .build();
/// ```
pub struct Context {
    /// Management cluster operations
    pub kube: Arc<dyn KubeClient>,
    /// Where TenantControlPlanes live
    pub tenants: Arc<dyn TenantConnector>,
    /// Infrastructure cluster access
    pub infra: Arc<dyn InfraClusterClient>,
    /// Infrastructure cluster strategy table
    pub adapter: InfrastructureAdapter,
    /// Enabled feature gates
    pub features: FeatureGates,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context from mocks
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        tenants: Arc<dyn TenantConnector>,
        infra: Arc<dyn InfraClusterClient>,
        features: FeatureGates,
    ) -> Self {
        Self {
            kube,
            tenants,
            infra,
            adapter: InfrastructureAdapter::default(),
            features,
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    infra: Option<Arc<dyn InfraClusterClient>>,
    store: Option<Arc<RemoteConnectionStore>>,
    features: FeatureGates,
    dynamic_kinds: Vec<String>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            infra: None,
            store: None,
            features: FeatureGates::default(),
            dynamic_kinds: Vec::new(),
        }
    }

    /// Override the management cluster client
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the infrastructure cluster client
    pub fn infra_client(mut self, infra: Arc<dyn InfraClusterClient>) -> Self {
        self.infra = Some(infra);
        self
    }

    /// Resolve external cluster references through this store
    pub fn store(mut self, store: Arc<RemoteConnectionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the feature gates
    pub fn features(mut self, features: FeatureGates) -> Self {
        self.features = features;
        self
    }

    /// Infrastructure cluster kinds patched like the generic providers
    pub fn dynamic_infrastructure_kinds(mut self, kinds: Vec<String>) -> Self {
        self.dynamic_kinds = kinds;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let local: Arc<dyn TenantClient> = Arc::new(KubeTenantClient::new(self.client.clone()));

        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            tenants: Arc::new(StoreConnector {
                local,
                store: self.store,
            }),
            infra: self
                .infra
                .unwrap_or_else(|| Arc::new(KubeInfraClusterClient::new(self.client.clone()))),
            adapter: InfrastructureAdapter::default().with_dynamic_kinds(self.dynamic_kinds),
            features: self.features,
        }
    }
}

/// Reconcile a KamajiControlPlane
#[instrument(skip(kcp, ctx), fields(kcp = %kcp.name_any(), namespace = %kcp.namespace().unwrap_or_default()))]
pub async fn reconcile(kcp: Arc<KamajiControlPlane>, ctx: Arc<Context>) -> Result<Action> {
    let name = kcp.name_any();
    let namespace = kcp.namespace().unwrap_or_default();

    let Some(owner) = cluster_owner(&kcp) else {
        info!("missing OwnerReference from the Cluster controller, waiting for it");
        return Ok(Action::await_change());
    };
    let Some(cluster) = ctx.kube.get_cluster(&owner, &namespace).await? else {
        info!(cluster = %owner, "Cluster may have been deleted, withdrawing reconciliation");
        return Ok(Action::await_change());
    };
    if cluster.is_paused() || has_paused_annotation(kcp.metadata.annotations.as_ref()) {
        info!("reconciliation is paused for this object");
        return Ok(Action::await_change());
    }

    if kcp.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&kcp, &ctx).await;
    }

    let snapshot = kcp.status.clone().unwrap_or_default();
    let mut status = snapshot.clone();
    let mut conditions = std::mem::take(&mut status.conditions);

    let result = converge(&kcp, cluster, &ctx, &mut status, &mut conditions).await;

    status.conditions = conditions;
    let persisted = persist_status(&name, &namespace, &ctx, &status, &snapshot).await;

    match (result, persisted) {
        (Ok(action), Ok(())) => Ok(action),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), persisted) => {
            if let Err(pe) = persisted {
                error!(error = %pe, "unable to update KamajiControlPlane conditions");
            }
            if e.is_enqueue_back() {
                info!("{e}");
                return Ok(Action::requeue(REQUEUE_DELAY));
            }
            Err(e)
        }
    }
}

/// Write the outcome of a pass on top of the stored status
///
/// The object is read again right before the write and the write is
/// conditional on its resourceVersion.
async fn persist_status(
    name: &str,
    namespace: &str,
    ctx: &Context,
    status: &KamajiControlPlaneStatus,
    snapshot: &KamajiControlPlaneStatus,
) -> Result<()> {
    retry_on_conflict("patch_status", || async move {
        let Some(latest) = ctx.kube.get_control_plane(name, namespace).await? else {
            debug!("KamajiControlPlane is gone, skipping status update");
            return Ok(());
        };
        let stored = latest.status.clone().unwrap_or_default();
        let merged = rebase_status(status.clone(), snapshot, stored);
        ctx.kube
            .patch_status(name, namespace, &merged, latest.resource_version())
            .await
    })
    .await
    .map_err(|e| e.context("cannot update KamajiControlPlane status"))
}

/// Apply what a pass changed since `snapshot` on top of the `stored` status
///
/// Fields and conditions the pass left as found keep their stored value.
fn rebase_status(
    pass: KamajiControlPlaneStatus,
    snapshot: &KamajiControlPlaneStatus,
    stored: KamajiControlPlaneStatus,
) -> KamajiControlPlaneStatus {
    fn pick<T: PartialEq>(pass: T, snapshot: &T, stored: T) -> T {
        if pass == *snapshot {
            stored
        } else {
            pass
        }
    }

    KamajiControlPlaneStatus {
        initialized: pick(pass.initialized, &snapshot.initialized, stored.initialized),
        ready: pick(pass.ready, &snapshot.ready, stored.ready),
        ready_replicas: pick(pass.ready_replicas, &snapshot.ready_replicas, stored.ready_replicas),
        replicas: pick(pass.replicas, &snapshot.replicas, stored.replicas),
        selector: pick(pass.selector, &snapshot.selector, stored.selector),
        unavailable_replicas: pick(
            pass.unavailable_replicas,
            &snapshot.unavailable_replicas,
            stored.unavailable_replicas,
        ),
        updated_replicas: pick(
            pass.updated_replicas,
            &snapshot.updated_replicas,
            stored.updated_replicas,
        ),
        external_managed_control_plane: pick(
            pass.external_managed_control_plane,
            &snapshot.external_managed_control_plane,
            stored.external_managed_control_plane,
        ),
        failure_reason: pick(pass.failure_reason, &snapshot.failure_reason, stored.failure_reason),
        failure_message: pick(pass.failure_message, &snapshot.failure_message, stored.failure_message),
        version: pick(pass.version, &snapshot.version, stored.version),
        conditions: pass.conditions.rebase(&snapshot.conditions, stored.conditions),
    }
}

async fn converge(
    kcp: &KamajiControlPlane,
    cluster: Cluster,
    ctx: &Context,
    status: &mut KamajiControlPlaneStatus,
    conditions: &mut ConditionSet,
) -> Result<Action> {
    let name = kcp.name_any();
    let namespace = kcp.namespace().unwrap_or_default();
    let generation = kcp.metadata.generation;
    status.external_managed_control_plane = Some(true);

    let delegated = kcp.external_reference().is_some();
    let tenants = if delegated {
        let remote = track_step(
            conditions,
            FOUND_EXTERNAL_CLUSTER_REFERENCE,
            generation,
            resolve_remote(kcp, ctx),
        )
        .await?;

        if !kcp.finalizers().iter().any(|f| f == EXTERNAL_REFERENCE_FINALIZER) {
            ctx.kube
                .add_finalizer(&name, &namespace, EXTERNAL_REFERENCE_FINALIZER)
                .await
                .map_err(|e| e.context("unable to update finalizers"))?;
        }
        remote
    } else {
        ctx.tenants.local()
    };

    let tcp = track_step(conditions, TENANT_CONTROL_PLANE_CREATED, generation, async {
        let desired = desired_tenant(kcp, &cluster, delegated)?;
        tenants.apply_tenant(&desired).await
    })
    .await?;

    let address = track_step(conditions, TENANT_CONTROL_PLANE_ADDRESS_READY, generation, async {
        match tcp.status_endpoint() {
            "" => Err(Error::internal_with_context(
                "TenantControlPlane",
                "Control Plane Endpoint is not yet available since unprocessed by Kamaji",
            )),
            endpoint => Ok(endpoint.to_string()),
        }
    })
    .await;
    let Ok(address) = address else {
        info!("Control Plane Endpoint still unprocessed by Kamaji, waiting for it");
        return Ok(Action::await_change());
    };

    let endpoint = track_step(conditions, CONTROL_PLANE_ENDPOINT_PATCHED, generation, async {
        let endpoint = control_plane_endpoint(kcp, &address)?;
        ctx.kube
            .patch_control_plane_endpoint(&name, &namespace, &endpoint)
            .await?;
        Ok(endpoint)
    })
    .await?;

    let Some(cluster) = ctx.kube.get_cluster(&cluster.name_any(), &namespace).await? else {
        info!("Cluster may have been deleted, withdrawing reconciliation");
        return Ok(Action::await_change());
    };

    if !ctx.features.enabled(Feature::SkipInfraClusterPatch) {
        track_step(conditions, INFRASTRUCTURE_CLUSTER_PATCHED, generation, async {
            let mut reference = cluster.spec.infrastructure_ref.clone().ok_or_else(|| {
                Error::validation_for("Cluster", "Cluster has no infrastructureRef")
            })?;
            reference.namespace.get_or_insert_with(|| namespace.clone());
            ctx.adapter
                .dispatch(ctx.infra.as_ref(), &reference, &endpoint)
                .await
        })
        .await?;
    }

    if cluster.endpoint_host().is_empty() {
        info!("Cluster Control Plane endpoint still unprocessed, enqueuing back");
        return Ok(Action::requeue(REQUEUE_DELAY));
    }
    if !cluster.infrastructure_ready() {
        info!("Cluster infrastructure is not yet ready, enqueuing back");
        return Ok(Action::requeue(REQUEUE_DELAY));
    }
    let Some(version_status) = tcp.version_status() else {
        info!("TenantControlPlane is not yet initialized, enqueuing back");
        return Ok(Action::requeue(REQUEUE_DELAY));
    };

    if version_status == VersionStatus::Ready {
        status.initialized = true;
    }
    if !status.initialized {
        info!(?version_status, "KamajiControlPlane is not yet initialized, enqueuing back");
        return Ok(Action::requeue(REQUEUE_DELAY));
    }

    track_step(conditions, KAMAJI_CONTROL_PLANE_INITIALIZED, generation, async {
        mirror_tenant_status(status, kcp, &tcp);
        Ok(())
    })
    .await?;

    track_step(
        conditions,
        KUBEADM_RESOURCES_CREATED,
        generation,
        create_required_resources(ctx.kube.as_ref(), tenants.as_ref(), &cluster, kcp, &tcp),
    )
    .await?;

    status.ready = matches!(version_status, VersionStatus::Ready | VersionStatus::Upgrading);
    let ready = status.ready;
    track_step(conditions, KAMAJI_CONTROL_PLANE_READY, generation, async {
        if ready {
            Ok(())
        } else {
            Err(Error::enqueue_back(format!(
                "TenantControlPlane in {version_status:?} status"
            )))
        }
    })
    .await?;

    info!("reconciliation completed");
    Ok(Action::await_change())
}

/// Copy replica counters, version and selector from the TenantControlPlane
fn mirror_tenant_status(
    status: &mut KamajiControlPlaneStatus,
    kcp: &KamajiControlPlane,
    tcp: &TenantControlPlane,
) {
    let Some(observed) = tcp.status.as_ref() else {
        return;
    };
    let deployment = &observed.kubernetes_resources.deployment;

    status.replicas = deployment.replicas;
    status.ready_replicas = deployment.ready_replicas;
    status.updated_replicas = deployment.updated_replicas;
    status.unavailable_replicas = deployment.unavailable_replicas;
    status.version = observed
        .kubernetes_resources
        .version
        .version
        .clone()
        .unwrap_or_default();
    status.selector = kcp
        .labels()
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
}

/// Tenant client for a delegated control plane
///
/// Checks, in order: feature gates, the cross-namespace rule, the Secret and
/// its entry, then a fresh running session for the Secret's version.
async fn resolve_remote(kcp: &KamajiControlPlane, ctx: &Context) -> Result<Arc<dyn TenantClient>> {
    if !ctx.features.external_reference_enabled() {
        return Err(Error::feature_gate("external cluster feature gates are not enabled"));
    }

    let key = key_for_control_plane(kcp)
        .ok_or_else(|| Error::validation_for("KamajiControlPlane", "no externalClusterReference"))?;
    let (secret_namespace, secret_name) = key
        .secret()
        .ok_or_else(|| Error::remote(&key, "malformed connection key"))?;

    let cross_namespace = Some(secret_namespace.to_string()) != kcp.namespace();
    if cross_namespace && !ctx.features.enabled(Feature::ExternalClusterReferenceCrossNamespace) {
        return Err(Error::feature_gate(
            "the ExternalClusterReference is enforcing kubeconfig in the same Namespace, ExternalClusterReferenceCrossNamespace must be enabled",
        ));
    }

    let secret = ctx
        .kube
        .get_secret(secret_name, secret_namespace)
        .await?
        .ok_or_else(|| Error::remote(&key, "could not get external cluster reference secret"))?;

    let data = secret
        .data
        .as_ref()
        .filter(|data| !data.is_empty())
        .ok_or_else(|| {
            Error::remote(&key, "could not extract kubeconfig for external cluster reference, secret is empty")
        })?;
    if !key.data_key().is_some_and(|k| data.contains_key(k)) {
        return Err(Error::remote(
            &key,
            "could not extract kubeconfig for external cluster reference, key is empty",
        ));
    }

    let version = secret.resource_version().unwrap_or_default();
    ctx.tenants
        .remote(&key, &version)
        .ok_or_else(|| Error::remote(&key, "remote connection is not yet initialized"))
}

async fn handle_deletion(kcp: &KamajiControlPlane, ctx: &Context) -> Result<Action> {
    let has_finalizer = kcp.finalizers().iter().any(|f| f == EXTERNAL_REFERENCE_FINALIZER);
    if !has_finalizer || kcp.external_reference().is_none() {
        info!("waiting for KamajiControlPlane finalizers");
        return Ok(Action::await_change());
    }

    let tenants = resolve_remote(kcp, ctx)
        .await
        .map_err(|e| e.context("cannot generate remote client for deletion"))?;

    let (tenant, tenant_namespace) = tenant_name(kcp);
    tenants.delete_tenant(&tenant, &tenant_namespace).await?;
    info!(tenant = %tenant, namespace = %tenant_namespace, "remote TenantControlPlane has been deleted");

    ctx.kube
        .remove_finalizer(
            &kcp.name_any(),
            &kcp.namespace().unwrap_or_default(),
            EXTERNAL_REFERENCE_FINALIZER,
        )
        .await?;
    info!("finalizer has been removed");

    Ok(Action::await_change())
}

/// Name of the owning Cluster API Cluster
fn cluster_owner(kcp: &KamajiControlPlane) -> Option<String> {
    kcp.owner_references()
        .iter()
        .find(|owner| owner.kind == "Cluster" && owner.api_version.starts_with("cluster.x-k8s.io/"))
        .map(|owner| owner.name.clone())
}

/// Error policy for the controller
pub fn error_policy(kcp: Arc<KamajiControlPlane>, error: &Error, _ctx: Arc<Context>) -> Action {
    if error.is_retryable() {
        warn!(?error, kcp = %kcp.name_any(), "reconciliation failed");
    } else {
        error!(?error, kcp = %kcp.name_any(), "reconciliation failed, configuration change required");
    }
    Action::requeue(Duration::from_secs(5))
}
