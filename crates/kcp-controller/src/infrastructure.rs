//! Infrastructure cluster adapters
//!
//! Cluster API infrastructure providers expect the control plane endpoint in
//! different places, and some of them insist on assigning it themselves. Each
//! kind maps to a [`Strategy`]; the table is fixed at startup and can be
//! extended with extra kinds treated as patch-only.

use std::collections::HashMap;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::{json, Value};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use kcp_common::crd::{ApiEndpoint, ObjectReference};
use kcp_common::{Error, Result};

/// How the endpoint reaches an infrastructure cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Write `spec.controlPlaneEndpoint`, and `status.ready=true` when `status` is set
    Patch {
        /// Also flag the object ready
        status: bool,
    },
    /// The provider owns the address; verify it matches
    Check,
    /// Verify, patching only when the provider left the address unset
    CheckThenPatch,
    /// Write `spec.apiServerFixedIP` and `spec.apiServerPort`
    FixedApiServer,
}

/// Access to arbitrary infrastructure cluster objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InfraClusterClient: Send + Sync {
    /// Fetch the object as JSON
    async fn get(&self, reference: &ObjectReference) -> Result<Value>;

    /// Merge-patch the object
    async fn patch(&self, reference: &ObjectReference, patch: Value) -> Result<()>;

    /// Merge-patch the object's status subresource
    async fn patch_status(&self, reference: &ObjectReference, patch: Value) -> Result<()>;
}

/// [`InfraClusterClient`] backed by the dynamic API
pub struct KubeInfraClusterClient {
    client: Client,
}

impl KubeInfraClusterClient {
    /// Create a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, reference: &ObjectReference) -> Api<DynamicObject> {
        let (group, version) = reference
            .api_version
            .split_once('/')
            .unwrap_or(("", reference.api_version.as_str()));
        let gvk = GroupVersionKind::gvk(group, version, &reference.kind);
        let resource = ApiResource::from_gvk(&gvk);
        let namespace = reference.namespace.as_deref().unwrap_or("default");
        Api::namespaced_with(self.client.clone(), namespace, &resource)
    }
}

#[async_trait]
impl InfraClusterClient for KubeInfraClusterClient {
    async fn get(&self, reference: &ObjectReference) -> Result<Value> {
        let object = self
            .api(reference)
            .get(&reference.name)
            .await
            .map_err(|e| Error::from(e).context(format!("cannot retrieve the {} resource", reference.kind)))?;
        serde_json::to_value(object).map_err(|e| Error::serialization(e.to_string()))
    }

    async fn patch(&self, reference: &ObjectReference, patch: Value) -> Result<()> {
        self.api(reference)
            .patch(&reference.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| {
                Error::from(e).context(format!("cannot patch the {} resource", reference.kind))
            })?;
        Ok(())
    }

    async fn patch_status(&self, reference: &ObjectReference, patch: Value) -> Result<()> {
        self.api(reference)
            .patch_status(&reference.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| {
                Error::from(e).context(format!("cannot patch the {} status", reference.kind))
            })?;
        Ok(())
    }
}

/// Strategy table keyed by infrastructure cluster kind
#[derive(Clone, Debug)]
pub struct InfrastructureAdapter {
    strategies: HashMap<String, Strategy>,
}

impl Default for InfrastructureAdapter {
    fn default() -> Self {
        let strategies = [
            ("AWSCluster", Strategy::Patch { status: false }),
            ("HetznerCluster", Strategy::Patch { status: false }),
            ("IonosCloudCluster", Strategy::Patch { status: false }),
            ("KubevirtCluster", Strategy::Patch { status: true }),
            ("NutanixCluster", Strategy::Patch { status: true }),
            ("PacketCluster", Strategy::Patch { status: true }),
            ("Metal3Cluster", Strategy::Check),
            ("OpenStackCluster", Strategy::FixedApiServer),
            ("TinkerbellCluster", Strategy::CheckThenPatch),
            ("VSphereCluster", Strategy::CheckThenPatch),
        ]
        .into_iter()
        .map(|(kind, strategy)| (kind.to_string(), strategy))
        .collect();

        Self { strategies }
    }
}

impl InfrastructureAdapter {
    /// Treat extra kinds as patch-only; built-in kinds keep their strategy
    pub fn with_dynamic_kinds(mut self, kinds: impl IntoIterator<Item = String>) -> Self {
        for kind in kinds {
            self.strategies
                .entry(kind)
                .or_insert(Strategy::Patch { status: false });
        }
        self
    }

    /// Strategy registered for a kind
    pub fn strategy(&self, kind: &str) -> Option<Strategy> {
        self.strategies.get(kind).copied()
    }

    /// Bring the referenced infrastructure cluster in line with `endpoint`
    pub async fn dispatch(
        &self,
        client: &dyn InfraClusterClient,
        reference: &ObjectReference,
        endpoint: &ApiEndpoint,
    ) -> Result<()> {
        let strategy = self.strategy(&reference.kind).ok_or_else(|| Error::UnsupportedProvider {
            kind: reference.kind.clone(),
        })?;
        debug!(kind = %reference.kind, name = %reference.name, ?strategy, "Dispatching infrastructure cluster");

        match strategy {
            Strategy::Patch { status } => patch(client, reference, endpoint, status).await,
            Strategy::Check => check(client, reference, endpoint).await,
            Strategy::CheckThenPatch => match check(client, reference, endpoint).await {
                Err(e) if e.is_unmanaged_address() => {
                    info!(kind = %reference.kind, name = %reference.name, "Address unmanaged by the provider, patching");
                    patch(client, reference, endpoint, false).await
                }
                other => other,
            },
            Strategy::FixedApiServer => {
                let fixed = json!({
                    "spec": {
                        "apiServerFixedIP": endpoint.host,
                        "apiServerPort": endpoint.port,
                    }
                });
                client.patch(reference, fixed).await
            }
        }
    }
}

async fn patch(
    client: &dyn InfraClusterClient,
    reference: &ObjectReference,
    endpoint: &ApiEndpoint,
    status: bool,
) -> Result<()> {
    let spec = json!({
        "spec": {
            "controlPlaneEndpoint": {
                "host": endpoint.host,
                "port": endpoint.port,
            }
        }
    });
    client.patch(reference, spec).await?;

    if status {
        client
            .patch_status(reference, json!({ "status": { "ready": true } }))
            .await?;
    }
    Ok(())
}

async fn check(
    client: &dyn InfraClusterClient,
    reference: &ObjectReference,
    endpoint: &ApiEndpoint,
) -> Result<()> {
    let object = client.get(reference).await?;
    let unmanaged = || Error::UnmanagedAddress {
        kind: reference.kind.clone(),
    };

    let current = object
        .pointer("/spec/controlPlaneEndpoint")
        .filter(|v| !v.is_null())
        .ok_or_else(unmanaged)?;
    let host = current.get("host").and_then(Value::as_str).unwrap_or_default();
    let port = current.get("port").and_then(Value::as_i64).unwrap_or_default();

    if host.is_empty() && port == 0 {
        return Err(unmanaged());
    }

    let mismatch = |field: &str| Error::AddressMismatch {
        kind: reference.kind.clone(),
        field: field.to_string(),
    };
    if host != endpoint.host {
        return Err(mismatch("host"));
    }
    if port != i64::from(endpoint.port) {
        return Err(mismatch("port"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn reference(kind: &str) -> ObjectReference {
        ObjectReference {
            api_version: "infrastructure.cluster.x-k8s.io/v1beta1".to_string(),
            kind: kind.to_string(),
            name: "tenant-00".to_string(),
            namespace: Some("infra".to_string()),
        }
    }

    fn endpoint() -> ApiEndpoint {
        ApiEndpoint::new("10.0.0.1", 6443)
    }

    /// Mock recording every spec and status patch
    fn recording_client(current: Value) -> (MockInfraClusterClient, Arc<Mutex<Vec<Value>>>) {
        let patches = Arc::new(Mutex::new(Vec::new()));
        let mut client = MockInfraClusterClient::new();
        client.expect_get().returning(move |_| Ok(current.clone()));
        let spec_patches = patches.clone();
        client.expect_patch().returning(move |_, patch| {
            spec_patches.lock().unwrap().push(patch);
            Ok(())
        });
        let status_patches = patches.clone();
        client.expect_patch_status().returning(move |_, patch| {
            status_patches.lock().unwrap().push(patch);
            Ok(())
        });
        (client, patches)
    }

    #[tokio::test]
    async fn patch_only_writes_the_endpoint() {
        let (client, patches) = recording_client(json!({}));

        InfrastructureAdapter::default()
            .dispatch(&client, &reference("AWSCluster"), &endpoint())
            .await
            .unwrap();

        let patches = patches.lock().unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0]["spec"]["controlPlaneEndpoint"]["host"], "10.0.0.1");
        assert_eq!(patches[0]["spec"]["controlPlaneEndpoint"]["port"], 6443);
    }

    #[tokio::test]
    async fn patch_with_status_flags_ready() {
        let (client, patches) = recording_client(json!({}));

        InfrastructureAdapter::default()
            .dispatch(&client, &reference("KubevirtCluster"), &endpoint())
            .await
            .unwrap();

        let patches = patches.lock().unwrap();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[1], json!({ "status": { "ready": true } }));
    }

    #[tokio::test]
    async fn check_only_reports_unset_address_as_unmanaged() {
        let (client, patches) = recording_client(json!({ "spec": {} }));

        let err = InfrastructureAdapter::default()
            .dispatch(&client, &reference("Metal3Cluster"), &endpoint())
            .await
            .unwrap_err();

        assert!(err.is_unmanaged_address());
        assert!(patches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn check_only_reports_mismatches() {
        let current = json!({ "spec": { "controlPlaneEndpoint": { "host": "10.0.0.1", "port": 443 } } });
        let (client, _) = recording_client(current);

        let err = InfrastructureAdapter::default()
            .dispatch(&client, &reference("Metal3Cluster"), &endpoint())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::AddressMismatch { ref field, .. } if field == "port"));
    }

    #[tokio::test]
    async fn check_then_patch_patches_only_unmanaged_addresses() {
        let zeroed = json!({ "spec": { "controlPlaneEndpoint": { "host": "", "port": 0 } } });
        let (client, patches) = recording_client(zeroed);

        InfrastructureAdapter::default()
            .dispatch(&client, &reference("VSphereCluster"), &endpoint())
            .await
            .unwrap();
        assert_eq!(patches.lock().unwrap().len(), 1);

        let other = json!({ "spec": { "controlPlaneEndpoint": { "host": "10.0.0.9", "port": 6443 } } });
        let (client, patches) = recording_client(other);

        let err = InfrastructureAdapter::default()
            .dispatch(&client, &reference("TinkerbellCluster"), &endpoint())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AddressMismatch { ref field, .. } if field == "host"));
        assert!(patches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn openstack_uses_the_fixed_api_server_fields() {
        let (client, patches) = recording_client(json!({}));

        InfrastructureAdapter::default()
            .dispatch(&client, &reference("OpenStackCluster"), &endpoint())
            .await
            .unwrap();

        assert_eq!(
            patches.lock().unwrap()[0],
            json!({ "spec": { "apiServerFixedIP": "10.0.0.1", "apiServerPort": 6443 } })
        );
    }

    #[tokio::test]
    async fn unknown_kinds_are_unsupported() {
        let (client, _) = recording_client(json!({}));

        let err = InfrastructureAdapter::default()
            .dispatch(&client, &reference("ScalewayCluster"), &endpoint())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UnsupportedProvider { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn dynamic_kinds_do_not_override_builtins() {
        let adapter = InfrastructureAdapter::default()
            .with_dynamic_kinds(["ScalewayCluster".to_string(), "Metal3Cluster".to_string()]);

        assert_eq!(
            adapter.strategy("ScalewayCluster"),
            Some(Strategy::Patch { status: false })
        );
        assert_eq!(adapter.strategy("Metal3Cluster"), Some(Strategy::Check));
    }
}
