//! TenantControlPlane: the Kamaji resource a KamajiControlPlane is converged into
//!
//! Only the fields written or read by this provider are modeled. Writes use
//! server-side apply, so fields owned by other managers are left alone.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::DeploymentStrategy;
use k8s_openapi::api::core::v1::{
    Affinity, Container, ResourceRequirements, Toleration, TopologySpreadConstraint, Volume,
    VolumeMount,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::preserve_unknown_fields;

/// Kamaji TenantControlPlane
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kamaji.clastix.io",
    version = "v1alpha1",
    kind = "TenantControlPlane",
    plural = "tenantcontrolplanes",
    namespaced,
    status = "TenantControlPlaneStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct TenantControlPlaneSpec {
    /// DataStore name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_store: Option<String>,
    /// DataStore schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_store_schema: Option<String>,
    /// DataStore username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_store_username: Option<String>,
    /// Control plane workload settings
    #[serde(default)]
    pub control_plane: TenantControlPlaneComponents,
    /// Kubernetes settings
    #[serde(default)]
    pub kubernetes: TenantKubernetes,
    /// Network profile
    #[serde(default)]
    pub network_profile: NetworkProfile,
    /// Kamaji addons
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub addons: Option<serde_json::Value>,
}

/// Deployment, Service, Ingress and Gateway of the tenant control plane
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TenantControlPlaneComponents {
    /// Control plane Deployment
    #[serde(default)]
    pub deployment: TenantDeployment,
    /// Control plane Service
    #[serde(default)]
    pub service: TenantService,
    /// Ingress exposure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<TenantIngress>,
    /// Gateway API exposure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<TenantGateway>,
}

/// Labels and annotations added to a generated object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct AdditionalMetadata {
    /// Extra labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Extra annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Per-component lists
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentValues<T> {
    /// kube-apiserver
    #[serde(default, rename = "apiServer", skip_serializing_if = "Option::is_none")]
    pub api_server: Option<T>,
    /// kube-controller-manager
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_manager: Option<T>,
    /// kube-scheduler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<T>,
    /// kine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kine: Option<T>,
}

/// Image overrides
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySettings {
    /// Registry hosting the control plane images
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    /// kube-apiserver image
    #[serde(default, rename = "apiServerImage", skip_serializing_if = "Option::is_none")]
    pub api_server_image: Option<String>,
    /// kube-controller-manager image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_manager_image: Option<String>,
    /// kube-scheduler image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_image: Option<String>,
}

/// Control plane Deployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TenantDeployment {
    /// Replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Image overrides
    #[serde(default)]
    pub registry_settings: RegistrySettings,
    /// Extra arguments per component
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_args: Option<ComponentValues<Vec<String>>>,
    /// Resources per component
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ComponentValues<ResourceRequirements>>,
    /// Extra volume mounts per component
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_volume_mounts: Option<ComponentValues<Vec<VolumeMount>>>,
    /// Node selector
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    /// RuntimeClass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_class_name: Option<String>,
    /// ServiceAccount
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    /// Rollout strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<DeploymentStrategy>,
    /// Affinity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    /// Tolerations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    /// Topology spread constraints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topology_spread_constraints: Vec<TopologySpreadConstraint>,
    /// Extra init containers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_init_containers: Vec<Container>,
    /// Extra containers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_containers: Vec<Container>,
    /// Extra volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_volumes: Vec<Volume>,
}

/// Control plane Service
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TenantService {
    /// Service type
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_type: String,
    /// Extra Service metadata
    #[serde(default)]
    pub additional_metadata: AdditionalMetadata,
}

/// Ingress exposure
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TenantIngress {
    /// IngressClass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class_name: Option<String>,
    /// Hostname
    pub hostname: String,
    /// Extra Ingress metadata
    #[serde(default)]
    pub additional_metadata: AdditionalMetadata,
}

/// Parent Gateway of a route
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct GatewayParentRef {
    /// Gateway name
    pub name: String,
    /// Gateway namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Gateway API exposure
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TenantGateway {
    /// Hostname without port
    pub hostname: String,
    /// Parent Gateways
    #[serde(default)]
    pub parent_refs: Vec<GatewayParentRef>,
    /// Extra route metadata
    #[serde(default)]
    pub additional_metadata: AdditionalMetadata,
}

/// Kubernetes settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TenantKubernetes {
    /// Version with the `v` prefix
    #[serde(default)]
    pub version: String,
    /// Kubelet settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub kubelet: Option<serde_json::Value>,
    /// Admission controllers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub admission_controllers: Vec<String>,
}

/// Network profile
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkProfile {
    /// Advertised address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// API server port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    /// Certificate SANs
    #[serde(default, rename = "certSANs", skip_serializing_if = "Vec::is_empty")]
    pub cert_sans: Vec<String>,
    /// Service CIDR
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_cidr: Option<String>,
    /// Pod CIDR
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_cidr: Option<String>,
    /// DNS Service IPs
    #[serde(default, rename = "dnsServiceIPs", skip_serializing_if = "Vec::is_empty")]
    pub dns_service_ips: Vec<String>,
    /// Cluster domain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_domain: Option<String>,
    /// LoadBalancer class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_class: Option<String>,
    /// LoadBalancer source ranges
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub load_balancer_source_ranges: Vec<String>,
}

/// Observed TenantControlPlane state
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TenantControlPlaneStatus {
    /// `host:port` the control plane is reachable at
    #[serde(default)]
    pub control_plane_endpoint: String,
    /// Kubeconfig Secrets
    #[serde(default)]
    pub kubeconfig: KubeconfigStatus,
    /// Certificate Secrets
    #[serde(default)]
    pub certificates: CertificatesStatus,
    /// Workload state
    #[serde(default)]
    pub kubernetes_resources: KubernetesResourcesStatus,
}

/// Reference to a generated Secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretStatus {
    /// Secret name, empty until Kamaji generated it
    #[serde(default)]
    pub secret_name: String,
}

/// Kubeconfig Secrets
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct KubeconfigStatus {
    /// Admin kubeconfig
    #[serde(default)]
    pub admin: SecretStatus,
}

/// Certificate Secrets
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct CertificatesStatus {
    /// Certificate Authority
    #[serde(default)]
    pub ca: SecretStatus,
}

/// Lifecycle of the tenant control plane version
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum VersionStatus {
    /// Being provisioned
    Provisioning,
    /// Rolling out a new version
    Upgrading,
    /// Migrating to another DataStore
    Migrating,
    /// Serving
    Ready,
    /// Not serving
    NotReady,
    /// Put to sleep
    Sleeping,
    /// Rotating the Certificate Authority
    CertificateAuthorityRotating,
    /// DataStore accepts reads only
    WriteLimited,
    /// Any status this provider does not know about
    #[serde(other)]
    Unknown,
}

/// Reported Kubernetes version
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct KubernetesVersion {
    /// Running version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Version lifecycle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<VersionStatus>,
}

/// Control plane Deployment state
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentReplicas {
    /// Total replicas
    #[serde(default)]
    pub replicas: i32,
    /// Ready replicas
    #[serde(default)]
    pub ready_replicas: i32,
    /// Updated replicas
    #[serde(default)]
    pub updated_replicas: i32,
    /// Unavailable replicas
    #[serde(default)]
    pub unavailable_replicas: i32,
    /// Deployment selector as a string
    #[serde(default)]
    pub selector: String,
}

/// Workload state of the tenant control plane
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct KubernetesResourcesStatus {
    /// Version state
    #[serde(default)]
    pub version: KubernetesVersion,
    /// Deployment state
    #[serde(default)]
    pub deployment: DeploymentReplicas,
}

impl TenantControlPlane {
    /// Version lifecycle reported by Kamaji, if any
    pub fn version_status(&self) -> Option<VersionStatus> {
        self.status
            .as_ref()
            .and_then(|s| s.kubernetes_resources.version.status)
    }

    /// `host:port` endpoint reported by Kamaji, empty when not yet assigned
    pub fn status_endpoint(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.control_plane_endpoint.as_str())
            .unwrap_or_default()
    }
}
