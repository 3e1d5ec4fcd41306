//! KamajiControlPlane CRD: the desired control plane of a Cluster API cluster
//!
//! Example:
//! ```yaml
//! apiVersion: controlplane.cluster.x-k8s.io/v1alpha1
//! kind: KamajiControlPlane
//! metadata:
//!   name: tenant-00
//!   namespace: default
//! spec:
//!   dataStoreName: default
//!   replicas: 2
//!   version: 1.31.0
//!   network:
//!     serviceType: LoadBalancer
//!   deployment:
//!     externalClusterReference:
//!       kubeconfigSecretName: management-kubeconfig
//!       kubeconfigSecretKey: value
//!       deploymentNamespace: tenants
//! ```

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::DeploymentStrategy;
use k8s_openapi::api::core::v1::{
    Affinity, Container, ResourceRequirements, Toleration, TopologySpreadConstraint, Volume,
    VolumeMount,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{preserve_unknown_fields, ApiEndpoint};
use crate::conditions::ConditionSet;

/// Desired state of a Kamaji-managed control plane
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "controlplane.cluster.x-k8s.io",
    version = "v1alpha1",
    kind = "KamajiControlPlane",
    plural = "kamajicontrolplanes",
    shortname = "ktcp",
    namespaced,
    status = "KamajiControlPlaneStatus",
    scale = r#"{"specReplicasPath":".spec.replicas","statusReplicasPath":".status.replicas","labelSelectorPath":".status.selector"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Initialized","type":"boolean","jsonPath":".status.initialized"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KamajiControlPlaneSpec {
    /// Name of the Kamaji DataStore backing the control plane
    #[serde(default)]
    pub data_store_name: String,

    /// Schema (or database name) used in the DataStore
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_store_schema: Option<String>,

    /// Username used to connect to the DataStore
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_store_username: Option<String>,

    /// Kamaji addons, passed through unchanged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub addons: Option<serde_json::Value>,

    /// Admission controllers enabled on the API server
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub admission_controllers: Vec<String>,

    /// Container registry for control plane images
    #[serde(default, rename = "registry", skip_serializing_if = "Option::is_none")]
    pub container_registry: Option<String>,

    /// kube-controller-manager settings
    #[serde(default)]
    pub controller_manager: ControlPlaneComponent,

    /// kube-apiserver settings
    #[serde(default)]
    pub api_server: ControlPlaneComponent,

    /// kube-scheduler settings
    #[serde(default)]
    pub scheduler: ControlPlaneComponent,

    /// kine settings
    #[serde(default)]
    pub kine: KineComponent,

    /// Kubelet configuration used by joining nodes, passed through unchanged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub kubelet: Option<serde_json::Value>,

    /// How the control plane is exposed
    #[serde(default)]
    pub network: NetworkComponent,

    /// Control plane Deployment settings
    #[serde(default)]
    pub deployment: DeploymentComponent,

    /// Number of control plane replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Kubernetes version, with or without the `v` prefix
    pub version: String,

    /// Endpoint of the control plane, filled in by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<ApiEndpoint>,
}

/// Settings shared by the kube-apiserver, controller-manager and scheduler
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneComponent {
    /// Additional volume mounts for the component container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_volume_mounts: Vec<VolumeMount>,
    /// Additional command line arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
    /// Compute resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    /// Image override for the component
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image_name: Option<String>,
}

/// kine settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KineComponent {
    /// Additional command line arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
    /// Compute resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

/// Hostname based exposure through an Ingress
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressComponent {
    /// IngressClass to use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    /// Hostname, optionally with a port (defaults to 443)
    pub hostname: String,
    /// Extra labels for the Ingress
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_labels: BTreeMap<String, String>,
    /// Extra annotations for the Ingress
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_annotations: BTreeMap<String, String>,
}

/// Hostname based exposure through a Gateway API route
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayComponent {
    /// Hostname, optionally with a port
    pub hostname: String,
    /// Parent Gateway name
    pub name: String,
    /// Parent Gateway namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Extra labels for the route
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_labels: BTreeMap<String, String>,
    /// Extra annotations for the route
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_annotations: BTreeMap<String, String>,
}

/// LoadBalancer Service options
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerConfig {
    /// LoadBalancer class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_class: Option<String>,
    /// Allowed source ranges
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub load_balancer_source_ranges: Vec<String>,
}

/// Network exposure of the control plane
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkComponent {
    /// Ingress exposure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressComponent>,
    /// Gateway API exposure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayComponent>,
    /// Service type (ClusterIP, NodePort, LoadBalancer)
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Address advertised by the API server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_address: Option<String>,
    /// Extra labels for the Service
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub service_labels: BTreeMap<String, String>,
    /// Extra annotations for the Service
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub service_annotations: BTreeMap<String, String>,
    /// Additional certificate SANs, hosts only
    #[serde(default, rename = "certSANs", skip_serializing_if = "Vec::is_empty")]
    pub cert_sans: Vec<String>,
    /// DNS Service IPs of the workload cluster
    #[serde(default, rename = "dnsServiceIPs", skip_serializing_if = "Vec::is_empty")]
    pub dns_service_ips: Vec<String>,
    /// LoadBalancer options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_config: Option<LoadBalancerConfig>,
}

fn default_service_type() -> String {
    "LoadBalancer".to_string()
}

/// Where the TenantControlPlane must be created instead of the management cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalClusterReference {
    /// Secret holding the kubeconfig of the remote cluster
    pub kubeconfig_secret_name: String,
    /// Key of the Secret holding the kubeconfig
    pub kubeconfig_secret_key: String,
    /// Namespace of the Secret, defaults to the KamajiControlPlane namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig_secret_namespace: Option<String>,
    /// Namespace of the remote cluster where the TenantControlPlane is deployed
    pub deployment_namespace: String,
    /// Keep the KamajiControlPlane name instead of the UID-derived one
    #[serde(default)]
    pub keep_default_name: bool,
}

/// Control plane Deployment settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentComponent {
    /// Node selector for control plane Pods
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    /// RuntimeClass for control plane Pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_class_name: Option<String>,
    /// ServiceAccount for control plane Pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    /// Deployment rollout strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<DeploymentStrategy>,
    /// Pod affinity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    /// Pod tolerations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    /// Pod topology spread constraints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topology_spread_constraints: Vec<TopologySpreadConstraint>,
    /// Extra init containers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_init_containers: Vec<Container>,
    /// Extra containers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_containers: Vec<Container>,
    /// Extra volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_volumes: Vec<Volume>,
    /// Delegate the TenantControlPlane to another cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_cluster_reference: Option<ExternalClusterReference>,
}

/// Observed state of a KamajiControlPlane
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KamajiControlPlaneStatus {
    /// The control plane API server has been reachable at least once
    #[serde(default)]
    pub initialized: bool,
    /// The control plane is serving requests
    #[serde(default)]
    pub ready: bool,
    /// Ready control plane replicas
    #[serde(default)]
    pub ready_replicas: i32,
    /// Total control plane replicas
    #[serde(default)]
    pub replicas: i32,
    /// Label selector for the scale subresource
    #[serde(default)]
    pub selector: String,
    /// Unavailable control plane replicas
    #[serde(default)]
    pub unavailable_replicas: i32,
    /// Replicas running the desired template
    #[serde(default)]
    pub updated_replicas: i32,
    /// Always true: the control plane is not made of Machines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_managed_control_plane: Option<bool>,
    /// Terminal failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Terminal failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    /// Kubernetes version reported by the TenantControlPlane
    #[serde(default)]
    pub version: String,
    /// Progress of each reconciliation step
    #[serde(default, skip_serializing_if = "ConditionSet::is_empty")]
    pub conditions: ConditionSet,
}

impl KamajiControlPlane {
    /// External cluster reference, if the TenantControlPlane is delegated
    pub fn external_reference(&self) -> Option<&ExternalClusterReference> {
        self.spec.deployment.external_cluster_reference.as_ref()
    }
}
