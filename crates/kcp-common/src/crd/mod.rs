//! Custom resource definitions consumed and exposed by the provider

mod capi;
mod control_plane;
mod tenant;
mod types;

pub use capi::{
    has_paused_annotation, Cluster, ClusterNetwork, ClusterSpec, ClusterStatus, NetworkRanges,
    ObjectReference,
};
pub use control_plane::{
    ControlPlaneComponent, DeploymentComponent, ExternalClusterReference, GatewayComponent,
    IngressComponent, KamajiControlPlane, KamajiControlPlaneSpec, KamajiControlPlaneStatus,
    KineComponent, LoadBalancerConfig, NetworkComponent,
};
pub use tenant::{
    AdditionalMetadata, CertificatesStatus, ComponentValues, DeploymentReplicas,
    GatewayParentRef, KubeconfigStatus, KubernetesResourcesStatus, KubernetesVersion,
    NetworkProfile, RegistrySettings, SecretStatus, TenantControlPlane,
    TenantControlPlaneComponents, TenantControlPlaneSpec, TenantControlPlaneStatus,
    TenantDeployment, TenantGateway, TenantIngress, TenantKubernetes, TenantService,
    VersionStatus,
};
pub use types::{preserve_unknown_fields, ApiEndpoint, Condition, ConditionStatus};
