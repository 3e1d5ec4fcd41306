//! Common types for the Kamaji control plane provider: CRDs, conditions,
//! connection keys, feature gates, errors, and retry utilities

#![deny(missing_docs)]

pub mod conditions;
pub mod crd;
pub mod error;
pub mod features;
pub mod keys;
pub mod kube_utils;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every server-side apply issued by the operator
pub const FIELD_MANAGER: &str = "kamaji-control-plane-provider";

/// Finalizer guarding remote delegated objects of a KamajiControlPlane
pub const EXTERNAL_REFERENCE_FINALIZER: &str = "ecr.kamaji.clastix.io/finalizer";

/// Annotation pausing reconciliation of Cluster API objects
pub const PAUSED_ANNOTATION: &str = "cluster.x-k8s.io/paused";

/// Label carrying the owning Cluster API cluster name
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Label embedded in remote TenantControlPlanes pointing back at the owning KamajiControlPlane UID
pub const BACK_REFERENCE_LABEL: &str = "controlplane.cluster.x-k8s.io/kamajicontrolplane-uid";
