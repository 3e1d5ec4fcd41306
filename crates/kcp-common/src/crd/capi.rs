//! Cluster API `Cluster`, reduced to the fields this provider consumes

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ApiEndpoint;
use crate::PAUSED_ANNOTATION;

/// Cluster API Cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Cluster",
    plural = "clusters",
    namespaced,
    status = "ClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Reconciliation of the cluster is paused
    #[serde(default)]
    pub paused: bool,
    /// Cluster network settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_network: Option<ClusterNetwork>,
    /// Control plane endpoint, as seen by CAPI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<ApiEndpoint>,
    /// Infrastructure provider cluster object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectReference>,
}

/// Network ranges of a cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetwork {
    /// API server port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server_port: Option<i32>,
    /// Service CIDRs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<NetworkRanges>,
    /// Pod CIDRs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pods: Option<NetworkRanges>,
    /// Service DNS domain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_domain: Option<String>,
}

/// CIDR blocks
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRanges {
    /// CIDR blocks
    #[serde(default)]
    pub cidr_blocks: Vec<String>,
}

/// Typed reference to another object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    /// API version of the referent
    #[serde(default)]
    pub api_version: String,
    /// Kind of the referent
    #[serde(default)]
    pub kind: String,
    /// Name of the referent
    #[serde(default)]
    pub name: String,
    /// Namespace of the referent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Observed state of a Cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Infrastructure provider finished provisioning
    #[serde(default)]
    pub infrastructure_ready: bool,
}

impl Cluster {
    /// Whether reconciliation is paused by spec or annotation
    pub fn is_paused(&self) -> bool {
        self.spec.paused || has_paused_annotation(self.metadata.annotations.as_ref())
    }

    /// Whether the infrastructure provider reported ready
    pub fn infrastructure_ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.infrastructure_ready)
            .unwrap_or(false)
    }

    /// Control plane host known to CAPI, empty when unset
    pub fn endpoint_host(&self) -> &str {
        self.spec
            .control_plane_endpoint
            .as_ref()
            .map(|e| e.host.as_str())
            .unwrap_or_default()
    }
}

/// Whether the paused annotation is present on an object
pub fn has_paused_annotation(annotations: Option<&BTreeMap<String, String>>) -> bool {
    annotations.is_some_and(|a| a.contains_key(PAUSED_ANNOTATION))
}
