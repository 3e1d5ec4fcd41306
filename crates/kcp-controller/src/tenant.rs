//! Desired TenantControlPlane for a KamajiControlPlane
//!
//! The result is applied with server-side apply, so only fields set here are
//! owned by the provider. Delegated objects carry the back-reference label and
//! no owner reference; local ones are owned by their KamajiControlPlane.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use kcp_common::crd::{
    AdditionalMetadata, Cluster, ComponentValues, GatewayParentRef, KamajiControlPlane,
    NetworkProfile, RegistrySettings, TenantControlPlane, TenantControlPlaneComponents,
    TenantControlPlaneSpec, TenantDeployment, TenantGateway, TenantIngress, TenantKubernetes,
    TenantService,
};
use kcp_common::keys::tenant_name;
use kcp_common::{Error, Result, BACK_REFERENCE_LABEL};

use crate::endpoint::split_host_port;

/// Annotation never copied onto the TenantControlPlane
const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Build the TenantControlPlane a KamajiControlPlane converges into
///
/// `delegated` selects the remote naming scheme and metadata.
pub fn desired_tenant(
    kcp: &KamajiControlPlane,
    cluster: &Cluster,
    delegated: bool,
) -> Result<TenantControlPlane> {
    let (name, namespace) = tenant_name(kcp);
    let spec = tenant_spec(kcp, cluster)?;

    let annotations: BTreeMap<String, String> = kcp
        .annotations()
        .iter()
        .filter(|(k, _)| k.as_str() != LAST_APPLIED_ANNOTATION)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mut labels = kcp.labels().clone();
    let owner_references = if delegated {
        let uid = kcp.uid().ok_or_else(|| {
            Error::validation_for("KamajiControlPlane", "delegated control plane has no UID yet")
        })?;
        labels.insert(BACK_REFERENCE_LABEL.to_string(), uid);
        None
    } else {
        kcp.controller_owner_ref(&()).map(|owner| vec![owner])
    };

    let mut tcp = TenantControlPlane::new(&name, spec);
    tcp.metadata = ObjectMeta {
        name: Some(name),
        namespace: Some(namespace),
        labels: Some(labels),
        annotations: Some(annotations),
        owner_references,
        ..Default::default()
    };
    Ok(tcp)
}

fn tenant_spec(kcp: &KamajiControlPlane, cluster: &Cluster) -> Result<TenantControlPlaneSpec> {
    let spec = &kcp.spec;
    let network = &spec.network;

    for san in &network.cert_sans {
        if split_host_port(san).is_some() {
            return Err(Error::validation_for(
                "KamajiControlPlane",
                format!("a certificate SAN must be made of host only with no port, entry {san} is invalid"),
            ));
        }
    }
    let mut cert_sans = network.cert_sans.clone();

    let gateway = network.gateway.as_ref().map(|gateway| {
        let host = host_only(&gateway.hostname);
        cert_sans.push(host.to_string());
        TenantGateway {
            hostname: host.to_string(),
            parent_refs: vec![GatewayParentRef {
                name: gateway.name.clone(),
                namespace: gateway.namespace.clone(),
            }],
            additional_metadata: AdditionalMetadata {
                labels: gateway.extra_labels.clone(),
                annotations: gateway.extra_annotations.clone(),
            },
        }
    });

    let ingress = network.ingress.as_ref().map(|ingress| {
        cert_sans.push(host_only(&ingress.hostname).to_string());
        TenantIngress {
            ingress_class_name: ingress.class_name.clone(),
            hostname: ingress.hostname.clone(),
            additional_metadata: AdditionalMetadata {
                labels: ingress.extra_labels.clone(),
                annotations: ingress.extra_annotations.clone(),
            },
        }
    });

    let cluster_network = cluster.spec.cluster_network.as_ref();
    let first_block = |ranges: Option<&kcp_common::crd::NetworkRanges>| {
        ranges.and_then(|r| r.cidr_blocks.first().cloned())
    };
    let load_balancer = network.load_balancer_config.as_ref();

    let network_profile = NetworkProfile {
        address: network.service_address.clone(),
        port: cluster_network.and_then(|n| n.api_server_port),
        cert_sans,
        service_cidr: first_block(cluster_network.and_then(|n| n.services.as_ref())),
        pod_cidr: first_block(cluster_network.and_then(|n| n.pods.as_ref())),
        dns_service_ips: network.dns_service_ips.clone(),
        cluster_domain: cluster_network.and_then(|n| n.service_domain.clone()),
        load_balancer_class: load_balancer.and_then(|lb| lb.load_balancer_class.clone()),
        load_balancer_source_ranges: load_balancer
            .map(|lb| lb.load_balancer_source_ranges.clone())
            .unwrap_or_default(),
    };

    let deployment = TenantDeployment {
        replicas: spec.replicas,
        registry_settings: RegistrySettings {
            registry: spec.container_registry.clone(),
            api_server_image: spec.api_server.container_image_name.clone(),
            controller_manager_image: spec.controller_manager.container_image_name.clone(),
            scheduler_image: spec.scheduler.container_image_name.clone(),
        },
        extra_args: Some(ComponentValues {
            api_server: Some(spec.api_server.extra_args.clone()),
            controller_manager: Some(spec.controller_manager.extra_args.clone()),
            scheduler: Some(spec.scheduler.extra_args.clone()),
            kine: Some(spec.kine.extra_args.clone()),
        }),
        resources: Some(ComponentValues {
            api_server: spec.api_server.resources.clone(),
            controller_manager: spec.controller_manager.resources.clone(),
            scheduler: spec.scheduler.resources.clone(),
            kine: spec.kine.resources.clone(),
        }),
        additional_volume_mounts: Some(ComponentValues {
            api_server: Some(spec.api_server.extra_volume_mounts.clone()),
            controller_manager: Some(spec.controller_manager.extra_volume_mounts.clone()),
            scheduler: Some(spec.scheduler.extra_volume_mounts.clone()),
            kine: None,
        }),
        node_selector: spec.deployment.node_selector.clone(),
        runtime_class_name: spec.deployment.runtime_class_name.clone(),
        service_account_name: spec.deployment.service_account_name.clone(),
        strategy: spec.deployment.strategy.clone(),
        affinity: spec.deployment.affinity.clone(),
        tolerations: spec.deployment.tolerations.clone(),
        topology_spread_constraints: spec.deployment.topology_spread_constraints.clone(),
        additional_init_containers: spec.deployment.extra_init_containers.clone(),
        additional_containers: spec.deployment.extra_containers.clone(),
        additional_volumes: spec.deployment.extra_volumes.clone(),
    };

    Ok(TenantControlPlaneSpec {
        data_store: non_empty(&spec.data_store_name),
        data_store_schema: spec.data_store_schema.clone().filter(|s| !s.is_empty()),
        data_store_username: spec.data_store_username.clone().filter(|s| !s.is_empty()),
        control_plane: TenantControlPlaneComponents {
            deployment,
            service: TenantService {
                service_type: network.service_type.clone(),
                additional_metadata: AdditionalMetadata {
                    labels: network.service_labels.clone(),
                    annotations: network.service_annotations.clone(),
                },
            },
            ingress,
            gateway,
        },
        kubernetes: TenantKubernetes {
            version: prefixed_version(&spec.version),
            kubelet: spec.kubelet.clone(),
            admission_controllers: spec.admission_controllers.clone(),
        },
        network_profile,
        addons: spec.addons.clone(),
    })
}

/// Kubernetes version with the `v` prefix Kamaji expects
pub fn prefixed_version(version: &str) -> String {
    if version.starts_with('v') {
        version.to_string()
    } else {
        format!("v{version}")
    }
}

fn host_only(hostname: &str) -> &str {
    split_host_port(hostname)
        .map(|(host, _)| host)
        .unwrap_or(hostname)
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}
