//! Secrets Cluster API expects next to a control plane
//!
//! `<cluster>-kubeconfig` carries the admin kubeconfig under `value`, and
//! `<cluster>-ca` the CA pair under `tls.crt`/`tls.key`. Both are copied from
//! the Secrets Kamaji generated, which live wherever the TenantControlPlane
//! lives.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use tracing::debug;

use kcp_common::crd::{Cluster, KamajiControlPlane, TenantControlPlane};
use kcp_common::{Error, Result, CLUSTER_NAME_LABEL};

use crate::controller::{KubeClient, TenantClient};

/// Key of the admin kubeconfig in Kamaji's Secret
pub const ADMIN_KUBECONFIG_KEY: &str = "admin.conf";
/// Key of the CA certificate in Kamaji's Secret
pub const CA_CERT_KEY: &str = "ca.crt";
/// Key of the CA private key in Kamaji's Secret
pub const CA_PRIVATE_KEY_KEY: &str = "ca.key";

/// Build `<cluster>-kubeconfig` from Kamaji's admin kubeconfig Secret
pub fn kubeconfig_secret(
    cluster: &Cluster,
    kcp: &KamajiControlPlane,
    tcp: &TenantControlPlane,
    source: &Secret,
) -> Result<Secret> {
    let value = source_entry(source, ADMIN_KUBECONFIG_KEY, "admin kubeconfig")?;

    Ok(Secret {
        metadata: target_meta(cluster, kcp, tcp, "kubeconfig", BTreeMap::new()),
        data: Some(BTreeMap::from([("value".to_string(), value)])),
        ..Default::default()
    })
}

/// Build `<cluster>-ca` from Kamaji's CA Secret
pub fn ca_secret(
    cluster: &Cluster,
    kcp: &KamajiControlPlane,
    tcp: &TenantControlPlane,
    source: &Secret,
) -> Result<Secret> {
    let crt = source_entry(source, CA_CERT_KEY, "Certificate Authority")?;
    let key = source_entry(source, CA_PRIVATE_KEY_KEY, "Certificate Authority")?;

    Ok(Secret {
        metadata: target_meta(cluster, kcp, tcp, "ca", source.labels().clone()),
        data: Some(BTreeMap::from([
            ("tls.crt".to_string(), crt),
            ("tls.key".to_string(), key),
        ])),
        ..Default::default()
    })
}

/// Replicate both Secrets into the Cluster namespace
///
/// Fails with the enqueue-back sentinel while Kamaji has not published the
/// source Secret names yet.
pub async fn create_required_resources(
    kube: &dyn KubeClient,
    tenants: &dyn TenantClient,
    cluster: &Cluster,
    kcp: &KamajiControlPlane,
    tcp: &TenantControlPlane,
) -> Result<()> {
    let status = tcp.status.clone().unwrap_or_default();
    let tcp_namespace = tcp.namespace().unwrap_or_default();
    let cluster_namespace = cluster.namespace().unwrap_or_default();

    let admin = status.kubeconfig.admin.secret_name;
    if admin.is_empty() {
        return Err(Error::enqueue_back("admin kubeconfig still unprocessed by Kamaji"));
    }
    let source = tenants
        .get_secret(&admin, &tcp_namespace)
        .await?
        .ok_or_else(|| Error::enqueue_back(format!("admin kubeconfig Secret {admin} not found")))?;
    kube.apply_secret(&kubeconfig_secret(cluster, kcp, tcp, &source)?)
        .await
        .map_err(|e| e.context("cannot create or update admin kubeconfig Secret"))?;

    let ca = status.certificates.ca.secret_name;
    if ca.is_empty() {
        return Err(Error::enqueue_back("CA still unprocessed by Kamaji"));
    }

    let target = format!("{}-ca", cluster.name_any());
    if let Some(existing) = kube.get_secret(&target, &cluster_namespace).await? {
        if owned_by_tenant(&existing) {
            debug!(secret = %target, "CA Secret owned by a TenantControlPlane, leaving it alone");
            return Ok(());
        }
    }

    let source = tenants
        .get_secret(&ca, &tcp_namespace)
        .await?
        .ok_or_else(|| Error::enqueue_back(format!("CA Secret {ca} not found")))?;
    kube.apply_secret(&ca_secret(cluster, kcp, tcp, &source)?)
        .await
        .map_err(|e| e.context("cannot create or update CA Secret"))
}

fn owned_by_tenant(secret: &Secret) -> bool {
    secret
        .owner_references()
        .first()
        .is_some_and(|owner| owner.kind == "TenantControlPlane")
}

fn source_entry(source: &Secret, key: &str, what: &str) -> Result<ByteString> {
    source
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .cloned()
        .ok_or_else(|| {
            Error::validation_for(
                "TenantControlPlane",
                format!("missing {key} from the {what} Secret {}", source.name_any()),
            )
        })
}

fn target_meta(
    cluster: &Cluster,
    kcp: &KamajiControlPlane,
    tcp: &TenantControlPlane,
    kind: &str,
    mut labels: BTreeMap<String, String>,
) -> ObjectMeta {
    let cluster_name = cluster.name_any();
    labels.insert(CLUSTER_NAME_LABEL.to_string(), cluster_name.clone());
    labels.insert("kamaji.clastix.io/component".to_string(), "capi".to_string());
    labels.insert("kamaji.clastix.io/secret".to_string(), kind.to_string());
    labels.insert("kamaji.clastix.io/cluster".to_string(), cluster_name.clone());
    labels.insert("kamaji.clastix.io/tcp".to_string(), tcp.name_any());

    ObjectMeta {
        name: Some(format!("{cluster_name}-{kind}")),
        namespace: cluster.namespace(),
        labels: Some(labels),
        owner_references: kcp.controller_owner_ref(&()).map(|owner| vec![owner]),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{MockKubeClient, MockTenantClient};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kcp_common::crd::{
        CertificatesStatus, ClusterSpec, KamajiControlPlaneSpec, KubeconfigStatus, SecretStatus,
        TenantControlPlaneSpec, TenantControlPlaneStatus,
    };
    use std::sync::{Arc, Mutex};

    fn sample_cluster() -> Cluster {
        let mut cluster = Cluster::new("tenant-00", ClusterSpec::default());
        cluster.metadata.namespace = Some("infra".to_string());
        cluster
    }

    fn sample_kcp() -> KamajiControlPlane {
        let mut kcp = KamajiControlPlane::new("tenant-00", KamajiControlPlaneSpec::default());
        kcp.metadata.namespace = Some("infra".to_string());
        kcp.metadata.uid = Some("0b1c".to_string());
        kcp
    }

    fn sample_tcp(admin: &str, ca: &str) -> TenantControlPlane {
        let mut tcp = TenantControlPlane::new("kcp-0b1c", TenantControlPlaneSpec::default());
        tcp.metadata.namespace = Some("tenants".to_string());
        tcp.status = Some(TenantControlPlaneStatus {
            kubeconfig: KubeconfigStatus {
                admin: SecretStatus {
                    secret_name: admin.to_string(),
                },
            },
            certificates: CertificatesStatus {
                ca: SecretStatus {
                    secret_name: ca.to_string(),
                },
            },
            ..Default::default()
        });
        tcp
    }

    fn source_secret(name: &str, entries: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("tenants".to_string()),
                ..Default::default()
            },
            data: Some(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn tenant_secrets() -> MockTenantClient {
        let mut tenants = MockTenantClient::new();
        tenants.expect_get_secret().returning(|name, _| {
            Ok(Some(match name {
                "admin-kubeconfig" => source_secret(name, &[(ADMIN_KUBECONFIG_KEY, "kubeconfig")]),
                _ => source_secret(name, &[(CA_CERT_KEY, "crt"), (CA_PRIVATE_KEY_KEY, "key")]),
            }))
        });
        tenants
    }

    #[test]
    fn kubeconfig_secret_follows_the_capi_contract() {
        let source = source_secret("admin-kubeconfig", &[(ADMIN_KUBECONFIG_KEY, "kubeconfig")]);
        let secret = kubeconfig_secret(
            &sample_cluster(),
            &sample_kcp(),
            &sample_tcp("admin-kubeconfig", ""),
            &source,
        )
        .unwrap();

        assert_eq!(secret.name_any(), "tenant-00-kubeconfig");
        assert_eq!(secret.namespace().as_deref(), Some("infra"));
        assert_eq!(
            secret.labels().get(CLUSTER_NAME_LABEL).map(String::as_str),
            Some("tenant-00")
        );
        assert_eq!(secret.data.unwrap()["value"].0, b"kubeconfig");
        assert_eq!(secret.metadata.owner_references.unwrap()[0].kind, "KamajiControlPlane");
    }

    #[test]
    fn ca_secret_requires_both_halves() {
        let source = source_secret("ca", &[(CA_CERT_KEY, "crt")]);
        let result = ca_secret(&sample_cluster(), &sample_kcp(), &sample_tcp("", "ca"), &source);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn missing_source_names_enqueue_back() {
        let kube = MockKubeClient::new();
        let tenants = MockTenantClient::new();

        let err = create_required_resources(
            &kube,
            &tenants,
            &sample_cluster(),
            &sample_kcp(),
            &sample_tcp("", ""),
        )
        .await
        .unwrap_err();

        assert!(err.is_enqueue_back());
    }

    #[tokio::test]
    async fn both_secrets_are_replicated() {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let recorded = applied.clone();
        let mut kube = MockKubeClient::new();
        kube.expect_get_secret().returning(|_, _| Ok(None));
        kube.expect_apply_secret().returning(move |secret| {
            recorded.lock().unwrap().push(secret.name_any());
            Ok(())
        });

        create_required_resources(
            &kube,
            &tenant_secrets(),
            &sample_cluster(),
            &sample_kcp(),
            &sample_tcp("admin-kubeconfig", "ca"),
        )
        .await
        .unwrap();

        assert_eq!(
            *applied.lock().unwrap(),
            vec!["tenant-00-kubeconfig", "tenant-00-ca"]
        );
    }

    #[tokio::test]
    async fn tenant_owned_ca_is_left_alone() {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let recorded = applied.clone();
        let mut kube = MockKubeClient::new();
        kube.expect_get_secret().returning(|name, _| {
            let mut secret = source_secret(name, &[]);
            secret.metadata.owner_references = Some(vec![OwnerReference {
                kind: "TenantControlPlane".to_string(),
                ..Default::default()
            }]);
            Ok(Some(secret))
        });
        kube.expect_apply_secret().returning(move |secret| {
            recorded.lock().unwrap().push(secret.name_any());
            Ok(())
        });

        create_required_resources(
            &kube,
            &tenant_secrets(),
            &sample_cluster(),
            &sample_kcp(),
            &sample_tcp("admin-kubeconfig", "ca"),
        )
        .await
        .unwrap();

        assert_eq!(*applied.lock().unwrap(), vec!["tenant-00-kubeconfig"]);
    }
}
