//! Connection keys and remote naming
//!
//! A [`ConnectionKey`] identifies one kubeconfig entry of one Secret as
//! `namespace/name/dataKey`. Secrets and KamajiControlPlanes derive keys with
//! the same encoding, so looking up "which control planes use this entry" is an
//! exact match.

use std::fmt;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;

use crate::crd::{KamajiControlPlane, TenantControlPlane};
use crate::BACK_REFERENCE_LABEL;

/// Name prefix of remote TenantControlPlanes, followed by the owner UID
pub const REMOTE_TENANT_PREFIX: &str = "kcp-";

/// Logical identity of one remote connection
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionKey(String);

impl ConnectionKey {
    /// Key of a Secret data entry
    pub fn new(namespace: &str, name: &str, data_key: &str) -> Self {
        Self(format!("{namespace}/{name}/{data_key}"))
    }

    /// Split the key into `(namespace, name, data_key)`
    pub fn parts(&self) -> Option<(&str, &str, &str)> {
        let mut parts = self.0.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(ns), Some(name), Some(key)) => Some((ns, name, key)),
            _ => None,
        }
    }

    /// Namespace and name of the Secret holding the entry
    pub fn secret(&self) -> Option<(&str, &str)> {
        self.parts().map(|(ns, name, _)| (ns, name))
    }

    /// Name of the data entry holding the kubeconfig
    pub fn data_key(&self) -> Option<&str> {
        self.parts().map(|(_, _, key)| key)
    }

    /// The raw encoded key
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Every key a Secret can satisfy, one per data entry
pub fn keys_for_secret(secret: &Secret) -> Vec<ConnectionKey> {
    let namespace = secret.namespace().unwrap_or_default();
    let name = secret.name_any();

    secret
        .data
        .iter()
        .flat_map(|data| data.keys())
        .map(|data_key| ConnectionKey::new(&namespace, &name, data_key))
        .collect()
}

/// The single key a KamajiControlPlane requires, if it delegates
pub fn key_for_control_plane(kcp: &KamajiControlPlane) -> Option<ConnectionKey> {
    let reference = kcp.external_reference()?;
    let namespace = reference
        .kubeconfig_secret_namespace
        .clone()
        .filter(|ns| !ns.is_empty())
        .or_else(|| kcp.namespace())
        .unwrap_or_default();

    Some(ConnectionKey::new(
        &namespace,
        &reference.kubeconfig_secret_name,
        &reference.kubeconfig_secret_key,
    ))
}

/// Name and namespace of the TenantControlPlane backing a KamajiControlPlane
///
/// Delegated objects live in the reference's deployment namespace and are
/// named after the owner UID unless `keepDefaultName` is set. Local objects
/// mirror the owner's name and namespace.
pub fn tenant_name(kcp: &KamajiControlPlane) -> (String, String) {
    match kcp.external_reference() {
        Some(reference) if reference.keep_default_name => {
            (kcp.name_any(), reference.deployment_namespace.clone())
        }
        Some(reference) => (
            format!(
                "{REMOTE_TENANT_PREFIX}{}",
                kcp.uid().unwrap_or_default()
            ),
            reference.deployment_namespace.clone(),
        ),
        None => (kcp.name_any(), kcp.namespace().unwrap_or_default()),
    }
}

/// Owner UID embedded in a remote TenantControlPlane
///
/// The back-reference label wins; otherwise the UID is recovered from the
/// `kcp-` name prefix. Objects carrying neither are not ours.
pub fn back_reference(tcp: &TenantControlPlane) -> Option<String> {
    if let Some(uid) = tcp.labels().get(BACK_REFERENCE_LABEL) {
        if !uid.is_empty() {
            return Some(uid.clone());
        }
    }

    tcp.metadata
        .name
        .as_deref()
        .and_then(|name| name.strip_prefix(REMOTE_TENANT_PREFIX))
        .filter(|uid| !uid.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ExternalClusterReference, KamajiControlPlaneSpec, TenantControlPlaneSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn sample_secret(entries: &[&str]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("remote".to_string()),
                namespace: Some("infra".to_string()),
                ..Default::default()
            },
            data: Some(
                entries
                    .iter()
                    .map(|k| (k.to_string(), ByteString(b"kubeconfig".to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn sample_kcp(reference: Option<ExternalClusterReference>) -> KamajiControlPlane {
        let mut kcp = KamajiControlPlane::new(
            "tenant-00",
            KamajiControlPlaneSpec {
                version: "1.31.0".to_string(),
                ..Default::default()
            },
        );
        kcp.metadata.namespace = Some("infra".to_string());
        kcp.metadata.uid = Some("0b1c".to_string());
        kcp.spec.deployment.external_cluster_reference = reference;
        kcp
    }

    fn reference(key: &str) -> ExternalClusterReference {
        ExternalClusterReference {
            kubeconfig_secret_name: "remote".to_string(),
            kubeconfig_secret_key: key.to_string(),
            deployment_namespace: "tenants".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn two_entries_yield_two_keys_matching_their_control_planes() {
        let keys = keys_for_secret(&sample_secret(&["admin.conf", "value"]));
        assert_eq!(keys.len(), 2);
        assert_ne!(keys[0], keys[1]);

        for entry in ["admin.conf", "value"] {
            let kcp_key = key_for_control_plane(&sample_kcp(Some(reference(entry)))).unwrap();
            assert!(keys.contains(&kcp_key));
            assert_eq!(kcp_key.data_key(), Some(entry));
            assert_eq!(kcp_key.secret(), Some(("infra", "remote")));
        }
    }

    #[test]
    fn secret_without_data_yields_no_keys() {
        let mut secret = sample_secret(&[]);
        assert!(keys_for_secret(&secret).is_empty());
        secret.data = None;
        assert!(keys_for_secret(&secret).is_empty());
    }

    #[test]
    fn control_plane_without_reference_has_no_key() {
        assert!(key_for_control_plane(&sample_kcp(None)).is_none());
    }

    #[test]
    fn explicit_secret_namespace_wins() {
        let mut r = reference("value");
        r.kubeconfig_secret_namespace = Some("secrets".to_string());
        let key = key_for_control_plane(&sample_kcp(Some(r))).unwrap();
        assert_eq!(key.as_str(), "secrets/remote/value");
    }

    #[test]
    fn tenant_names() {
        assert_eq!(
            tenant_name(&sample_kcp(None)),
            ("tenant-00".to_string(), "infra".to_string())
        );
        assert_eq!(
            tenant_name(&sample_kcp(Some(reference("value")))),
            ("kcp-0b1c".to_string(), "tenants".to_string())
        );

        let mut keep = reference("value");
        keep.keep_default_name = true;
        assert_eq!(
            tenant_name(&sample_kcp(Some(keep))),
            ("tenant-00".to_string(), "tenants".to_string())
        );
    }

    #[test]
    fn back_reference_prefers_label_then_prefix() {
        let mut tcp = TenantControlPlane::new("kcp-0b1c", TenantControlPlaneSpec::default());
        assert_eq!(back_reference(&tcp).as_deref(), Some("0b1c"));

        tcp.metadata.labels = Some(BTreeMap::from([(
            BACK_REFERENCE_LABEL.to_string(),
            "ffee".to_string(),
        )]));
        assert_eq!(back_reference(&tcp).as_deref(), Some("ffee"));

        let unrelated = TenantControlPlane::new("billing", TenantControlPlaneSpec::default());
        assert!(back_reference(&unrelated).is_none());
        let bare = TenantControlPlane::new("kcp-", TenantControlPlaneSpec::default());
        assert!(back_reference(&bare).is_none());
    }
}
