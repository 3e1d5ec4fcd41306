//! Control plane endpoint derivation

use kcp_common::crd::{ApiEndpoint, KamajiControlPlane};
use kcp_common::{Error, Result};

/// Port assumed for an ingress hostname without an explicit port
pub const DEFAULT_INGRESS_PORT: i32 = 443;

/// Split `host:port`, accepting bracketed IPv6 hosts
///
/// Returns `None` for a bare host, including unbracketed IPv6 literals.
pub fn split_host_port(value: &str) -> Option<(&str, &str)> {
    if let Some(rest) = value.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        return tail.strip_prefix(':').map(|port| (host, port));
    }

    let (host, port) = value.rsplit_once(':')?;
    if host.contains(':') {
        return None;
    }
    Some((host, port))
}

/// Endpoint advertised for a control plane
///
/// Starts from the `host:port` Kamaji reports; an ingress hostname takes
/// precedence and defaults to port 443.
pub fn control_plane_endpoint(kcp: &KamajiControlPlane, status_endpoint: &str) -> Result<ApiEndpoint> {
    let (host, port) = split_host_port(status_endpoint).ok_or_else(|| {
        Error::internal_with_context(
            "control_plane_endpoint",
            format!("cannot split the Kamaji endpoint {status_endpoint:?} into host and port"),
        )
    })?;
    let port: u16 = port.parse().map_err(|e| {
        Error::internal_with_context(
            "control_plane_endpoint",
            format!("invalid Kamaji endpoint port {port:?}: {e}"),
        )
    })?;

    let Some(ingress) = kcp.spec.network.ingress.as_ref() else {
        return Ok(ApiEndpoint::new(host, i32::from(port)));
    };

    if !ingress.hostname.contains(':') {
        return Ok(ApiEndpoint::new(ingress.hostname.as_str(), DEFAULT_INGRESS_PORT));
    }

    let (host, port) = split_host_port(&ingress.hostname).ok_or_else(|| {
        Error::validation_for(
            "KamajiControlPlane",
            format!("cannot split the ingress hostname {:?}", ingress.hostname),
        )
    })?;
    let port: i32 = port.parse().map_err(|e| {
        Error::validation_for(
            "KamajiControlPlane",
            format!("invalid ingress hostname port {port:?}: {e}"),
        )
    })?;
    Ok(ApiEndpoint::new(host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kcp_common::crd::{IngressComponent, KamajiControlPlaneSpec};

    fn sample_kcp(ingress: Option<&str>) -> KamajiControlPlane {
        let mut kcp = KamajiControlPlane::new("tenant-00", KamajiControlPlaneSpec::default());
        kcp.spec.network.ingress = ingress.map(|hostname| IngressComponent {
            hostname: hostname.to_string(),
            ..Default::default()
        });
        kcp
    }

    #[test]
    fn splits_hosts_and_ports() {
        assert_eq!(split_host_port("10.0.0.1:6443"), Some(("10.0.0.1", "6443")));
        assert_eq!(split_host_port("[fd00::1]:6443"), Some(("fd00::1", "6443")));
        assert_eq!(split_host_port("api.example.com"), None);
        assert_eq!(split_host_port("fd00::1"), None);
        assert_eq!(split_host_port("[fd00::1]"), None);
    }

    #[test]
    fn uses_the_kamaji_endpoint_without_ingress() {
        let endpoint = control_plane_endpoint(&sample_kcp(None), "10.0.0.1:6443").unwrap();
        assert_eq!(endpoint, ApiEndpoint::new("10.0.0.1", 6443));
    }

    #[test]
    fn ingress_hostname_overrides_with_default_port() {
        let endpoint =
            control_plane_endpoint(&sample_kcp(Some("tenant.example.com")), "10.0.0.1:6443")
                .unwrap();
        assert_eq!(endpoint, ApiEndpoint::new("tenant.example.com", 443));
    }

    #[test]
    fn ingress_hostname_keeps_an_explicit_port() {
        let endpoint =
            control_plane_endpoint(&sample_kcp(Some("tenant.example.com:8443")), "10.0.0.1:6443")
                .unwrap();
        assert_eq!(endpoint, ApiEndpoint::new("tenant.example.com", 8443));
    }

    #[test]
    fn malformed_kamaji_endpoint_is_an_error() {
        assert!(control_plane_endpoint(&sample_kcp(None), "10.0.0.1").is_err());
        assert!(control_plane_endpoint(&sample_kcp(None), "10.0.0.1:http").is_err());
    }
}
