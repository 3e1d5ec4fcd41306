//! Kubernetes client construction

use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients, longer than any watch timeout
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the cluster the operator runs in
pub async fn create_client() -> Result<Client, Error> {
    let mut config = Config::infer().await.map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
    })?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Client for a remote cluster described by raw kubeconfig bytes
pub async fn client_from_kubeconfig(kubeconfig: &[u8]) -> Result<Client, Error> {
    let raw = std::str::from_utf8(kubeconfig)
        .map_err(|e| Error::serialization(format!("kubeconfig is not valid UTF-8: {}", e)))?;
    let kubeconfig = Kubeconfig::from_yaml(raw)
        .map_err(|e| Error::serialization(format!("failed to parse kubeconfig: {}", e)))?;

    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context(
                "client_from_kubeconfig",
                format!("failed to load kubeconfig: {}", e),
            )
        })?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

    Client::try_from(config).map_err(|e| {
        Error::internal_with_context(
            "client_from_kubeconfig",
            format!("failed to create client: {}", e),
        )
    })
}
