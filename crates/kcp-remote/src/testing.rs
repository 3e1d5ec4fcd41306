//! Test fixtures shared across modules

use kube::client::Body;
use kube::Client;

/// Client whose API server answers every request with 503
///
/// Watches against it keep failing and backing off, which is enough to run
/// a session without a cluster.
pub(crate) fn unavailable_client() -> Client {
    let service = tower::service_fn(|_request: http::Request<Body>| async {
        http::Response::builder()
            .status(http::StatusCode::SERVICE_UNAVAILABLE)
            .body(Body::empty())
    });
    Client::new(service, "default")
}
