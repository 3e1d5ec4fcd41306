//! Credential Secret controller
//!
//! Drives the session lifecycle. For every key a Secret can satisfy it stops
//! sessions nobody references anymore, keeps fresh ones, and replaces missing
//! or stale ones. kube-rs never runs two reconciles for the same Secret at
//! once, which serializes the per-key stop-then-add sequence.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use kcp_common::crd::KamajiControlPlane;
use kcp_common::keys::{key_for_control_plane, keys_for_secret, ConnectionKey};
use kcp_common::{Error, Result};

use crate::index::ReferenceIndex;
use crate::relay::RelaySender;
use crate::session::RemoteWatchSession;
use crate::store::RemoteConnectionStore;

/// Requeue delay while the reference index has not finished its first listing
const INDEX_NOT_READY_REQUEUE: Duration = Duration::from_secs(2);

/// Shared state of the credential controller
pub struct RemoteContext {
    /// Live sessions
    pub store: Arc<RemoteConnectionStore>,
    /// Which control planes reference which keys
    pub index: Arc<ReferenceIndex>,
    /// Publishing half handed to every session
    pub relay: RelaySender,
    /// Server-side timeout of remote watches
    pub watch_timeout_secs: u32,
}

/// What to do with one connection key
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Nobody references the key; tear down its session
    Stop(ConnectionKey),
    /// A fresh session is registered
    Keep(ConnectionKey),
    /// Start a session, stopping a stale one first when `restart` is set
    Start {
        /// Key to connect
        key: ConnectionKey,
        /// Whether a stale session is registered
        restart: bool,
    },
}

/// Decide the action for each key a Secret at `version` can satisfy
pub fn plan_connections<H: Clone>(
    keys: &[ConnectionKey],
    index: &ReferenceIndex,
    store: &RemoteConnectionStore<H>,
    version: &str,
) -> Vec<ConnectionAction> {
    keys.iter()
        .filter_map(|key| {
            if !index.is_referenced(key) {
                return store
                    .contains(key)
                    .then(|| ConnectionAction::Stop(key.clone()));
            }
            if store.get(key, version).is_some() {
                return Some(ConnectionAction::Keep(key.clone()));
            }
            Some(ConnectionAction::Start {
                key: key.clone(),
                restart: store.contains(key),
            })
        })
        .collect()
}

/// Reconcile a credential Secret
pub async fn reconcile(secret: Arc<Secret>, ctx: Arc<RemoteContext>) -> Result<Action> {
    if !ctx.index.is_ready() {
        debug!(secret = %secret.name_any(), "Reference index not ready, requeueing");
        return Ok(Action::requeue(INDEX_NOT_READY_REQUEUE));
    }

    let keys = keys_for_secret(&secret);
    let version = secret.resource_version().unwrap_or_default();
    let mut first_error = None;

    for action in plan_connections(&keys, &ctx.index, &ctx.store, &version) {
        match action {
            ConnectionAction::Stop(key) => {
                ctx.store.stop(&key);
            }
            ConnectionAction::Keep(key) => {
                debug!(key = %key, version = %version, "Remote session up to date");
            }
            ConnectionAction::Start { key, restart } => {
                if restart {
                    info!(key = %key, version = %version, "Credential changed, restarting remote session");
                    ctx.store.stop(&key);
                }
                if let Err(e) = start_session(&secret, key, &version, &ctx).await {
                    warn!(secret = %secret.name_any(), error = %e, "Failed to start remote session");
                    first_error.get_or_insert(e);
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(Action::await_change()),
    }
}

async fn start_session(
    secret: &Secret,
    key: ConnectionKey,
    version: &str,
    ctx: &RemoteContext,
) -> Result<()> {
    let kubeconfig = key
        .data_key()
        .and_then(|data_key| secret.data.as_ref()?.get(data_key))
        .ok_or_else(|| Error::remote(&key, "credential entry disappeared"))?;

    let session = RemoteWatchSession::connect(key.clone(), &kubeconfig.0).await?;
    launch_session(session, version, ctx).await;
    Ok(())
}

/// Register a connected session and run it
///
/// A session losing the registration race is abandoned and `false` is
/// returned. A winner wakes every control plane referencing its key.
async fn launch_session(session: RemoteWatchSession, version: &str, ctx: &RemoteContext) -> bool {
    let key = session.key().clone();
    if !ctx
        .store
        .add(key.clone(), version, session.handle(), session.cancel_token())
    {
        warn!(key = %key, "Another session registered first, cancelling ours");
        session.abandon();
        return false;
    }

    session.start(
        ctx.store.clone(),
        ctx.relay.clone(),
        ctx.index.clone(),
        ctx.watch_timeout_secs,
    );
    info!(key = %key, version = %version, "Remote session started");

    // control planes waiting on this connection pick it up now
    for event in ctx.index.referencing(&key) {
        if ctx.relay.publish(event).await.is_err() {
            warn!(key = %key, "Change relay closed");
            break;
        }
    }
    true
}

/// Error policy: retry after a short delay
pub fn error_policy(secret: Arc<Secret>, error: &Error, _ctx: Arc<RemoteContext>) -> Action {
    warn!(secret = %secret.name_any(), error = %error, "Credential reconciliation failed");
    Action::requeue(Duration::from_secs(5))
}

/// Secret a connection key lives in
pub fn secret_ref(key: &ConnectionKey) -> Option<ObjectRef<Secret>> {
    key.secret()
        .map(|(namespace, name)| ObjectRef::new(name).within(namespace))
}

/// Secret a control plane's external reference points at
pub fn referenced_secret(kcp: KamajiControlPlane) -> Option<ObjectRef<Secret>> {
    key_for_control_plane(&kcp).as_ref().and_then(secret_ref)
}

/// Turn orphan notifications from the index into Secret reconcile triggers
///
/// Keys still unreferenced when they arrive are stopped right away, which
/// covers Secrets that no longer exist and so never reconcile again.
pub fn orphan_triggers(
    orphans: mpsc::Receiver<ConnectionKey>,
    store: Arc<RemoteConnectionStore>,
    index: Arc<ReferenceIndex>,
) -> impl Stream<Item = ObjectRef<Secret>> + Send {
    ReceiverStream::new(orphans).filter_map(move |key| {
        if !index.is_referenced(&key) && store.stop(&key) {
            debug!(key = %key, "Stopped orphaned remote session");
        }
        std::future::ready(secret_ref(&key))
    })
}
