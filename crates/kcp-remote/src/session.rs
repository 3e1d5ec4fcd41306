//! One background watch against one remote cluster
//!
//! Lifecycle: `Starting -> Running -> Stopping -> Stopped`.
//!
//! [`RemoteWatchSession::connect`] bootstraps the client and probes the remote
//! API while `Starting`; a failure there is returned to the caller. Once the
//! session is registered in the store, [`RemoteWatchSession::start`] spawns the
//! watch loop. Failures while `Running` only end the session. A stopped session
//! evicts its own store entry, leaving any replacement untouched.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use kube::api::ListParams;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kcp_common::crd::TenantControlPlane;
use kcp_common::keys::{back_reference, ConnectionKey};
use kcp_common::kube_utils::client_from_kubeconfig;
use kcp_common::{Error, Result};

use crate::index::ReferenceIndex;
use crate::relay::{ChangeEvent, RelaySender};
use crate::store::RemoteConnectionStore;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identity of a session within the process
pub type SessionId = u64;

/// Lifecycle state of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Bootstrapping the remote client
    Starting,
    /// Watching the remote cluster
    Running,
    /// Leaving the watch loop
    Stopping,
    /// Loop exited
    Stopped,
}

/// Why a watch loop ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The session was cancelled through the store
    Cancelled,
    /// The remote rejected our credentials
    Unrecoverable(String),
    /// The watch stream ended
    StreamEnded,
    /// Nobody consumes change events anymore
    RelayClosed,
}

/// Handle to a live session, stored in the [`RemoteConnectionStore`]
#[derive(Clone)]
pub struct RemoteHandle {
    id: SessionId,
    client: Client,
    state: watch::Receiver<SessionState>,
}

impl RemoteHandle {
    /// Identity of the backing session
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Client bound to the remote cluster
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Whether the backing session is watching
    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }
}

/// A bootstrapped, not yet running, remote session
pub struct RemoteWatchSession {
    key: ConnectionKey,
    id: SessionId,
    client: Client,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
}

impl RemoteWatchSession {
    /// Build a client from kubeconfig bytes and verify the remote API answers
    pub async fn connect(key: ConnectionKey, kubeconfig: &[u8]) -> Result<Self> {
        let client = client_from_kubeconfig(kubeconfig)
            .await
            .map_err(|e| e.context(format!("cannot build client for {key}")))?;

        let api: Api<TenantControlPlane> = Api::all(client.clone());
        api.list(&ListParams::default().limit(1))
            .await
            .map_err(|e| Error::from(e).context(format!("cannot reach remote cluster for {key}")))?;

        Ok(Self::with_client(key, client))
    }

    pub(crate) fn with_client(key: ConnectionKey, client: Client) -> Self {
        Self {
            key,
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            client,
            state: watch::Sender::new(SessionState::Starting),
            cancel: CancellationToken::new(),
        }
    }

    /// Key this session serves
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Handle to register in the store
    pub fn handle(&self) -> RemoteHandle {
        RemoteHandle {
            id: self.id,
            client: self.client.clone(),
            state: self.state.subscribe(),
        }
    }

    /// Token cancelling this session, registered alongside the handle
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Give up on a session that lost the registration race
    pub fn abandon(self) {
        self.cancel.cancel();
        self.state.send_replace(SessionState::Stopped);
        debug!(key = %self.key, session = self.id, "Abandoned remote session");
    }

    /// Spawn the watch loop
    ///
    /// The session is `Running` by the time this returns, so a handle
    /// already in the store is usable right away.
    pub fn start(
        self,
        store: Arc<RemoteConnectionStore>,
        relay: RelaySender,
        index: Arc<ReferenceIndex>,
        watch_timeout_secs: u32,
    ) -> JoinHandle<()> {
        self.state.send_replace(SessionState::Running);
        info!(key = %self.key, session = self.id, "Remote session running");

        tokio::spawn(async move {
            let api: Api<TenantControlPlane> = Api::all(self.client.clone());
            let events = watcher::watcher(api, watcher::Config::default().timeout(watch_timeout_secs))
                .default_backoff();

            let reason = watch_loop(events, &self.cancel, &index, &relay, &self.state, &self.key).await;

            self.state.send_replace(SessionState::Stopped);
            match &reason {
                StopReason::Cancelled => info!(key = %self.key, "Remote session stopped"),
                other => warn!(key = %self.key, reason = ?other, "Remote session terminated"),
            }

            let id = self.id;
            store.evict_if(&self.key, |handle| handle.id() == id);
        })
    }
}

/// Whether a watch error means the credentials will never work again
pub fn is_unrecoverable(err: &watcher::Error) -> bool {
    let code = match err {
        watcher::Error::InitialListFailed(kube::Error::Api(ae))
        | watcher::Error::WatchStartFailed(kube::Error::Api(ae))
        | watcher::Error::WatchFailed(kube::Error::Api(ae)) => ae.code,
        watcher::Error::WatchError(ae) => ae.code,
        _ => return false,
    };
    matches!(code, 401 | 403)
}

/// Relay changes of remote TenantControlPlanes until cancelled or broken
///
/// Enters `Stopping` before returning.
pub(crate) async fn watch_loop<S>(
    events: S,
    cancel: &CancellationToken,
    index: &ReferenceIndex,
    relay: &RelaySender,
    state: &watch::Sender<SessionState>,
    key: &ConnectionKey,
) -> StopReason
where
    S: Stream<Item = std::result::Result<Event<TenantControlPlane>, watcher::Error>>,
{
    let mut events = std::pin::pin!(events);

    let reason = loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break StopReason::Cancelled,
            event = events.next() => event,
        };

        let tcp = match event {
            None => break StopReason::StreamEnded,
            Some(Ok(Event::Apply(tcp) | Event::InitApply(tcp) | Event::Delete(tcp))) => tcp,
            Some(Ok(Event::Init | Event::InitDone)) => continue,
            Some(Err(e)) if is_unrecoverable(&e) => break StopReason::Unrecoverable(e.to_string()),
            Some(Err(e)) => {
                warn!(key = %key, error = %e, "Remote watch error, will retry");
                continue;
            }
        };

        // resolve to an owned event before touching the relay
        let Some(change) = resolve(&tcp, index) else {
            continue;
        };
        debug!(key = %key, tenant = %tcp.name_any(), owner = %change.name, "Relaying remote change");

        tokio::select! {
            _ = cancel.cancelled() => break StopReason::Cancelled,
            sent = relay.publish(change) => {
                if sent.is_err() {
                    break StopReason::RelayClosed;
                }
            }
        }
    };

    state.send_replace(SessionState::Stopping);
    reason
}

/// Owning KamajiControlPlane of a remote TenantControlPlane, if tracked
pub fn resolve(tcp: &TenantControlPlane, index: &ReferenceIndex) -> Option<ChangeEvent> {
    back_reference(tcp).and_then(|uid| index.resolve_uid(&uid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay;
    use crate::testing::unavailable_client;
    use futures::stream;
    use kcp_common::crd::{KamajiControlPlane, KamajiControlPlaneSpec, TenantControlPlaneSpec};
    use std::time::Duration;

    type WatchItem = std::result::Result<Event<TenantControlPlane>, watcher::Error>;

    fn sample_index() -> ReferenceIndex {
        let index = ReferenceIndex::new();
        let mut kcp = KamajiControlPlane::new(
            "tenant-00",
            KamajiControlPlaneSpec {
                version: "1.31.0".to_string(),
                ..Default::default()
            },
        );
        kcp.metadata.namespace = Some("infra".to_string());
        kcp.metadata.uid = Some("0b1c".to_string());
        index.upsert(&kcp);
        index
    }

    fn tcp(name: &str) -> TenantControlPlane {
        TenantControlPlane::new(name, TenantControlPlaneSpec::default())
    }

    fn key() -> ConnectionKey {
        ConnectionKey::new("infra", "remote", "value")
    }

    fn forbidden() -> watcher::Error {
        watcher::Error::WatchError(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        })
    }

    async fn wait_for(handle: &RemoteHandle, state: SessionState) {
        let mut rx = handle.state.clone();
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| *s == state))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn started_session_is_usable_immediately() {
        let store = Arc::new(RemoteConnectionStore::new());
        let (tx, _rx) = relay::channel(8);
        let session = RemoteWatchSession::with_client(key(), unavailable_client());
        let handle = session.handle();
        assert_eq!(handle.state(), SessionState::Starting);
        assert!(store.add(key(), "42", handle.clone(), session.cancel_token()));

        let _task = session.start(store.clone(), tx, Arc::new(sample_index()), 25);

        assert!(handle.is_running());
        assert!(store.get(&key(), "42").is_some_and(|h| h.is_running()));
        store.stop_all();
    }

    #[tokio::test]
    async fn stopped_session_evicts_only_itself() {
        let store = Arc::new(RemoteConnectionStore::new());
        let index = Arc::new(sample_index());
        let (tx, _rx) = relay::channel(8);

        let old = RemoteWatchSession::with_client(key(), unavailable_client());
        let old_handle = old.handle();
        let old_cancel = old.cancel_token();
        store.add(key(), "41", old_handle.clone(), old.cancel_token());
        let old_task = old.start(store.clone(), tx.clone(), index.clone(), 25);

        // a replacement takes the key before the old loop has exited
        store.stop(&key());
        let new = RemoteWatchSession::with_client(key(), unavailable_client());
        let new_id = new.handle().id();
        store.add(key(), "42", new.handle(), new.cancel_token());

        assert!(old_cancel.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), old_task)
            .await
            .unwrap()
            .unwrap();
        wait_for(&old_handle, SessionState::Stopped).await;
        assert_eq!(store.get(&key(), "42").map(|h| h.id()), Some(new_id));
        new.abandon();
    }

    #[tokio::test]
    async fn abandoned_session_reports_stopped() {
        let session = RemoteWatchSession::with_client(key(), unavailable_client());
        let handle = session.handle();
        let cancel = session.cancel_token();

        session.abandon();

        assert!(cancel.is_cancelled());
        assert_eq!(handle.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn tracked_changes_are_relayed() {
        let index = sample_index();
        let (tx, mut rx) = relay::channel(8);
        let (state, _) = watch::channel(SessionState::Running);
        let events = stream::iter(vec![
            Ok(Event::Init),
            Ok(Event::InitApply(tcp("kcp-0b1c"))),
            Ok(Event::InitDone),
            Ok(Event::Delete(tcp("kcp-0b1c"))),
        ] as Vec<WatchItem>);

        let reason = watch_loop(events, &CancellationToken::new(), &index, &tx, &state, &key()).await;

        assert_eq!(reason, StopReason::StreamEnded);
        assert_eq!(*state.borrow(), SessionState::Stopping);
        assert_eq!(rx.recv().await, Some(ChangeEvent::new("infra", "tenant-00")));
        assert_eq!(rx.recv().await, Some(ChangeEvent::new("infra", "tenant-00")));
    }

    #[tokio::test]
    async fn unrelated_changes_emit_nothing() {
        let index = sample_index();
        let (tx, mut rx) = relay::channel(8);
        let (state, _) = watch::channel(SessionState::Running);
        let events = stream::iter(vec![
            Ok(Event::Apply(tcp("billing"))),
            Ok(Event::Apply(tcp("kcp-ffff"))),
        ] as Vec<WatchItem>);

        watch_loop(events, &CancellationToken::new(), &index, &tx, &state, &key()).await;
        drop(tx);

        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn cancellation_ends_a_blocked_watch() {
        let index = sample_index();
        let (tx, _rx) = relay::channel(8);
        let (state, _) = watch::channel(SessionState::Running);
        let cancel = CancellationToken::new();
        let events = stream::pending::<WatchItem>();

        let loop_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            watch_loop(events, &loop_cancel, &index, &tx, &state, &key()).await
        });
        cancel.cancel();

        let reason = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, StopReason::Cancelled);
    }

    #[tokio::test]
    async fn cancellation_ends_a_blocked_publish() {
        let index = sample_index();
        let (tx, _rx) = relay::channel(1);
        tx.publish(ChangeEvent::new("x", "y")).await.unwrap();
        let (state, _) = watch::channel(SessionState::Running);
        let cancel = CancellationToken::new();
        let events = stream::iter(vec![Ok(Event::Apply(tcp("kcp-0b1c")))] as Vec<WatchItem>)
            .chain(stream::pending());

        let loop_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            watch_loop(events, &loop_cancel, &index, &tx, &state, &key()).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let reason = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, StopReason::Cancelled);
    }

    #[tokio::test]
    async fn revoked_credentials_end_the_session() {
        let index = sample_index();
        let (tx, _rx) = relay::channel(8);
        let (state, _) = watch::channel(SessionState::Running);
        let events = stream::iter(vec![Err(forbidden())] as Vec<WatchItem>).chain(stream::pending());

        let reason = watch_loop(events, &CancellationToken::new(), &index, &tx, &state, &key()).await;

        assert!(matches!(reason, StopReason::Unrecoverable(_)));
    }

    #[tokio::test]
    async fn closed_relay_ends_the_session() {
        let index = sample_index();
        let (tx, rx) = relay::channel(8);
        drop(rx);
        let (state, _) = watch::channel(SessionState::Running);
        let events = stream::iter(vec![Ok(Event::Apply(tcp("kcp-0b1c")))] as Vec<WatchItem>)
            .chain(stream::pending());

        let reason = watch_loop(events, &CancellationToken::new(), &index, &tx, &state, &key()).await;

        assert_eq!(reason, StopReason::RelayClosed);
    }

    #[test]
    fn only_auth_failures_are_unrecoverable() {
        assert!(is_unrecoverable(&forbidden()));
        assert!(!is_unrecoverable(&watcher::Error::WatchError(
            kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "gone".to_string(),
                reason: "Expired".to_string(),
                code: 410,
            }
        )));
    }
}
