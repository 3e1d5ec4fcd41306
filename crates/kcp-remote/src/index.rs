//! Local reverse index over KamajiControlPlanes
//!
//! Answers the two questions the remote machinery asks, without scanning:
//! - which control planes reference a connection key
//! - which control plane a remote back-reference UID belongs to
//!
//! The index is fed by a watcher. Keys that lose their last referent are
//! reported so the owning Secret can be reconciled and its session stopped.

use std::collections::{BTreeSet, HashMap};

use std::sync::Arc;

use futures::{Stream, StreamExt};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, ResourceExt};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kcp_common::crd::KamajiControlPlane;
use kcp_common::keys::{key_for_control_plane, ConnectionKey};

use crate::relay::ChangeEvent;

#[derive(Clone, Debug, PartialEq, Eq)]
struct Entry {
    uid: Option<String>,
    key: Option<ConnectionKey>,
}

#[derive(Default)]
struct IndexState {
    objects: HashMap<ChangeEvent, Entry>,
    by_key: HashMap<ConnectionKey, BTreeSet<(String, String)>>,
    by_uid: HashMap<String, ChangeEvent>,
}

impl IndexState {
    /// Insert or refresh an object, returning a key that lost its last referent
    fn upsert(&mut self, id: ChangeEvent, entry: Entry) -> Option<ConnectionKey> {
        let orphaned = self.remove(&id).filter(|k| Some(k) != entry.key.as_ref());

        if let Some(uid) = &entry.uid {
            self.by_uid.insert(uid.clone(), id.clone());
        }
        if let Some(key) = &entry.key {
            self.by_key
                .entry(key.clone())
                .or_default()
                .insert((id.namespace.clone(), id.name.clone()));
        }
        self.objects.insert(id, entry);

        orphaned.filter(|k| !self.by_key.contains_key(k))
    }

    /// Drop an object, returning its key if nothing references it anymore
    fn remove(&mut self, id: &ChangeEvent) -> Option<ConnectionKey> {
        let entry = self.objects.remove(id)?;

        if let Some(uid) = &entry.uid {
            if self.by_uid.get(uid) == Some(id) {
                self.by_uid.remove(uid);
            }
        }

        let key = entry.key?;
        let now_empty = match self.by_key.get_mut(&key) {
            Some(refs) => {
                refs.remove(&(id.namespace.clone(), id.name.clone()));
                refs.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.by_key.remove(&key);
            return Some(key);
        }
        None
    }
}

fn identify(kcp: &KamajiControlPlane) -> (ChangeEvent, Entry) {
    (
        ChangeEvent::new(kcp.namespace().unwrap_or_default(), kcp.name_any()),
        Entry {
            uid: kcp.uid(),
            key: key_for_control_plane(kcp),
        },
    )
}

/// Reverse index from connection keys and UIDs to KamajiControlPlanes
pub struct ReferenceIndex {
    state: RwLock<IndexState>,
    ready: watch::Sender<bool>,
}

impl Default for ReferenceIndex {
    fn default() -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
            ready: watch::Sender::new(false),
        }
    }
}

impl ReferenceIndex {
    /// Create an empty, not yet synced index
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the initial listing has completed
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until the initial listing has completed
    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        // the sender lives in self, so the channel cannot close while we wait
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Index or refresh a control plane
    ///
    /// Returns a key that no control plane references anymore.
    pub fn upsert(&self, kcp: &KamajiControlPlane) -> Option<ConnectionKey> {
        let (id, entry) = identify(kcp);
        self.state.write().upsert(id, entry)
    }

    /// Forget a control plane
    ///
    /// Returns its key when it was the last referent.
    pub fn remove(&self, kcp: &KamajiControlPlane) -> Option<ConnectionKey> {
        let (id, _) = identify(kcp);
        self.state.write().remove(&id)
    }

    /// Replace the whole content after a relist
    ///
    /// Returns every key that was referenced before and is not anymore.
    pub fn replace_all<'a>(
        &self,
        kcps: impl IntoIterator<Item = &'a KamajiControlPlane>,
    ) -> Vec<ConnectionKey> {
        let mut fresh = IndexState::default();
        for kcp in kcps {
            let (id, entry) = identify(kcp);
            fresh.upsert(id, entry);
        }

        let mut state = self.state.write();
        let orphaned = state
            .by_key
            .keys()
            .filter(|k| !fresh.by_key.contains_key(*k))
            .cloned()
            .collect();
        *state = fresh;
        drop(state);

        self.ready.send_replace(true);
        orphaned
    }

    /// Control planes referencing a key
    pub fn referencing(&self, key: &ConnectionKey) -> Vec<ChangeEvent> {
        self.state
            .read()
            .by_key
            .get(key)
            .map(|refs| {
                refs.iter()
                    .map(|(ns, name)| ChangeEvent::new(ns.as_str(), name.as_str()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether any control plane references a key
    pub fn is_referenced(&self, key: &ConnectionKey) -> bool {
        self.state.read().by_key.contains_key(key)
    }

    /// Control plane owning a back-reference UID
    pub fn resolve_uid(&self, uid: &str) -> Option<ChangeEvent> {
        self.state.read().by_uid.get(uid).cloned()
    }
}

/// Keep the index in sync with the cluster
///
/// Orphaned keys are sent on `orphans` so their Secret gets reconciled. Runs
/// until `shutdown` is cancelled or nobody receives orphans anymore.
pub async fn run_index(
    api: Api<KamajiControlPlane>,
    config: watcher::Config,
    index: Arc<ReferenceIndex>,
    orphans: mpsc::Sender<ConnectionKey>,
    shutdown: CancellationToken,
) {
    info!("KamajiControlPlane reference index started");
    let events = watcher::watcher(api, config).default_backoff();
    sync_index(events, &index, &orphans, &shutdown).await;
    info!("KamajiControlPlane reference index stopped");
}

pub(crate) async fn sync_index<S>(
    events: S,
    index: &ReferenceIndex,
    orphans: &mpsc::Sender<ConnectionKey>,
    shutdown: &CancellationToken,
) where
    S: Stream<Item = std::result::Result<Event<KamajiControlPlane>, watcher::Error>>,
{
    let mut events = std::pin::pin!(events);
    let mut relist: Option<Vec<KamajiControlPlane>> = None;

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = events.next() => match event {
                Some(event) => event,
                None => return,
            },
        };

        let orphaned = match event {
            Ok(Event::Apply(kcp)) => index.upsert(&kcp).into_iter().collect(),
            Ok(Event::Delete(kcp)) => index.remove(&kcp).into_iter().collect(),
            Ok(Event::Init) => {
                relist = Some(Vec::new());
                Vec::new()
            }
            Ok(Event::InitApply(kcp)) => {
                relist.get_or_insert_with(Vec::new).push(kcp);
                Vec::new()
            }
            Ok(Event::InitDone) => {
                let listed = relist.take().unwrap_or_default();
                debug!(count = listed.len(), "Reference index relisted");
                index.replace_all(&listed)
            }
            Err(e) => {
                warn!(error = %e, "KamajiControlPlane watch error, will retry");
                Vec::new()
            }
        };

        for key in orphaned {
            debug!(key = %key, "Connection key no longer referenced");
            let sent = tokio::select! {
                _ = shutdown.cancelled() => return,
                sent = orphans.send(key) => sent,
            };
            if sent.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use kcp_common::crd::{ExternalClusterReference, KamajiControlPlaneSpec};
    use std::time::Duration;

    type WatchItem = std::result::Result<Event<KamajiControlPlane>, watcher::Error>;

    fn sample_kcp(name: &str, uid: &str, entry: Option<&str>) -> KamajiControlPlane {
        let mut kcp = KamajiControlPlane::new(
            name,
            KamajiControlPlaneSpec {
                version: "1.31.0".to_string(),
                ..Default::default()
            },
        );
        kcp.metadata.namespace = Some("infra".to_string());
        kcp.metadata.uid = Some(uid.to_string());
        kcp.spec.deployment.external_cluster_reference =
            entry.map(|e| ExternalClusterReference {
                kubeconfig_secret_name: "remote".to_string(),
                kubeconfig_secret_key: e.to_string(),
                deployment_namespace: "tenants".to_string(),
                ..Default::default()
            });
        kcp
    }

    fn key(entry: &str) -> ConnectionKey {
        ConnectionKey::new("infra", "remote", entry)
    }

    #[test]
    fn lookups_by_key_and_uid() {
        let index = ReferenceIndex::new();
        index.upsert(&sample_kcp("a", "uid-a", Some("value")));
        index.upsert(&sample_kcp("b", "uid-b", Some("value")));
        index.upsert(&sample_kcp("c", "uid-c", None));

        assert_eq!(
            index.referencing(&key("value")),
            vec![ChangeEvent::new("infra", "a"), ChangeEvent::new("infra", "b")]
        );
        assert_eq!(index.resolve_uid("uid-c"), Some(ChangeEvent::new("infra", "c")));
        assert!(index.resolve_uid("uid-z").is_none());
    }

    #[test]
    fn last_referent_leaving_orphans_the_key() {
        let index = ReferenceIndex::new();
        index.upsert(&sample_kcp("a", "uid-a", Some("value")));
        index.upsert(&sample_kcp("b", "uid-b", Some("value")));

        assert_eq!(index.remove(&sample_kcp("a", "uid-a", Some("value"))), None);
        assert_eq!(
            index.remove(&sample_kcp("b", "uid-b", Some("value"))),
            Some(key("value"))
        );
        assert!(!index.is_referenced(&key("value")));
    }

    #[test]
    fn switching_entry_orphans_the_old_key() {
        let index = ReferenceIndex::new();
        index.upsert(&sample_kcp("a", "uid-a", Some("value")));

        assert_eq!(
            index.upsert(&sample_kcp("a", "uid-a", Some("admin.conf"))),
            Some(key("value"))
        );
        assert!(index.is_referenced(&key("admin.conf")));
        // refreshing with the same key orphans nothing
        assert_eq!(index.upsert(&sample_kcp("a", "uid-a", Some("admin.conf"))), None);
    }

    #[test]
    fn relist_reports_vanished_keys_and_marks_ready() {
        let index = ReferenceIndex::new();
        assert!(!index.is_ready());
        index.upsert(&sample_kcp("a", "uid-a", Some("value")));
        index.upsert(&sample_kcp("b", "uid-b", Some("admin.conf")));

        let orphaned = index.replace_all(&[sample_kcp("b", "uid-b", Some("admin.conf"))]);

        assert_eq!(orphaned, vec![key("value")]);
        assert!(index.is_ready());
        assert!(index.resolve_uid("uid-a").is_none());
    }

    #[tokio::test]
    async fn wait_ready_returns_after_first_relist() {
        let index = Arc::new(ReferenceIndex::new());
        let waiter = {
            let index = index.clone();
            tokio::spawn(async move { index.wait_ready().await })
        };
        index.replace_all(std::iter::empty());
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn watch_events_feed_the_index_and_report_orphans() {
        let index = ReferenceIndex::new();
        let (tx, mut rx) = mpsc::channel(8);
        let events = stream::iter(vec![
            Ok(Event::Init),
            Ok(Event::InitApply(sample_kcp("a", "uid-a", Some("value")))),
            Ok(Event::InitDone),
            Ok(Event::Delete(sample_kcp("a", "uid-a", Some("value")))),
        ] as Vec<WatchItem>);

        sync_index(events, &index, &tx, &CancellationToken::new()).await;

        assert!(index.is_ready());
        assert!(index.resolve_uid("uid-a").is_none());
        assert_eq!(rx.recv().await, Some(key("value")));
    }

    #[tokio::test]
    async fn index_stops_once_shutdown_is_cancelled() {
        let index = Arc::new(ReferenceIndex::new());
        let (tx, _rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let events = stream::iter(vec![Ok(Event::Apply(sample_kcp("a", "uid-a", Some("value"))))] as Vec<WatchItem>)
            .chain(stream::pending());

        let task = {
            let index = index.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { sync_index(events, &index, &tx, &shutdown).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(index.is_referenced(&key("value")));
    }

    #[tokio::test]
    async fn shutdown_ends_a_blocked_orphan_send() {
        let index = Arc::new(ReferenceIndex::new());
        let (tx, _rx) = mpsc::channel(1);
        tx.send(key("stale")).await.unwrap();
        let shutdown = CancellationToken::new();
        let events = stream::iter(vec![
            Ok(Event::Apply(sample_kcp("a", "uid-a", Some("value")))),
            Ok(Event::Delete(sample_kcp("a", "uid-a", Some("value")))),
        ] as Vec<WatchItem>)
        .chain(stream::pending());

        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { sync_index(events, &index, &tx, &shutdown).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
