//! Registry of live remote connections, at most one per key
//!
//! The map is owned by [`RemoteConnectionStore`]; call sites never lock
//! anything themselves. Lookups take a shard read lock, `add`/`stop` a shard
//! write lock, and cancellation always happens after the entry has left the
//! map so no session code runs under the lock.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use kcp_common::keys::ConnectionKey;

use crate::session::RemoteHandle;

/// One registered connection
struct RemoteConnection<H> {
    version: String,
    handle: H,
    cancel: CancellationToken,
}

/// Concurrency-safe registry of remote connections
pub struct RemoteConnectionStore<H = RemoteHandle> {
    connections: DashMap<ConnectionKey, RemoteConnection<H>>,
}

impl<H> Default for RemoteConnectionStore<H> {
    fn default() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }
}

impl<H: Clone> RemoteConnectionStore<H> {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Live handle for `key` if it was registered with `expected_version`
    ///
    /// A handle registered under another version is stale and reported as a
    /// miss; the caller is expected to `stop` it and start a new one.
    pub fn get(&self, key: &ConnectionKey, expected_version: &str) -> Option<H> {
        self.connections
            .get(key)
            .filter(|conn| conn.version == expected_version)
            .map(|conn| conn.handle.clone())
    }

    /// Whether any connection, stale or not, is registered for `key`
    pub fn contains(&self, key: &ConnectionKey) -> bool {
        self.connections.contains_key(key)
    }

    /// Register a connection under a free key
    ///
    /// Returns `false` without touching the store when the key is taken. The
    /// caller keeps ownership of whatever it started and must cancel it.
    pub fn add(
        &self,
        key: ConnectionKey,
        version: impl Into<String>,
        handle: H,
        cancel: CancellationToken,
    ) -> bool {
        match self.connections.entry(key) {
            Entry::Occupied(entry) => {
                debug!(key = %entry.key(), "Connection already registered");
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(RemoteConnection {
                    version: version.into(),
                    handle,
                    cancel,
                });
                true
            }
        }
    }

    /// Cancel and remove the connection for `key`
    ///
    /// Returns whether a connection existed. Stopping an absent key is a no-op.
    pub fn stop(&self, key: &ConnectionKey) -> bool {
        match self.connections.remove(key) {
            Some((key, conn)) => {
                conn.cancel.cancel();
                info!(key = %key, version = %conn.version, "Stopped remote connection");
                true
            }
            None => false,
        }
    }

    /// Remove the connection for `key` only if `owns` accepts its handle
    ///
    /// Used by sessions to evict themselves without touching a replacement
    /// registered under the same key.
    pub fn evict_if(&self, key: &ConnectionKey, owns: impl FnOnce(&H) -> bool) -> bool {
        match self.connections.remove_if(key, |_, conn| owns(&conn.handle)) {
            Some((key, conn)) => {
                conn.cancel.cancel();
                debug!(key = %key, "Evicted remote connection");
                true
            }
            None => false,
        }
    }

    /// Cancel and remove every connection
    pub fn stop_all(&self) {
        let keys: Vec<ConnectionKey> = self.connections.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.stop(&key);
        }
    }

    /// Registered keys
    pub fn keys(&self) -> Vec<ConnectionKey> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of registered connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is registered
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(entry: &str) -> ConnectionKey {
        ConnectionKey::new("infra", "remote", entry)
    }

    // =========================================================================
    // Registration
    // =========================================================================

    #[test]
    fn add_then_get_with_matching_version() {
        let store = RemoteConnectionStore::<u32>::new();
        assert!(store.add(key("value"), "10", 1, CancellationToken::new()));
        assert_eq!(store.get(&key("value"), "10"), Some(1));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn get_with_other_version_is_a_miss() {
        let store = RemoteConnectionStore::<u32>::new();
        store.add(key("value"), "10", 1, CancellationToken::new());

        assert_eq!(store.get(&key("value"), "11"), None);
        assert!(store.contains(&key("value")));
    }

    #[test]
    fn occupied_key_rejects_add_without_mutation() {
        let store = RemoteConnectionStore::<u32>::new();
        let first = CancellationToken::new();
        let second = CancellationToken::new();

        assert!(store.add(key("value"), "10", 1, first.clone()));
        assert!(!store.add(key("value"), "11", 2, second.clone()));

        assert_eq!(store.get(&key("value"), "10"), Some(1));
        assert!(!first.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[tokio::test]
    async fn concurrent_adds_have_exactly_one_winner() {
        let store = Arc::new(RemoteConnectionStore::<u32>::new());

        let tasks: Vec<_> = (0..16u32)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    (i, store.add(key("value"), "10", i, CancellationToken::new()))
                })
            })
            .collect();

        let mut winners = Vec::new();
        for task in tasks {
            let (i, accepted) = task.await.unwrap();
            if accepted {
                winners.push(i);
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(store.get(&key("value"), "10"), Some(winners[0]));
        assert_eq!(store.len(), 1);
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    #[test]
    fn stop_cancels_and_removes() {
        let store = RemoteConnectionStore::<u32>::new();
        let token = CancellationToken::new();
        store.add(key("value"), "10", 1, token.clone());

        assert!(store.stop(&key("value")));
        assert!(token.is_cancelled());
        assert!(store.is_empty());
        assert!(!store.stop(&key("value")));
    }

    #[test]
    fn stop_on_absent_key_touches_nothing() {
        let store = RemoteConnectionStore::<u32>::new();
        let token = CancellationToken::new();
        store.add(key("other"), "10", 1, token.clone());

        assert!(!store.stop(&key("value")));
        assert!(!token.is_cancelled());
        assert_eq!(store.get(&key("other"), "10"), Some(1));
    }

    #[test]
    fn rotation_replaces_the_session() {
        let store = RemoteConnectionStore::<u32>::new();
        let old = CancellationToken::new();
        store.add(key("value"), "10", 1, old.clone());

        // the secret moved to resourceVersion 11
        assert_eq!(store.get(&key("value"), "11"), None);
        assert!(store.stop(&key("value")));
        let new = CancellationToken::new();
        assert!(store.add(key("value"), "11", 2, new.clone()));

        assert!(old.is_cancelled());
        assert!(!new.is_cancelled());
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&key("value"), "11"), Some(2));
    }

    #[test]
    fn eviction_spares_a_replacement() {
        let store = RemoteConnectionStore::<u32>::new();
        let replacement = CancellationToken::new();
        store.add(key("value"), "11", 2, replacement.clone());

        // the session with handle 1 stopped after being replaced
        assert!(!store.evict_if(&key("value"), |h| *h == 1));
        assert!(!replacement.is_cancelled());
        assert!(store.evict_if(&key("value"), |h| *h == 2));
        assert!(store.is_empty());
    }

    #[test]
    fn stop_all_cancels_everything() {
        let store = RemoteConnectionStore::<u32>::new();
        let tokens: Vec<_> = ["a", "b", "c"]
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let token = CancellationToken::new();
                store.add(key(entry), "1", i as u32, token.clone());
                token
            })
            .collect();

        assert_eq!(store.keys().len(), 3);
        store.stop_all();
        assert!(store.is_empty());
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
    }
}
