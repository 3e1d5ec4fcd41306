//! Change relay from remote watch sessions to the KamajiControlPlane controller
//!
//! A bounded queue with a single consumer. Publishing waits for capacity, so a
//! slow controller slows the sessions down instead of dropping events. Events
//! are owned values copied out of any index or store before publishing.

use futures::{Stream, StreamExt};
use kube::runtime::reflector::ObjectRef;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use kcp_common::crd::KamajiControlPlane;

/// Default number of queued events before publishers wait
pub const DEFAULT_RELAY_CAPACITY: usize = 1024;

/// Identity of a KamajiControlPlane to reconcile again
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChangeEvent {
    /// Namespace of the KamajiControlPlane
    pub namespace: String,
    /// Name of the KamajiControlPlane
    pub name: String,
}

impl ChangeEvent {
    /// Create an event
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl From<ChangeEvent> for ObjectRef<KamajiControlPlane> {
    fn from(event: ChangeEvent) -> Self {
        ObjectRef::new(&event.name).within(&event.namespace)
    }
}

/// The consumer side is gone
#[derive(Debug, thiserror::Error)]
#[error("change relay closed")]
pub struct RelayClosed;

/// Publishing half, cloned into every session
#[derive(Clone, Debug)]
pub struct RelaySender {
    tx: mpsc::Sender<ChangeEvent>,
}

impl RelaySender {
    /// Publish an event, waiting for queue capacity
    pub async fn publish(&self, event: ChangeEvent) -> Result<(), RelayClosed> {
        self.tx.send(event).await.map_err(|_| RelayClosed)
    }
}

/// Consuming half, handed to the controller
#[derive(Debug)]
pub struct RelayReceiver {
    rx: mpsc::Receiver<ChangeEvent>,
}

impl RelayReceiver {
    /// Receive the next event
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Reconcile triggers for `Controller::reconcile_on`
    pub fn into_trigger_stream(self) -> impl Stream<Item = ObjectRef<KamajiControlPlane>> + Send {
        ReceiverStream::new(self.rx).map(ObjectRef::from)
    }
}

/// Create a relay with the given capacity
pub fn channel(capacity: usize) -> (RelaySender, RelayReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (RelaySender { tx }, RelayReceiver { rx })
}
