//! Remote connections for delegated KamajiControlPlanes
//!
//! - [`store`]: at most one live session per connection key
//! - [`session`]: the background watch against one remote cluster
//! - [`relay`]: change notifications back to the KamajiControlPlane controller
//! - [`index`]: which control planes reference which keys and UIDs
//! - [`controller`]: the Secret controller starting and stopping sessions

#![deny(missing_docs)]

pub mod controller;
pub mod index;
pub mod relay;
pub mod session;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::{error_policy, reconcile, RemoteContext};
pub use index::{run_index, ReferenceIndex};
pub use relay::{ChangeEvent, RelayReceiver, RelaySender, DEFAULT_RELAY_CAPACITY};
pub use session::{RemoteHandle, RemoteWatchSession, SessionState};
pub use store::RemoteConnectionStore;
