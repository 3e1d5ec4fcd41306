//! KamajiControlPlane reconciliation
//!
//! Turns a Cluster API control plane request into a Kamaji TenantControlPlane,
//! either on the management cluster or on a remote cluster reached through an
//! external cluster reference, and reports progress back to Cluster API.

#![deny(missing_docs)]

pub mod controller;
pub mod endpoint;
pub mod infrastructure;
pub mod resources;
pub mod tenant;

pub use controller::{error_policy, reconcile, Context, ContextBuilder};
