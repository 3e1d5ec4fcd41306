//! Convergence progress recorded as Kubernetes conditions
//!
//! Every named reconciliation step is wrapped with [`track_step`], which keeps
//! one [`Condition`] per step type in a [`ConditionSet`]. Steps run strictly in
//! order and a failing step short-circuits the pass, so conditions of later
//! steps keep whatever the previous pass left there.

use std::future::Future;

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::{Condition, ConditionStatus};
use crate::Error;

/// Reason of a step that completed
pub const REASON_SUCCEEDED: &str = "Succeeded";
/// Reason of a step that hit the enqueue-back sentinel
pub const REASON_FAILED: &str = "Failed";
/// Reason of a step that hit any other error
pub const REASON_PENDING: &str = "Pending";

/// The remote kubeconfig of an external cluster reference resolved to a live connection
pub const FOUND_EXTERNAL_CLUSTER_REFERENCE: &str = "FoundExternalClusterReference";
/// The TenantControlPlane was created or updated
pub const TENANT_CONTROL_PLANE_CREATED: &str = "TenantControlPlaneCreated";
/// The TenantControlPlane reported its endpoint
pub const TENANT_CONTROL_PLANE_ADDRESS_READY: &str = "TenantControlPlaneAddressReady";
/// The KamajiControlPlane spec carries the control plane endpoint
pub const CONTROL_PLANE_ENDPOINT_PATCHED: &str = "ControlPlaneEndpointPatched";
/// The infrastructure cluster carries the control plane endpoint
pub const INFRASTRUCTURE_CLUSTER_PATCHED: &str = "InfrastructureClusterPatched";
/// The control plane has been initialized
pub const KAMAJI_CONTROL_PLANE_INITIALIZED: &str = "KamajiControlPlaneIsInitialized";
/// The kubeconfig and CA Secrets required by Cluster API exist
pub const KUBEADM_RESOURCES_CREATED: &str = "KubeadmResourcesCreated";
/// The control plane is serving
pub const KAMAJI_CONTROL_PLANE_READY: &str = "KamajiControlPlaneIsReady";

/// Ordered collection of conditions keyed by type
///
/// Entries are created on first observation and never removed. Serialized as
/// the plain condition list Kubernetes clients expect.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(transparent)]
pub struct ConditionSet(Vec<Condition>);

impl ConditionSet {
    /// Whether no condition has been observed yet
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of observed condition types
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Condition of the given type, if observed
    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    /// Whether the condition of the given type is True
    pub fn is_true(&self, type_: &str) -> bool {
        self.get(type_)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// Iterate conditions in first-observed order
    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    /// Locate or create the condition for `type_` and refresh its observed generation
    pub fn observe(&mut self, type_: &str, generation: Option<i64>) -> &mut Condition {
        let index = match self.0.iter().position(|c| c.type_ == type_) {
            Some(index) => index,
            None => {
                self.0.push(Condition::new(
                    type_,
                    ConditionStatus::Unknown,
                    String::new(),
                    String::new(),
                ));
                self.0.len() - 1
            }
        };

        let condition = &mut self.0[index];
        condition.observed_generation = generation;
        condition
    }

    /// Record the outcome of a step
    ///
    /// The transition time moves only when the status actually changes.
    pub fn record(&mut self, type_: &str, generation: Option<i64>, outcome: Result<(), &Error>) {
        let condition = self.observe(type_, generation);

        let (status, reason, message) = match outcome {
            Ok(()) => (ConditionStatus::True, REASON_SUCCEEDED, String::new()),
            Err(e) if e.is_enqueue_back() => (ConditionStatus::False, REASON_FAILED, e.to_string()),
            Err(e) => (ConditionStatus::False, REASON_PENDING, e.to_string()),
        };

        if condition.status != status {
            condition.last_transition_time = Utc::now();
        }
        condition.status = status;
        condition.reason = reason.to_string();
        condition.message = message;
    }

    /// Apply the conditions changed since `base` on top of `latest`
    ///
    /// Conditions still equal to their `base` entry keep the value stored in
    /// `latest`.
    pub fn rebase(&self, base: &ConditionSet, latest: ConditionSet) -> ConditionSet {
        let mut merged = latest;
        for condition in self.0.iter().filter(|c| base.get(&c.type_) != Some(*c)) {
            match merged.0.iter_mut().find(|c| c.type_ == condition.type_) {
                Some(stored) => *stored = condition.clone(),
                None => merged.0.push(condition.clone()),
            }
        }
        merged
    }
}

/// Run one convergence step and record its outcome in `conditions`
///
/// The step's error is returned unchanged so the caller can short-circuit the
/// pass with `?`.
pub async fn track_step<T, Fut>(
    conditions: &mut ConditionSet,
    type_: &str,
    generation: Option<i64>,
    step: Fut,
) -> Result<T, Error>
where
    Fut: Future<Output = Result<T, Error>>,
{
    conditions.observe(type_, generation);

    let result = step.await;
    conditions.record(type_, generation, result.as_ref().map(|_| ()));
    result
}
