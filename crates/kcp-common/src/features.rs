//! Feature gates
//!
//! Gates are parsed from the Kubernetes-style `Name=bool,Name=bool` syntax.
//! Every gate defaults to disabled and unknown names are rejected.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// A named optional behavior of the provider
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Feature {
    /// Allow delegating TenantControlPlanes to a remote cluster
    ExternalClusterReference,
    /// Allow the remote kubeconfig Secret to live in another namespace
    ExternalClusterReferenceCrossNamespace,
    /// Never patch the infrastructure cluster with the control plane endpoint
    SkipInfraClusterPatch,
    /// Treat extra infrastructure cluster kinds as patch-only
    DynamicInfrastructureClusterPatch,
}

impl Feature {
    /// All known features
    pub const ALL: [Feature; 4] = [
        Feature::ExternalClusterReference,
        Feature::ExternalClusterReferenceCrossNamespace,
        Feature::SkipInfraClusterPatch,
        Feature::DynamicInfrastructureClusterPatch,
    ];

    /// Canonical gate name
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::ExternalClusterReference => "ExternalClusterReference",
            Feature::ExternalClusterReferenceCrossNamespace => {
                "ExternalClusterReferenceCrossNamespace"
            }
            Feature::SkipInfraClusterPatch => "SkipInfraClusterPatch",
            Feature::DynamicInfrastructureClusterPatch => "DynamicInfrastructureClusterPatch",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| Error::feature_gate(format!("unknown feature gate {s}")))
    }
}

/// The set of enabled features
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FeatureGates {
    enabled: BTreeSet<Feature>,
}

impl FeatureGates {
    /// Gates with the given features enabled
    pub fn with(features: impl IntoIterator<Item = Feature>) -> Self {
        Self {
            enabled: features.into_iter().collect(),
        }
    }

    /// Whether a feature is enabled
    pub fn enabled(&self, feature: Feature) -> bool {
        self.enabled.contains(&feature)
    }

    /// Whether any form of external cluster reference is allowed
    pub fn external_reference_enabled(&self) -> bool {
        self.enabled(Feature::ExternalClusterReference)
            || self.enabled(Feature::ExternalClusterReferenceCrossNamespace)
    }
}

impl FromStr for FeatureGates {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut gates = FeatureGates::default();

        for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::feature_gate(format!("missing value for {pair}")))?;
            let feature: Feature = name.trim().parse()?;
            let on: bool = value.trim().parse().map_err(|_| {
                Error::feature_gate(format!("invalid value {value} for {feature}"))
            })?;

            if on {
                gates.enabled.insert(feature);
            } else {
                gates.enabled.remove(&feature);
            }
        }

        Ok(gates)
    }
}
