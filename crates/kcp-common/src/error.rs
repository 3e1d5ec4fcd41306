//! Error types for the Kamaji control plane provider
//!
//! Errors are structured so the reconciliation engine can classify them:
//! the enqueue-back sentinel, NotFound/Conflict API errors, the infrastructure
//! adapter markers, and fatal configuration errors all remain distinguishable
//! after being wrapped with operation context.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for provider operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Nothing changed yet, try again later
    #[error("{message}, enqueue back")]
    EnqueueBack {
        /// What is still missing
        message: String,
    },

    /// The infrastructure cluster does not carry a control plane address yet
    #[error("the {kind} resource is not directly managing the Control Plane address")]
    UnmanagedAddress {
        /// Infrastructure cluster kind
        kind: String,
    },

    /// The infrastructure cluster carries a different control plane address
    #[error("the {kind} cluster has been provisioned with a mismatching {field}")]
    AddressMismatch {
        /// Infrastructure cluster kind
        kind: String,
        /// Mismatching field (host or port)
        field: String,
    },

    /// No adapter is registered for the infrastructure cluster kind
    #[error("unsupported infrastructure provider: {kind}")]
    UnsupportedProvider {
        /// Infrastructure cluster kind
        kind: String,
    },

    /// Validation error for CRD specs
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// A feature gate forbids the requested behavior
    #[error("feature gate error: {message}")]
    FeatureGate {
        /// Description of the violated gate
        message: String,
    },

    /// The remote connection behind an external cluster reference is unusable
    #[error("remote connection {key}: {message}")]
    RemoteConnection {
        /// Connection key
        key: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// An error wrapped with the operation that produced it
    #[error("{context}: {source}")]
    Context {
        /// Operation being performed
        context: String,
        /// The wrapped error
        #[source]
        source: Box<Error>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "session", "index")
        context: String,
    },
}

impl Error {
    /// Create the retry-without-progress sentinel
    pub fn enqueue_back(msg: impl Into<String>) -> Self {
        Self::EnqueueBack {
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error for a named resource
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a feature gate error
    pub fn feature_gate(msg: impl Into<String>) -> Self {
        Self::FeatureGate {
            message: msg.into(),
        }
    }

    /// Create a remote connection error for the given key
    pub fn remote(key: impl ToString, msg: impl Into<String>) -> Self {
        Self::RemoteConnection {
            key: key.to_string(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Wrap this error with the operation that produced it
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping every `Context` layer
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// HTTP status code of the underlying API error, if any
    pub fn api_code(&self) -> Option<u16> {
        match self.root() {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => Some(ae.code),
            _ => None,
        }
    }

    /// Whether this is the retry-without-progress sentinel
    pub fn is_enqueue_back(&self) -> bool {
        matches!(self.root(), Error::EnqueueBack { .. })
    }

    /// Whether the target resource was absent
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// Whether a write collided with a concurrent update
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    /// Whether the infrastructure cluster is simply not managing its address yet
    pub fn is_unmanaged_address(&self) -> bool {
        matches!(self.root(), Error::UnmanagedAddress { .. })
    }

    /// Whether retrying the same pass can ever succeed
    ///
    /// Unsupported providers, validation and feature gate errors need a spec
    /// or configuration change first.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.root(),
            Error::UnsupportedProvider { .. }
                | Error::Validation { .. }
                | Error::FeatureGate { .. }
        )
    }
}
