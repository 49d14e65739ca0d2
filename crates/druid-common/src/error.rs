//! Error types for the Druid operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the cluster, node or resource it concerns so a
//! failed reconcile can be traced back to the offending object.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Druid operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for the Druid spec
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the Druid cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.nodes.brokers.nodeType")
        field: Option<String>,
    },

    /// The manifest builder could not render a node's child objects
    #[error("manifest error for node {node}: {message}")]
    Manifest {
        /// Node-type-instance key
        node: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Several independent operations failed within one pass
    #[error("{context}: {}", join_messages(.errors))]
    Aggregate {
        /// The operation the errors were collected from (e.g., "cleanup")
        context: String,
        /// The individual failures
        errors: Vec<Error>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "finalizer")
        context: String,
    },
}

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create a validation error with the given message
    ///
    /// For simple validation errors without cluster context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context
    pub fn validation_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a manifest error for a node-type-instance
    pub fn manifest(node: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Manifest {
            node: node.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Collapse a list of failures into one error.
    ///
    /// Returns `None` for an empty list and the error itself when there is
    /// exactly one, so callers can `?` the result without special-casing.
    pub fn aggregate(context: impl Into<String>, mut errors: Vec<Error>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Aggregate {
                context: context.into(),
                errors,
            }),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, manifest and serialization errors need a spec change.
    /// Kubernetes errors are retried unless the API rejected the request,
    /// with conflicts (stale resourceVersion) and throttling treated as
    /// transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 409 || ae.code == 429 => true,
                kube::Error::Api(ae) => !(400..500).contains(&ae.code),
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Manifest { .. } => false,
            Error::Serialization { .. } => false,
            Error::Aggregate { errors, .. } => errors.iter().any(Error::is_retryable),
            Error::Internal { .. } => true,
        }
    }

    /// True if only an edit of the Druid object can fix this error
    pub fn needs_spec_change(&self) -> bool {
        match self {
            Error::Validation { .. } | Error::Manifest { .. } | Error::Serialization { .. } => {
                true
            }
            Error::Aggregate { errors, .. } => errors.iter().all(Error::needs_spec_change),
            Error::Kube { .. } | Error::Internal { .. } => false,
        }
    }

        /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Validation { cluster, .. } => Some(cluster),
            _ => None,
        }
    }

    /// Returns true if the error is a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }
}
