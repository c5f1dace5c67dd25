//! Error types for the kevel convergence engine

use std::fmt;

use thiserror::Error;

/// Main error type for kevel operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Optimistic-concurrency failure updating an object.
    ///
    /// Handled internally by the secret rewrite path (one refetch-and-retry);
    /// only surfaces to callers inside an [`Error::Aggregate`].
    #[error("conflict updating {0}")]
    Conflict(String),

    /// Host connectivity or container runtime error
    #[error("host error: {0}")]
    Host(String),

    /// Cross-replica consistency violation (snapshot checksum gate)
    #[error("consistency error: {0}")]
    Consistency(String),

    /// A multi-step protocol invariant was violated.
    ///
    /// Always fatal and operator-visible; recovery must not be guessed at
    /// because the wrong guess can leave secrets unreadable.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Cluster configuration validation failure
    #[error("validation error: {0}")]
    Validation(String),

    /// PKI / certificate bundle error
    #[error("pki error: {0}")]
    Pki(String),

    /// State file read/write error
    #[error("state error: {0}")]
    State(String),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Non-fatal per-item failures accumulated within one phase
    #[error("{context}: {errors}")]
    Aggregate {
        /// Phase that accumulated the failures
        context: String,
        /// The individual failures, in the order they were observed
        errors: ErrorList,
    },
}

impl Error {
    /// Create a host error with the given message
    pub fn host(msg: impl Into<String>) -> Self {
        Self::Host(msg.into())
    }

    /// Create a consistency error with the given message
    pub fn consistency(msg: impl Into<String>) -> Self {
        Self::Consistency(msg.into())
    }

    /// Create a protocol-invariant error with the given message
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a PKI error with the given message
    pub fn pki(msg: impl Into<String>) -> Self {
        Self::Pki(msg.into())
    }

    /// Create a state error with the given message
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Bundle accumulated per-item failures into one phase-level error
    pub fn aggregate(context: impl Into<String>, errors: Vec<Error>) -> Self {
        Self::Aggregate {
            context: context.into(),
            errors: ErrorList(errors),
        }
    }

    /// Whether this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Ordered list of failures collected within one phase
#[derive(Debug)]
pub struct ErrorList(pub Vec<Error>);

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure(s): [", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", err)?;
        }
        write!(f, "]")
    }
}
