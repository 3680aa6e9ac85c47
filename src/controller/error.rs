//! Error types for the controller.
//!
//! Defines custom error types with classification for retry behavior. Store
//! failures are split into the conditions the converger reacts to (invalid
//! structural updates, version conflicts) and everything else.

use std::time::Duration;
use thiserror::Error;

use crate::client::RedisError;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The store rejected a write as structurally invalid (HTTP 422)
    #[error("Invalid update of {kind} {name}: {message}")]
    InvalidStructural {
        kind: String,
        name: String,
        message: String,
    },

    /// Optimistic concurrency conflict on write (HTTP 409)
    #[error("Conflicting write to {kind} {name}: {message}")]
    Conflict {
        kind: String,
        name: String,
        message: String,
    },

    /// A referenced secret or key is absent
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Missing required field in resource
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Validation error in resource spec
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transient error that should be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Classify a kube API failure for an object of `kind`.
    pub fn from_store(kind: &str, name: &str, error: kube::Error) -> Self {
        match error {
            kube::Error::Api(ref e) if e.code == 422 && e.reason == "Invalid" => {
                Error::InvalidStructural {
                    kind: kind.to_string(),
                    name: name.to_string(),
                    message: e.message.clone(),
                }
            }
            kube::Error::Api(ref e) if e.code == 409 => Error::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
                message: e.message.clone(),
            },
            other => Error::Kube(other),
        }
    }

    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    pub fn is_invalid_structural(&self) -> bool {
        matches!(self, Error::InvalidStructural { .. })
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on network errors, rate limiting, and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::Conflict { .. } | Error::Transient(_) => true,
            // A secret may be created after the resource referencing it.
            Error::Configuration(_) => true,
            Error::InvalidStructural { .. } | Error::Validation(_) | Error::MissingField(_) => {
                false
            }
            Error::Serialization(_) => false,
        }
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Duration {
        match self {
            Error::Conflict { .. } => Duration::from_secs(1),
            _ if self.is_retryable() => Duration::from_secs(30),
            _ => Duration::from_secs(300),
        }
    }
}

impl From<RedisError> for Error {
    fn from(error: RedisError) -> Self {
        Error::Transient(error.to_string())
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;
