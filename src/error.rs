//! Error types for the reconciliation engine

use thiserror::Error;

/// Result type alias using the engine's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Engine error types
///
/// None of these ever describe a single resource's provisioning failure; those
/// are recorded on the resource itself (phase and message) and never escape the
/// reconciliation loop.
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Resource record not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Optimistic write lost too many times, or the record already exists
    #[error("Conflict on resource '{0}'")]
    Conflict(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(id: impl Into<String>) -> Self {
        Error::NotFound(id.into())
    }
}
