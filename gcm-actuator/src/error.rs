//! Actuator error types.

use gcm_cloud::CloudError;
use thiserror::Error;

use crate::core::CoreError;

/// Errors returned by the scope, the reconciler and the actuator.
#[derive(Debug, Error)]
pub enum Error {
    /// Terminal misconfiguration. Retrying will not help until an operator
    /// fixes the machine or its secrets.
    #[error("{0}")]
    InvalidConfiguration(String),

    /// A capability contract call failed.
    #[error("{context}: {source}")]
    Cloud {
        context: String,
        #[source]
        source: CloudError,
    },

    /// The core client failed.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A provider payload could not be encoded or decoded.
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),

    /// Retryable failure outside the cloud contracts.
    #[error("{0}")]
    Transient(String),

    /// Wraps an inner error with what was being attempted.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    /// Scope construction failed.
    #[error("{machine}: failed to create scope for machine: {source}")]
    Scope {
        machine: String,
        #[source]
        source: Box<Error>,
    },

    /// A reconciler operation failed.
    #[error("{machine}: reconciler failed to {action} machine: {source}")]
    Reconcile {
        machine: String,
        action: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }

    pub fn cloud(context: impl Into<String>, source: CloudError) -> Self {
        Self::Cloud {
            context: context.into(),
            source,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// True when this error, or any error it wraps, is a configuration error.
    pub fn is_invalid_configuration(&self) -> bool {
        match self {
            Self::InvalidConfiguration(_) => true,
            Self::Context { source, .. }
            | Self::Scope { source, .. }
            | Self::Reconcile { source, .. } => source.is_invalid_configuration(),
            _ => false,
        }
    }
}

/// Result type for actuator operations.
pub type Result<T> = std::result::Result<T, Error>;
