//! Error types for Trellis
//!
//! `ProviderError` covers failures talking to the cloud provider.
//! `ProvisionError` is the taxonomy every reconciliation step reports.

use std::time::Duration;

use thiserror::Error;

use crate::domain::cluster::PortRange;
use crate::domain::resource::ResourceKind;

/// Result type alias for provisioning operations
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Errors returned by a cloud provider API
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The provider rejected the call because of rate limiting
    #[error("request throttled: {0}")]
    Throttled(String),

    /// The provider is briefly unavailable
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The addressed resource does not exist
    #[error("{kind} '{id}' not found")]
    NotFound { kind: ResourceKind, id: String },

    /// The provider refused the request
    #[error("request rejected (status {status}): {message}")]
    Rejected {
        /// Status code reported by the provider
        status: u16,
        /// Error message from the provider
        message: String,
    },

    /// The request never reached the provider
    #[error("transport error: {0}")]
    Transport(String),

    /// Failed to parse a provider response
    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl ProviderError {
    /// Create a rejection error from status code and message
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    /// Check if this error is worth retrying (throttling, brief unavailability)
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Throttled(_) | Self::Unavailable(_))
    }

    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. }) || matches!(self, Self::Rejected { status: 404, .. })
    }
}

/// Errors raised while reconciling a cluster
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// A discovered resource was created for a different purpose
    #[error("{kind} '{name}' conflicts with the declared definition: {reason}")]
    Conflict {
        kind: ResourceKind,
        name: String,
        reason: String,
    },

    /// A polled operation did not reach the expected state in time
    #[error("timed out after {waited:?} waiting for {operation}")]
    Timeout { operation: String, waited: Duration },

    /// A resource entered a state with no defined transition
    #[error("{resource} entered unexpected state '{state}'")]
    UnexpectedState { resource: String, state: String },

    /// Not enough free ports for the unassigned nodes
    #[error(
        "SSH port range {range} has {available} free port(s) but {needed} node(s) need one"
    )]
    PortRangeExhausted {
        range: PortRange,
        available: usize,
        needed: usize,
    },

    /// The declared topology cannot be satisfied
    #[error("capacity error: {0}")]
    Capacity(String),

    /// The cluster definition is malformed
    #[error("invalid cluster definition: {0}")]
    Validation(String),

    /// A provider call failed
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// A worker task died before reporting a result
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProvisionError {
    /// Create a conflict error
    pub fn conflict(kind: ResourceKind, name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an unexpected-state error
    pub fn unexpected_state(resource: impl Into<String>, state: impl Into<String>) -> Self {
        Self::UnexpectedState {
            resource: resource.into(),
            state: state.into(),
        }
    }

    /// Check if this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
