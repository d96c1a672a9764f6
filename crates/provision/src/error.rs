//! Provisioning error types

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// A single deploy target that failed during fan-out
#[derive(Debug)]
pub struct TargetFailure {
    /// Target name (domain, listener or deployer label)
    pub target: String,
    /// Why the target failed
    pub error: ProvisionError,
}

impl fmt::Display for TargetFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.target, self.error)
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("No DNS zone found for '{fqdn}'")]
    ZoneNotFound { fqdn: String },

    #[error("No challenge record tracked for token '{token}'")]
    UnknownRecord { token: String },

    #[error("Challenge token '{token}' already has a presented record")]
    TokenInUse { token: String },

    #[error("Backend request '{operation}' failed: {message}")]
    Backend { operation: String, message: String },

    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("No deploy targets resolved for {pattern} pattern '{value}'")]
    NoTargetsResolved { pattern: String, value: String },

    #[error("{} of {total} deploy targets failed: {}", .failures.len(), join_failures(.failures))]
    PartialDeployFailure {
        failures: Vec<TargetFailure>,
        total: usize,
    },

    #[error("{what} did not complete within {elapsed:?}")]
    PollTimeout { what: String, elapsed: Duration },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("ACME error: {0}")]
    Acme(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    /// Wrap a backend failure with the name of the operation that failed
    pub fn backend(operation: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Backend {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// True when the error is the caller's own cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

fn join_failures(failures: &[TargetFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias for provisioning operations
pub type Result<T> = std::result::Result<T, ProvisionError>;
