//! Error types for the density composition layer

use thiserror::Error;

/// Error type shared by every density and wrapper.
///
/// Non-convergence of a Lipschitz refresh is deliberately absent: it is reported as
/// [`RefreshOutcome::Stale`](crate::RefreshOutcome::Stale) and never surfaces as an error.
#[derive(Error, Debug)]
pub enum Error {
    /// A density was called with a batch of the wrong shape, or asked for an operation it
    /// does not support.
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// The devices backing a replicated density no longer match its construction-time set.
    #[error("Device mismatch: {0}")]
    DeviceMismatch(String),

    /// Invalid configuration or constructor input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
