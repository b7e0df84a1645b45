//! Coordinator error types.

use thiserror::Error;

/// Errors from coordinator subsystems.
///
/// These never cross the wire; the handler translates each into a status
/// code plus message on the response envelope.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Not enough live servers satisfy the required tags.
    #[error("insufficient servers: need {need}, have {have}")]
    InsufficientServers { need: usize, have: usize },

    /// The assignment request itself is malformed.
    #[error("invalid assignment request: {0}")]
    InvalidAssignment(String),

    /// An access checker named in config is unknown.
    #[error("unknown access checker: {0}")]
    UnknownChecker(String),

    /// A checker requires configuration that is missing.
    #[error("checker {checker} is not configured: {missing}")]
    CheckerNotConfigured {
        checker: &'static str,
        missing: &'static str,
    },

    /// I/O error reading a coordinator-side file.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
