//! Error types surfaced to callers.

use thiserror::Error;

/// Failure of a request before or around the container run.
///
/// Both variants are turned into response payloads; neither ever brings
/// the daemon down.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Caller-correctable problem with the request. Nothing is executed
    /// and nothing is written to the audit log.
    #[error("{0}")]
    Input(String),

    /// The orchestration layer itself failed (I/O, runtime spawn, ...).
    #[error("{0}")]
    System(String),
}

impl ExecutionError {
    pub fn input(message: impl Into<String>) -> Self {
        Self::Input(message.into())
    }
}

impl From<std::io::Error> for ExecutionError {
    fn from(err: std::io::Error) -> Self {
        Self::System(err.to_string())
    }
}
