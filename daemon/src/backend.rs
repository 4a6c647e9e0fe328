//! Isolation backend trait and implementations.
//!
//! Backends are the only code that talks to the sandbox enforcer. They
//! take a fully resolved [`IsolationSpec`], run it once, and report what
//! came back. Enforcing memory, CPU and network limits is the runtime's
//! job, not ours.

mod docker;

pub use docker::DockerBackend;

use anyhow::Result;
use async_trait::async_trait;

use crate::request::IsolationSpec;

/// Result of executing code in a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Exit code of the process (0 = success, -1 = no exit code).
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Wall time of the invocation in milliseconds.
    pub duration_ms: u64,
    /// True when the wall-clock watchdog stopped the run.
    pub timed_out: bool,
}

/// Trait for isolation backends.
///
/// An error means the runtime could not be invoked at all; a program that
/// ran and failed is still an `Ok` result.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Run the spec to completion. No retries.
    async fn run(&self, spec: &IsolationSpec) -> Result<ExecutionResult>;
}
