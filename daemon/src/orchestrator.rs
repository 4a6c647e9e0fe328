//! Execution orchestration.
//!
//! Every request follows the same path: take an admission slot, build the
//! isolation spec, run it, classify the result, write the audit entry,
//! give the slot back. Each step is sequential; concurrency only exists
//! between requests.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::admission::AdmissionController;
use crate::archive;
use crate::audit::{ExecutionLogger, LogEntry};
use crate::backend::{ExecutionResult, IsolationBackend};
use crate::config::Config;
use crate::error::ExecutionError;
use crate::outcome::{classify_result, Outcome};
use crate::request::{ExecutionRequest, ExecutionRequestBuilder, Language, PreparedExecution};

pub const KILLED_MESSAGE: &str = "Execution stopped: CPU or memory exceeded";

/// Payload returned to the caller.
///
/// Fields that do not apply to a given outcome are left out of the JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_code: Option<i32>,
    #[serde(skip)]
    pub outcome: Outcome,
}

impl RunResponse {
    fn error_only(outcome: Outcome, message: impl Into<String>) -> Self {
        Self {
            output: None,
            error: message.into(),
            return_code: None,
            outcome,
        }
    }

    fn from_error(err: &ExecutionError) -> Self {
        let outcome = match err {
            ExecutionError::Input(_) => Outcome::InputError,
            ExecutionError::System(_) => Outcome::SystemError,
        };
        Self::error_only(outcome, err.to_string())
    }
}

/// Result of one attempted run, before it is shaped into a response.
struct Attempt {
    outcome: Outcome,
    result: Result<ExecutionResult, String>,
}

/// Owns the pipeline components and drives requests through them.
#[derive(Debug)]
pub struct Orchestrator<B> {
    admission: AdmissionController,
    builder: ExecutionRequestBuilder,
    backend: B,
    logger: ExecutionLogger,
    wall_timeout_seconds: u64,
}

impl<B: IsolationBackend> Orchestrator<B> {
    pub fn new(config: &Config, backend: B) -> Result<Self> {
        config.validate().context("Invalid configuration")?;
        let workspace_root = config.resolved_workspace_root()?;
        Ok(Self {
            admission: AdmissionController::new(&config.admission),
            builder: ExecutionRequestBuilder::new(config, workspace_root),
            backend,
            logger: ExecutionLogger::new(config.log_path.clone()),
            wall_timeout_seconds: config.runtime.wall_timeout_seconds,
        })
    }

    pub const fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub const fn logger(&self) -> &ExecutionLogger {
        &self.logger
    }

    /// Run a single inline source file.
    pub async fn run_snippet(&self, code: String, language: Language) -> RunResponse {
        let _permit = match self.admission.acquire().await {
            Ok(permit) => permit,
            Err(e) => return RunResponse::error_only(Outcome::Rejected, e.to_string()),
        };

        info!(%language, code_len = code.len(), "Running snippet");
        let snapshot = code.clone();
        let request = ExecutionRequest::Snippet {
            source_code: code,
            language,
        };
        let prepared = match self.prepare(request).await {
            Ok(prepared) => prepared,
            Err(e) => return self.reject(&e, &snapshot).await,
        };

        let attempt = self.attempt(prepared).await;
        self.snippet_response(attempt)
    }

    /// Extract and run a project archive.
    pub async fn run_project(&self, archive_path: Option<PathBuf>) -> RunResponse {
        let _permit = match self.admission.acquire().await {
            Ok(permit) => permit,
            Err(e) => return RunResponse::error_only(Outcome::Rejected, e.to_string()),
        };

        info!(archive = ?archive_path, "Running project");
        let root = self.builder.workspace_root().to_path_buf();
        let label = archive_path.as_ref().map_or_else(
            || "<no archive>".to_string(),
            |p| format!("<project archive {}>", p.display()),
        );

        let extracted = tokio::task::spawn_blocking(move || {
            archive::extract_project(archive_path.as_deref(), &root)
        })
        .await
        .map_err(|e| ExecutionError::System(format!("Archive extraction task failed: {e}")))
        .and_then(|r| r);
        let workspace = match extracted {
            Ok(workspace) => workspace,
            Err(e) => return self.reject(&e, &label).await,
        };

        let prepared = match self.prepare(ExecutionRequest::Project { workspace }).await {
            Ok(prepared) => prepared,
            Err(e) => return self.reject(&e, &label).await,
        };

        let attempt = self.attempt(prepared).await;
        self.project_response(attempt)
    }

    /// Build the request off the async workers; it touches the filesystem.
    async fn prepare(&self, request: ExecutionRequest) -> Result<PreparedExecution, ExecutionError> {
        let builder = self.builder.clone();
        tokio::task::spawn_blocking(move || builder.build(request))
            .await
            .map_err(|e| ExecutionError::System(format!("Request preparation task failed: {e}")))?
    }

    /// Run, classify and record. The workspace is removed on return.
    async fn attempt(&self, prepared: PreparedExecution) -> Attempt {
        let PreparedExecution {
            spec,
            workspace,
            source_snapshot,
        } = prepared;

        let attempt = match self.backend.run(&spec).await {
            Ok(result) => Attempt {
                outcome: classify_result(&result),
                result: Ok(result),
            },
            Err(e) => {
                error!(error = %e, "Isolation runtime invocation failed");
                Attempt {
                    outcome: Outcome::SystemError,
                    result: Err(format!("{e:#}")),
                }
            }
        };

        if let Err(e) = workspace.close() {
            warn!(error = %e, "Failed to remove workspace");
        }

        let entry = match &attempt.result {
            Ok(result) => LogEntry::new(
                attempt.outcome,
                result.exit_code,
                &source_snapshot,
                &result.stdout,
                &result.stderr,
            ),
            Err(message) => LogEntry::new(attempt.outcome, -1, &source_snapshot, "", message),
        };
        self.record(&entry).await;

        match &attempt.result {
            Ok(result) => info!(
                outcome = %attempt.outcome,
                exit_code = result.exit_code,
                duration_ms = result.duration_ms,
                "Execution finished"
            ),
            Err(_) => info!(outcome = %attempt.outcome, "Execution finished"),
        }
        attempt
    }

    /// Report a failure that happened before the runtime was invoked.
    ///
    /// Input errors are not audited; system errors are.
    async fn reject(&self, err: &ExecutionError, snapshot: &str) -> RunResponse {
        let response = RunResponse::from_error(err);
        match err {
            ExecutionError::Input(message) => info!(reason = %message, "Rejected invalid request"),
            ExecutionError::System(message) => {
                error!(error = %message, "Failed to prepare execution");
                self.record(&LogEntry::new(Outcome::SystemError, -1, snapshot, "", message))
                    .await;
            }
        }
        response
    }

    /// Audit failures are logged and otherwise ignored.
    async fn record(&self, entry: &LogEntry) {
        if let Err(e) = self.logger.append(entry).await {
            let message = format!("{e:#}");
            error!(error = %message, "Failed to write audit log entry");
        }
    }

    fn timeout_message(&self) -> String {
        format!(
            "Execution stopped: wall-clock limit of {}s exceeded",
            self.wall_timeout_seconds
        )
    }

    fn snippet_response(&self, attempt: Attempt) -> RunResponse {
        let outcome = attempt.outcome;
        let result = match attempt.result {
            Ok(result) => result,
            Err(message) => return RunResponse::error_only(outcome, message),
        };
        let (output, error) = match outcome {
            Outcome::Success => (result.stdout, String::new()),
            Outcome::Killed => (String::new(), KILLED_MESSAGE.to_string()),
            Outcome::TimedOut => (String::new(), self.timeout_message()),
            _ => (result.stdout, result.stderr),
        };
        RunResponse {
            output: Some(output),
            error,
            return_code: None,
            outcome,
        }
    }

    fn project_response(&self, attempt: Attempt) -> RunResponse {
        let outcome = attempt.outcome;
        match attempt.result {
            Ok(result) if outcome == Outcome::TimedOut => RunResponse {
                output: Some(String::new()),
                error: self.timeout_message(),
                return_code: Some(result.exit_code),
                outcome,
            },
            Ok(result) => RunResponse {
                output: Some(result.stdout),
                error: result.stderr,
                return_code: Some(result.exit_code),
                outcome,
            },
            Err(message) => RunResponse::error_only(outcome, message),
        }
    }
}
