//! Docker-compatible CLI backend.
//!
//! Runs `<binary> run ...` as a child process with a fixed set of
//! isolation flags. Works with any CLI that accepts docker's `run` and
//! `kill` syntax (docker, podman).

use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use super::{ExecutionResult, IsolationBackend};
use crate::config::RuntimeConfig;
use crate::request::IsolationSpec;

/// Upper bound on the best-effort `kill` issued after a timeout.
const KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Backend that shells out to a docker-compatible CLI.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    binary: String,
    wall_timeout: Duration,
}

impl DockerBackend {
    pub fn new(binary: impl Into<String>, wall_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            wall_timeout,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(
            config.binary.clone(),
            Duration::from_secs(config.wall_timeout_seconds),
        )
    }

    /// Arguments passed to the CLI for one spec.
    ///
    /// The workspace is the only bind mount; everything else is read-only
    /// and there is no network.
    pub fn args(spec: &IsolationSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            spec.name.clone(),
        ];
        if spec.read_only_root() {
            args.push("--read-only".to_string());
        }
        args.extend([
            "--network".to_string(),
            spec.network_mode().to_string(),
            format!("--memory={}m", spec.limits.memory_mb),
            format!("--cpus={}", spec.limits.cpus),
            "--ulimit".to_string(),
            format!("cpu={}", spec.limits.cpu_time_seconds),
            "-v".to_string(),
            format!("{}:{}", spec.mount_source.display(), spec.mount_target),
            spec.image.clone(),
        ]);
        args.extend(spec.command.iter().cloned());
        args
    }

    /// Stop a container whose CLI client we already killed.
    async fn kill_container(&self, name: &str) {
        let kill = Command::new(&self.binary)
            .args(["kill", name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        match tokio::time::timeout(KILL_TIMEOUT, kill).await {
            Ok(Ok(status)) if status.success() => debug!(container = %name, "Killed container"),
            Ok(Ok(status)) => debug!(container = %name, %status, "Container already gone"),
            Ok(Err(e)) => warn!(container = %name, error = %e, "Failed to kill container"),
            Err(_) => warn!(container = %name, "Timed out killing container"),
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl IsolationBackend for DockerBackend {
    #[instrument(skip(self, spec), fields(container = %spec.name, image = %spec.image))]
    async fn run(&self, spec: &IsolationSpec) -> Result<ExecutionResult> {
        let args = Self::args(spec);
        debug!(binary = %self.binary, ?args, "Invoking isolation runtime");

        let start = Instant::now();
        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn isolation runtime: {}", self.binary))?;

        let mut child_stdout = child.stdout.take().context("Failed to open stdout")?;
        let mut child_stderr = child.stderr.take().context("Failed to open stderr")?;

        // Borrows `child` only until the timeout resolves, so it can still
        // be killed afterwards.
        let run_to_exit = async {
            let mut stdout_buf = Vec::new();
            let mut stderr_buf = Vec::new();
            let (r1, r2) = tokio::join!(
                child_stdout.read_to_end(&mut stdout_buf),
                child_stderr.read_to_end(&mut stderr_buf),
            );
            r1.context("Failed to read stdout")?;
            r2.context("Failed to read stderr")?;
            let status = child.wait().await.context("Failed to wait for process")?;
            Ok::<_, anyhow::Error>((status, stdout_buf, stderr_buf))
        };

        let Ok(finished) = tokio::time::timeout(self.wall_timeout, run_to_exit).await else {
            warn!(
                timeout_ms = u64::try_from(self.wall_timeout.as_millis()).unwrap_or(u64::MAX),
                "Wall-clock limit reached, stopping container"
            );
            if let Err(e) = child.kill().await {
                debug!(error = %e, "Runtime client already exited");
            }
            self.kill_container(&spec.name).await;
            return Ok(ExecutionResult {
                exit_code: -1,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: elapsed_ms(start),
                timed_out: true,
            });
        };
        let (status, stdout_buf, stderr_buf) = finished?;

        let result = ExecutionResult {
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
            duration_ms: elapsed_ms(start),
            timed_out: false,
        };

        debug!(
            exit_code = result.exit_code,
            duration_ms = result.duration_ms,
            "Execution completed"
        );

        Ok(result)
    }
}
