//! Daemon configuration.
//!
//! Configuration is JSON. It is read from the `SANDBOX_RUNNER_CONFIG`
//! environment variable or from a file passed on the command line; every
//! field has a default so an empty object (or no configuration at all) is
//! valid.

use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

/// Top-level configuration for the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Admission control settings.
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Isolation runtime invocation settings.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Resource limits applied to every execution.
    #[serde(default)]
    pub limits: ResourceLimits,

    /// Container images per language.
    #[serde(default)]
    pub images: ImageConfig,

    /// Directory under which per-request workspaces are created.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    /// Path of the append-only execution audit log.
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,

    /// Maximum length of an inline snippet, in characters.
    #[serde(default = "default_max_code_chars")]
    pub max_code_chars: usize,
}

/// How many executions may run at once, and what happens to the rest.
#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    /// Maximum number of concurrently running containers.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Maximum number of requests allowed to wait for a slot.
    /// `None` means requests wait indefinitely.
    #[serde(default)]
    pub max_queued: Option<usize>,
}

/// Settings for the container CLI.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Container CLI binary (`docker`, `podman`, ...).
    #[serde(default = "default_runtime_binary")]
    pub binary: String,

    /// Wall-clock limit for one invocation, in seconds.
    #[serde(default = "default_wall_timeout")]
    pub wall_timeout_seconds: u64,

    /// Mount point of the workspace inside the container.
    #[serde(default = "default_mount_target")]
    pub mount_target: String,
}

/// Limits enforced by the isolation runtime.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in MiB.
    #[serde(default = "default_memory")]
    pub memory_mb: u64,

    /// Fraction of a CPU core.
    #[serde(default = "default_cpus")]
    pub cpus: f64,

    /// CPU-time ulimit in seconds.
    #[serde(default = "default_cpu_time")]
    pub cpu_time_seconds: u64,
}

/// Runtime image for each supported language.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageConfig {
    #[serde(default = "default_python_image")]
    pub python: String,

    #[serde(default = "default_javascript_image")]
    pub javascript: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            admission: AdmissionConfig::default(),
            runtime: RuntimeConfig::default(),
            limits: ResourceLimits::default(),
            images: ImageConfig::default(),
            workspace_root: default_workspace_root(),
            log_path: default_log_path(),
            max_code_chars: default_max_code_chars(),
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            max_queued: None,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: default_runtime_binary(),
            wall_timeout_seconds: default_wall_timeout(),
            mount_target: default_mount_target(),
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: default_memory(),
            cpus: default_cpus(),
            cpu_time_seconds: default_cpu_time(),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            python: default_python_image(),
            javascript: default_javascript_image(),
        }
    }
}

impl Config {
    /// Load configuration from the `SANDBOX_RUNNER_CONFIG` environment
    /// variable, falling back to defaults when it is unset.
    ///
    /// `MAX_PARALLEL_EXECUTIONS` and `SANDBOX_RUNTIME` override the
    /// corresponding fields afterwards.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("SANDBOX_RUNNER_CONFIG") {
            Ok(json) => Self::from_json(&json).context("Failed to parse SANDBOX_RUNNER_CONFIG")?,
            Err(_) => {
                debug!("SANDBOX_RUNNER_CONFIG not set, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load configuration from a JSON file, then apply env overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_json(&json)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Create a config from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var("MAX_PARALLEL_EXECUTIONS") {
            self.admission.max_parallel = value
                .parse()
                .with_context(|| format!("Invalid MAX_PARALLEL_EXECUTIONS: '{value}'"))?;
            info!(max_parallel = self.admission.max_parallel, "Parallelism overridden from env");
        }
        if let Ok(binary) = std::env::var("SANDBOX_RUNTIME") {
            info!(runtime = %binary, "Runtime binary overridden from env");
            self.runtime.binary = binary;
        }
        Ok(())
    }

    /// Reject configurations the orchestrator cannot honour.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.admission.max_parallel > 0, "admission.max_parallel must be at least 1");
        ensure!(self.limits.memory_mb > 0, "limits.memory_mb must be positive");
        ensure!(
            self.limits.cpus.is_finite() && self.limits.cpus > 0.0,
            "limits.cpus must be a positive number"
        );
        ensure!(self.limits.cpu_time_seconds > 0, "limits.cpu_time_seconds must be positive");
        ensure!(
            self.runtime.wall_timeout_seconds > 0,
            "runtime.wall_timeout_seconds must be positive"
        );
        ensure!(!self.runtime.binary.is_empty(), "runtime.binary must not be empty");
        ensure!(
            self.runtime.mount_target.starts_with('/'),
            "runtime.mount_target must be an absolute path, got '{}'",
            self.runtime.mount_target
        );
        ensure!(self.max_code_chars > 0, "max_code_chars must be positive");
        Ok(())
    }

    /// Resolve the workspace root to an absolute path.
    ///
    /// Bind mounts need absolute host paths.
    pub fn resolved_workspace_root(&self) -> Result<PathBuf> {
        if self.workspace_root.is_absolute() {
            return Ok(self.workspace_root.clone());
        }
        let cwd = std::env::current_dir().context("Failed to read current directory")?;
        Ok(cwd.join(&self.workspace_root))
    }
}

fn default_workspace_root() -> PathBuf {
    ".".into()
}

fn default_log_path() -> PathBuf {
    "logs/executions.log".into()
}

const fn default_max_code_chars() -> usize {
    5000
}

const fn default_max_parallel() -> usize {
    5
}

fn default_runtime_binary() -> String {
    "docker".into()
}

const fn default_wall_timeout() -> u64 {
    30
}

fn default_mount_target() -> String {
    "/app".into()
}

const fn default_memory() -> u64 {
    128
}

const fn default_cpus() -> f64 {
    0.5
}

const fn default_cpu_time() -> u64 {
    10
}

fn default_python_image() -> String {
    "python:3.11-slim".into()
}

fn default_javascript_image() -> String {
    "node:18-slim".into()
}
