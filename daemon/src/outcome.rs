//! Outcome classification.
//!
//! The container runtime never says *why* a process died. A nonzero exit
//! with no output at all is the only proxy we have for "stopped by a
//! memory or CPU-time limit", so that is what [`classify`] reports as
//! [`Outcome::Killed`]. It cannot tell an OOM kill from a CPU-time kill,
//! nor from a program that deliberately exits nonzero in silence.

use std::fmt;

use crate::backend::ExecutionResult;

/// Classified result of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Nonzero exit with empty stdout and stderr (inferred limit kill).
    Killed,
    /// Our own wall-clock watchdog stopped the run.
    TimedOut,
    RuntimeError,
    InputError,
    SystemError,
    /// Turned away by admission control; never executed.
    Rejected,
}

impl Outcome {
    /// Status label written to the audit log.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Killed => "EXECUTION STOPPED (Killed by runtime)",
            Self::TimedOut => "EXECUTION STOPPED (Wall-clock timeout)",
            Self::RuntimeError => "RUNTIME ERROR",
            Self::InputError => "INPUT ERROR",
            Self::SystemError => "SYSTEM ERROR",
            Self::Rejected => "REJECTED",
        }
    }

    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub fn classify(exit_code: i32, stdout: &str, stderr: &str) -> Outcome {
    if exit_code == 0 {
        Outcome::Success
    } else if stdout.is_empty() && stderr.is_empty() {
        Outcome::Killed
    } else {
        Outcome::RuntimeError
    }
}

/// Like [`classify`], but a watchdog timeout wins over the exit signals.
pub fn classify_result(result: &ExecutionResult) -> Outcome {
    if result.timed_out {
        Outcome::TimedOut
    } else {
        classify(result.exit_code, &result.stdout, &result.stderr)
    }
}
