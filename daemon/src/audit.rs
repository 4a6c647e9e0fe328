//! Append-only execution audit log.
//!
//! One text block per execution attempt, written in append order. The
//! log is meant to be read sequentially by a human or by `history`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::outcome::Outcome;

const SEPARATOR: &str = "----------------------------";
const NO_HISTORY: &str = "No history available.";

/// One audit record. Never modified after it is written.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub outcome: Outcome,
    pub exit_code: i32,
    pub source_snapshot: String,
    pub stdout: String,
    pub stderr: String,
}

impl LogEntry {
    pub fn new(
        outcome: Outcome,
        exit_code: i32,
        source_snapshot: &str,
        stdout: &str,
        stderr: &str,
    ) -> Self {
        Self {
            timestamp: Local::now(),
            outcome,
            exit_code,
            source_snapshot: source_snapshot.to_string(),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    /// Render the block exactly as it lands in the log file.
    pub fn render(&self) -> String {
        format!(
            "\n{SEPARATOR}\n\
             TIME: {time}\n\
             STATUS: {status}\n\
             RETURN CODE: {code}\n\
             \n\
             USER CODE:\n{source}\n\
             \n\
             OUTPUT:\n{stdout}\n\
             \n\
             ERROR:\n{stderr}\n\
             {SEPARATOR}\n",
            time = self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            status = self.outcome.label(),
            code = self.exit_code,
            source = self.source_snapshot,
            stdout = self.stdout,
            stderr = self.stderr,
        )
    }
}

/// Single-writer appender for the audit log.
#[derive(Debug)]
pub struct ExecutionLogger {
    path: PathBuf,
    writer: Mutex<()>,
}

impl ExecutionLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(()),
        }
    }

    /// Append one entry as a single write.
    ///
    /// Concurrent callers are serialized, so entries never interleave.
    pub async fn append(&self, entry: &LogEntry) -> Result<()> {
        let block = entry.render();
        let _writer = self.writer.lock().await;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open audit log {}", self.path.display()))?;
        file.write_all(block.as_bytes())
            .await
            .context("Failed to write audit log entry")?;
        file.flush().await.context("Failed to flush audit log")?;

        debug!(status = entry.outcome.label(), exit_code = entry.exit_code, "Recorded execution");
        Ok(())
    }

    /// Full log contents, or a placeholder when nothing has been logged.
    pub async fn read_history(&self) -> String {
        let _writer = self.writer.lock().await;
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "No readable audit log");
                NO_HISTORY.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn count_entries(log: &str) -> usize {
        log.matches("\nTIME: ").count()
    }

    #[test]
    fn render_layout() {
        let entry = LogEntry::new(Outcome::RuntimeError, 1, "raise x", "", "Traceback\n");
        let block = entry.render();

        assert!(block.starts_with(&format!("\n{SEPARATOR}\nTIME: ")));
        assert!(block.contains("STATUS: RUNTIME ERROR\nRETURN CODE: 1\n\nUSER CODE:\nraise x\n"));
        assert!(block.contains("\nOUTPUT:\n\n\nERROR:\nTraceback\n\n"));
        assert!(block.ends_with(&format!("{SEPARATOR}\n")));
    }

    #[tokio::test]
    async fn append_creates_directory_and_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let logger = ExecutionLogger::new(dir.path().join("logs/executions.log"));

        logger
            .append(&LogEntry::new(Outcome::Success, 0, "print(1)", "1\n", ""))
            .await
            .unwrap();
        logger
            .append(&LogEntry::new(Outcome::SystemError, -1, "print(2)", "", "boom"))
            .await
            .unwrap();

        let log = logger.read_history().await;
        assert_eq!(count_entries(&log), 2);
        let first = log.find("STATUS: SUCCESS").unwrap();
        let second = log.find("STATUS: SYSTEM ERROR").unwrap();
        assert!(first < second);
        assert!(log.contains("RETURN CODE: -1"));
    }

    #[tokio::test]
    async fn history_without_log() {
        let dir = tempfile::tempdir().unwrap();
        let logger = ExecutionLogger::new(dir.path().join("missing.log"));
        assert_eq!(logger.read_history().await, "No history available.");
    }

    #[tokio::test]
    async fn append_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the log file should be
        let logger = ExecutionLogger::new(dir.path());
        let result = logger
            .append(&LogEntry::new(Outcome::Success, 0, "", "", ""))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Arc::new(ExecutionLogger::new(dir.path().join("executions.log")));
        let big_output = "y".repeat(64 * 1024);

        let mut handles = Vec::new();
        for i in 0..32 {
            let logger = Arc::clone(&logger);
            let output = big_output.clone();
            handles.push(tokio::spawn(async move {
                let entry = LogEntry::new(Outcome::Success, 0, &format!("run {i}"), &output, "");
                logger.append(&entry).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let log = logger.read_history().await;
        assert_eq!(count_entries(&log), 32);
        for i in 0..32 {
            assert_eq!(log.matches(&format!("USER CODE:\nrun {i}\n")).count(), 1);
        }
        // Every block is intact: separators pair up around each entry
        assert_eq!(log.matches(SEPARATOR).count(), 64);
        for block in log.split(&format!("{SEPARATOR}\n\n{SEPARATOR}")) {
            assert!(block.matches(&big_output).count() <= 1);
        }
    }
}
