//! Per-request ephemeral workspaces.
//!
//! A workspace is a uniquely named directory under the configured root.
//! It is bind-mounted into the container and removed when the
//! [`Workspace`] is dropped, whatever path the request took.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

const WORKSPACE_PREFIX: &str = "sandbox-run-";

#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl Workspace {
    /// Create a fresh, empty workspace directory under `root`.
    pub fn create(root: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(root)?;
        let path = dir.path().to_path_buf();
        debug!(path = %path.display(), "Created workspace");
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the workspace now and report whether that worked.
    ///
    /// Dropping does the same but can only log failures.
    pub fn close(mut self) -> io::Result<()> {
        match self.dir.take() {
            Some(dir) => dir.close(),
            None => Ok(()),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                warn!(path = %self.path.display(), error = %e, "Failed to remove workspace");
            } else {
                debug!(path = %self.path.display(), "Removed workspace");
            }
        }
    }
}
