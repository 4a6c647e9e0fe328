//! Project archive extraction.
//!
//! Projects arrive as tar archives. Each one is unpacked into its own
//! fresh [`Workspace`]. Only regular files and directories are accepted:
//! a link could point the workspace at arbitrary host files.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use tracing::{debug, warn};

use crate::error::ExecutionError;
use crate::workspace::Workspace;

const NO_UPLOAD: &str = "No file uploaded";
const INVALID_ARCHIVE: &str = "Invalid archive file";

/// Unpack `archive` into a new workspace under `root`.
///
/// This is blocking I/O; async callers should run it on a blocking thread.
pub fn extract_project(archive: Option<&Path>, root: &Path) -> Result<Workspace, ExecutionError> {
    let archive_path = archive
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| ExecutionError::input(NO_UPLOAD))?;

    if !archive_path.is_file() {
        debug!(path = %archive_path.display(), "Archive not found");
        return Err(ExecutionError::input(NO_UPLOAD));
    }

    let file = File::open(archive_path)?;
    let workspace = Workspace::create(root)?;

    let mut archive = tar::Archive::new(file);
    archive.set_preserve_permissions(false);
    archive.set_overwrite(true);
    match unpack_plain_entries(&mut archive, workspace.path()) {
        Ok(0) => {
            // An empty or non-tar file yields no entries without complaint
            return Err(ExecutionError::input(INVALID_ARCHIVE));
        }
        Ok(_) => {}
        Err(e) => {
            warn!(path = %archive_path.display(), error = %e, "Rejected project archive");
            return Err(ExecutionError::input(INVALID_ARCHIVE));
        }
    }

    debug!(
        archive = %archive_path.display(),
        workspace = %workspace.path().display(),
        "Extracted project"
    );
    Ok(workspace)
}

/// Unpack every entry into `dest`, refusing links, devices and paths
/// that escape `dest`. Returns the number of entries written.
fn unpack_plain_entries<R: Read>(archive: &mut tar::Archive<R>, dest: &Path) -> io::Result<usize> {
    let mut unpacked = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let kind = entry.header().entry_type();
        if !(kind.is_file() || kind.is_dir()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "unsupported entry type {kind:?} for {}",
                    entry.path()?.display()
                ),
            ));
        }
        if !entry.unpack_in(dest)? {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("entry {} escapes the workspace", entry.path()?.display()),
            ));
        }
        unpacked += 1;
    }
    Ok(unpacked)
}
