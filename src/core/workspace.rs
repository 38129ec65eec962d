//! Per-run scratch directories.
//!
//! One [`WorkspaceManager`] owns the temporary root of one experiment. Each run
//! gets its own directory under that root, created before launch and removed
//! at teardown. The root itself is a [`TempDir`], so it is removed when the
//! manager is dropped even if `cleanup` was never reached.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tempfile::TempDir;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Prefix for experiment temp roots
const ROOT_PREFIX: &str = "act-";

/// Owner of every workspace in an experiment
#[derive(Debug)]
pub struct WorkspaceManager {
    root: TempDir,
    workspaces: Mutex<HashMap<String, PathBuf>>,
}

impl WorkspaceManager {
    /// Create a manager rooted in the system temp directory
    pub fn new() -> io::Result<Self> {
        let root = tempfile::Builder::new().prefix(ROOT_PREFIX).tempdir()?;
        Ok(Self::with_root(root))
    }

    /// Create a manager whose temp root lives under `parent`
    pub fn new_in(parent: &Path) -> io::Result<Self> {
        fs::create_dir_all(parent)?;
        let root = tempfile::Builder::new()
            .prefix(ROOT_PREFIX)
            .tempdir_in(parent)?;
        Ok(Self::with_root(root))
    }

    fn with_root(root: TempDir) -> Self {
        debug!(root = %root.path().display(), "Created workspace root");
        Self {
            root,
            workspaces: Mutex::new(HashMap::new()),
        }
    }

    /// Experiment temp root
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, PathBuf>> {
        self.workspaces
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Workspace for `run_id`, created if absent
    pub fn create(&self, run_id: &str) -> io::Result<PathBuf> {
        let mut workspaces = self.registry();
        if let Some(existing) = workspaces.get(run_id) {
            if existing.exists() {
                return Ok(existing.clone());
            }
        }

        let workspace = self.root.path().join(run_id);
        fs::create_dir_all(&workspace)?;
        workspaces.insert(run_id.to_string(), workspace.clone());
        Ok(workspace)
    }

    /// Workspace path for `run_id`, if one was created
    pub fn get(&self, run_id: &str) -> Option<PathBuf> {
        self.registry().get(run_id).cloned()
    }

    /// Copy the workspace of `run_id` into `dest`, recursively.
    ///
    /// Best effort: entries that fail to copy are logged and skipped. Does
    /// nothing if the workspace no longer exists. Returns the number of files
    /// copied.
    pub fn copy_results(&self, run_id: &str, dest: &Path) -> usize {
        let Some(workspace) = self.get(run_id) else {
            return 0;
        };
        if !workspace.exists() {
            return 0;
        }

        let mut copied = 0;
        for entry in WalkDir::new(&workspace).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(%run_id, error = %e, "Skipping unreadable workspace entry");
                    continue;
                }
            };

            let Ok(relative) = entry.path().strip_prefix(&workspace) else {
                continue;
            };
            let target = dest.join(relative);

            let result = if entry.file_type().is_dir() {
                fs::create_dir_all(&target)
            } else if entry.file_type().is_file() {
                copy_file(entry.path(), &target).map(|_| copied += 1)
            } else {
                // Symlinks and special files stay behind
                Ok(())
            };

            if let Err(e) = result {
                warn!(
                    %run_id,
                    path = %entry.path().display(),
                    error = %e,
                    "Failed to copy workspace entry"
                );
            }
        }

        copied
    }

    /// Remove every workspace and the temp root. Never fails.
    pub fn cleanup(&self) {
        let mut workspaces = self.registry();
        for (run_id, workspace) in workspaces.drain() {
            if workspace.exists() {
                if let Err(e) = fs::remove_dir_all(&workspace) {
                    warn!(%run_id, error = %e, "Failed to remove workspace");
                }
            }
        }

        let root = self.root.path();
        if root.exists() {
            if let Err(e) = fs::remove_dir_all(root) {
                warn!(root = %root.display(), error = %e, "Failed to remove workspace root");
            }
        }
    }
}

fn copy_file(source: &Path, target: &Path) -> io::Result<u64> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, target)
}
