//! Per-job filesystem areas.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use crate::{hashing::JobId, Error, Result};

/// Roots under which each job owns a `<job_id>` directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStorage {
    workspace_root: PathBuf,
    filestorage_root: PathBuf,
}

impl JobStorage {
    #[must_use]
    pub fn new(workspace_root: impl Into<PathBuf>, filestorage_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            filestorage_root: filestorage_root.into(),
        }
    }

    #[must_use]
    pub fn workspace_dir(&self, id: &JobId) -> PathBuf {
        self.workspace_root.join(id.as_str())
    }

    #[must_use]
    pub fn filestorage_dir(&self, id: &JobId) -> PathBuf {
        self.filestorage_root.join(id.as_str())
    }

    pub async fn create(&self, id: &JobId) -> Result<()> {
        for dir in [self.workspace_dir(id), self.filestorage_dir(id)] {
            tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                Error::Io(format!("Failed to create {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }

    /// Delete both areas. A directory that does not exist counts as removed.
    ///
    /// # Errors
    ///
    /// `CleanupFailed` naming the first directory that could not be removed.
    pub async fn remove(&self, id: &JobId) -> Result<()> {
        for dir in [self.workspace_dir(id), self.filestorage_dir(id)] {
            remove_tree(&dir).await.map_err(|e| Error::CleanupFailed {
                job_id: id.to_string(),
                reason: format!("{}: {e}", dir.display()),
            })?;
        }
        Ok(())
    }
}

async fn remove_tree(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
