//! Per-run artifact roots.
//!
//! Every run gets its own directory keyed by run id. Paths handed in by
//! callers are run-relative and are rejected if they would escape the
//! run's root.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Errors that can occur during artifact operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The relative path tries to escape the run's artifact root.
    #[error("Invalid artifact path '{0}'")]
    InvalidPath(String),

    /// The requested artifact does not exist.
    #[error("Artifact '{path}' not found for run {run_id}")]
    NotFound { run_id: Uuid, path: String },

    /// IO error while reading or writing artifacts.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Store of per-run artifact directories under a common base path.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    base_path: PathBuf,
}

impl ArtifactStore {
    /// Creates a store rooted at the given base directory. The directory
    /// is created lazily on first write.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// The artifact root directory of a run.
    pub fn run_root(&self, run_id: Uuid) -> PathBuf {
        self.base_path.join(run_id.to_string())
    }

    /// Writes an artifact under the run's root, creating parent
    /// directories as needed.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidPath` for absolute or parent-escaping
    /// paths, `StorageError::Io` on write failure.
    pub async fn store(
        &self,
        run_id: Uuid,
        relative: &str,
        contents: &[u8],
    ) -> Result<PathBuf, StorageError> {
        let target = self.resolve(run_id, relative)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, contents).await?;
        debug!(run_id = %run_id, path = relative, bytes = contents.len(), "Stored artifact");
        Ok(target)
    }

    /// Reads an artifact from the run's root.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the artifact does not exist.
    pub async fn read(&self, run_id: Uuid, relative: &str) -> Result<Vec<u8>, StorageError> {
        let target = self.resolve(run_id, relative)?;
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                run_id,
                path: relative.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists run-relative paths of all artifacts stored for a run.
    ///
    /// A run with no artifact root yet lists as empty.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` on directory traversal failure.
    pub async fn list(&self, run_id: Uuid) -> Result<Vec<String>, StorageError> {
        let root = self.run_root(run_id);
        if !root.exists() {
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        let mut pending = vec![root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(rel) = path.strip_prefix(&root) {
                    found.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        found.sort();
        Ok(found)
    }

    /// Removes a run's entire artifact root.
    ///
    /// A run that never wrote an artifact removes as a no-op.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the directory exists but cannot be
    /// removed.
    pub async fn remove_run(&self, run_id: Uuid) -> Result<(), StorageError> {
        let root = self.run_root(run_id);
        match tokio::fs::remove_dir_all(&root).await {
            Ok(()) => {
                debug!(run_id = %run_id, "Removed artifact root");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolves a run-relative path, rejecting escapes.
    fn resolve(&self, run_id: Uuid, relative: &str) -> Result<PathBuf, StorageError> {
        let rel = Path::new(relative);
        let escapes = rel.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if relative.is_empty() || escapes {
            return Err(StorageError::InvalidPath(relative.to_string()));
        }
        Ok(self.run_root(run_id).join(rel))
    }
}
