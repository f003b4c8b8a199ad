//! Durable run registry.
//!
//! The registry is the sole owner of run records. All mutation goes
//! through [`RunRegistry::update`], which applies a closure to the run
//! under the write lock and persists the whole registry before
//! returning, so observers never see a half-applied transition.

pub mod run;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RegistryError;
use run::{PipelineRun, RunStatus};

/// File inside the data directory holding the serialized registry.
const REGISTRY_FILENAME: &str = "runs.json";

/// Sort key for run listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    CreatedAt,
    UpdatedAt,
    Status,
}

/// Sort direction for run listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDir {
    Asc,
    Desc,
}

/// Filter and paging parameters for [`RunRegistry::list`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunQuery {
    /// Case-insensitive substring match on the document name.
    pub q: Option<String>,
    /// Keep only runs with this status.
    pub status: Option<RunStatus>,
    /// Include soft-deleted runs.
    #[serde(default)]
    pub include_deleted: bool,
    pub sort_by: Option<SortBy>,
    pub sort_dir: Option<SortDir>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// One page of a run listing.
#[derive(Debug, Clone, Serialize)]
pub struct RunPage {
    /// Runs in this page.
    pub runs: Vec<PipelineRun>,
    /// Total matches before paging.
    pub total: usize,
}

/// On-disk shape of the registry file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    runs: Vec<PipelineRun>,
}

/// In-memory run index backed by a JSON file.
#[derive(Debug)]
pub struct RunRegistry {
    registry_path: PathBuf,
    runs: RwLock<HashMap<Uuid, PipelineRun>>,
}

impl RunRegistry {
    /// Opens the registry under a data directory, loading any existing
    /// registry file.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` if the directory cannot be created or an
    /// existing registry file cannot be read or parsed.
    pub async fn open(data_path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let data_path = data_path.as_ref();
        tokio::fs::create_dir_all(data_path).await?;
        let registry_path = data_path.join(REGISTRY_FILENAME);

        let runs = if registry_path.exists() {
            let content = tokio::fs::read_to_string(&registry_path).await?;
            let file: RegistryFile = serde_json::from_str(&content)?;
            info!(
                path = %registry_path.display(),
                count = file.runs.len(),
                "Loaded run registry"
            );
            file.runs.into_iter().map(|r| (r.id, r)).collect()
        } else {
            debug!(path = %registry_path.display(), "Starting with empty run registry");
            HashMap::new()
        };

        Ok(Self {
            registry_path,
            runs: RwLock::new(runs),
        })
    }

    /// Registers a new run and persists it.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` if persisting fails.
    pub async fn create(&self, run: PipelineRun) -> Result<Uuid, RegistryError> {
        let id = run.id;
        let mut runs = self.runs.write().await;
        runs.insert(id, run);
        self.save_locked(&runs).await?;
        info!(run_id = %id, "Registered pipeline run");
        Ok(id)
    }

    /// Returns a snapshot of a run.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::RunNotFound` if no run has this id.
    pub async fn get(&self, id: Uuid) -> Result<PipelineRun, RegistryError> {
        let runs = self.runs.read().await;
        runs.get(&id)
            .cloned()
            .ok_or(RegistryError::RunNotFound(id))
    }

    /// Applies a mutation to a run under the write lock and persists the
    /// result. The mutation's return value is passed through.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::RunNotFound` if no run has this id; the
    /// mutation's own error otherwise. The mutation runs against a staged
    /// copy, so a failing closure leaves both the in-memory run and the
    /// registry file exactly as they were.
    pub async fn update<T>(
        &self,
        id: Uuid,
        mutate: impl FnOnce(&mut PipelineRun) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(&id).ok_or(RegistryError::RunNotFound(id))?;
        let mut staged = run.clone();
        let value = mutate(&mut staged)?;
        staged.touch();
        *run = staged;
        self.save_locked(&runs).await?;
        Ok(value)
    }

    /// Marks a run deleted without discarding its history or artifacts.
    ///
    /// Idempotent: deleting an already-deleted run succeeds.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::RunNotFound` if no run has this id.
    pub async fn soft_delete(&self, id: Uuid) -> Result<(), RegistryError> {
        self.update(id, |run| {
            if run.deleted {
                debug!(run_id = %id, "Run already soft-deleted");
            }
            run.deleted = true;
            Ok(())
        })
        .await?;
        info!(run_id = %id, "Soft-deleted pipeline run");
        Ok(())
    }

    /// Removes a run record entirely and persists the removal.
    ///
    /// Unlike [`RunRegistry::soft_delete`], the row is gone afterwards:
    /// subsequent gets answer `RunNotFound` and listings never see it.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::RunNotFound` if no run has this id.
    pub async fn delete(&self, id: Uuid) -> Result<(), RegistryError> {
        let mut runs = self.runs.write().await;
        if runs.remove(&id).is_none() {
            return Err(RegistryError::RunNotFound(id));
        }
        self.save_locked(&runs).await?;
        info!(run_id = %id, "Hard-deleted pipeline run");
        Ok(())
    }

    /// Lists runs matching a query, soft-deleted runs excluded unless
    /// requested.
    pub async fn list(&self, query: &RunQuery) -> RunPage {
        let runs = self.runs.read().await;

        let needle = query.q.as_deref().map(str::to_lowercase);
        let mut matches: Vec<PipelineRun> = runs
            .values()
            .filter(|run| query.include_deleted || !run.deleted)
            .filter(|run| match query.status {
                Some(status) => run.status == status,
                None => true,
            })
            .filter(|run| match &needle {
                Some(n) => run.document.name().to_lowercase().contains(n),
                None => true,
            })
            .cloned()
            .collect();

        let sort_by = query.sort_by.unwrap_or(SortBy::CreatedAt);
        matches.sort_by(|a, b| {
            let ord = match sort_by {
                SortBy::CreatedAt => a.created_at.cmp(&b.created_at),
                SortBy::UpdatedAt => a.updated_at.cmp(&b.updated_at),
                SortBy::Status => a.status.cmp(&b.status),
            };
            match query.sort_dir.unwrap_or(SortDir::Desc) {
                SortDir::Asc => ord,
                SortDir::Desc => ord.reverse(),
            }
        });

        let total = matches.len();
        let offset = query.offset.unwrap_or(0).min(total);
        let end = match query.limit {
            Some(limit) => (offset + limit).min(total),
            None => total,
        };
        let page = matches[offset..end].to_vec();

        RunPage { runs: page, total }
    }

    /// Writes the registry file from an already-held lock.
    async fn save_locked(
        &self,
        runs: &HashMap<Uuid, PipelineRun>,
    ) -> Result<(), RegistryError> {
        let file = RegistryFile {
            runs: runs.values().cloned().collect(),
        };
        let content = serde_json::to_string_pretty(&file)?;

        if let Err(e) = tokio::fs::write(&self.registry_path, &content).await {
            warn!(
                path = %self.registry_path.display(),
                error = %e,
                "Failed to persist run registry"
            );
            return Err(e.into());
        }
        Ok(())
    }
}
