//! Stage executor.
//!
//! The executor drives a run through the canonical stage order, persisting
//! every transition through the registry so that a crash or observer poll
//! always sees a consistent stage history. Stage failures are recorded in
//! the run itself; only infrastructure failures (registry IO) surface as
//! executor errors.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::RegistryError;
use crate::mapping::MappingError;
use crate::registry::run::{DocumentSource, RunStatus, StageContribution, StageStatus, StructuredData};
use crate::registry::RunRegistry;
use crate::storage::{ArtifactStore, StorageError};

use super::config::RunConfig;
use super::stage::Stage;

/// Errors surfaced by executor entry points.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Registry operation failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Another drive already holds the run.
    #[error("Run {0} is already being executed")]
    ConcurrencyConflict(Uuid),

    /// The run is soft-deleted and cannot be executed.
    #[error("Run {0} is deleted")]
    Deleted(Uuid),

    /// No processor is registered for a stage the drive reached.
    #[error("No processor registered for stage {0}")]
    MissingProcessor(Stage),
}

/// Errors a stage processor can fail with. These are recorded on the
/// stage record; they never abort the server.
#[derive(Debug, Error)]
pub enum StageError {
    /// Processor-specific failure.
    #[error("{0}")]
    Processor(String),

    /// A required upstream contribution is missing.
    #[error("Stage {stage} needs {needs} from an earlier stage")]
    MissingInput { stage: Stage, needs: &'static str },

    /// Mapping validation or reconstruction failed.
    #[error("Mapping error: {0}")]
    Mapping(#[from] MappingError),

    /// Artifact storage failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// IO failure while reading source documents.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure while writing artifacts.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A discovery pattern failed to compile.
    #[error("Pattern error: {0}")]
    Regex(#[from] regex::Error),
}

/// Read-only snapshot a processor works against.
///
/// Processors never touch the registry; they return a contribution and
/// the executor merges it under the registry lock.
pub struct StageContext {
    pub run_id: Uuid,
    pub config: RunConfig,
    pub document: DocumentSource,
    pub data: StructuredData,
    pub artifacts: ArtifactStore,
}

/// One stage's worth of processing.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    /// The stage this processor implements.
    fn stage(&self) -> Stage;

    /// Runs the stage against a snapshot of the run.
    async fn process(&self, ctx: &StageContext) -> Result<StageContribution, StageError>;
}

/// The processors a drive dispatches to, keyed by stage.
#[derive(Clone, Default)]
pub struct ProcessorSet {
    processors: HashMap<Stage, Arc<dyn StageProcessor>>,
}

impl ProcessorSet {
    /// An empty set. Useful as a base for tests that install stubs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a processor, replacing any existing one for its stage.
    pub fn insert(&mut self, processor: Arc<dyn StageProcessor>) {
        self.processors.insert(processor.stage(), processor);
    }

    fn get(&self, stage: Stage) -> Option<&Arc<dyn StageProcessor>> {
        self.processors.get(&stage)
    }
}

/// Clears the active-run reservation when a drive ends, normally or not.
struct RunGuard {
    active: Arc<Mutex<HashSet<Uuid>>>,
    run_id: Uuid,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        active.remove(&self.run_id);
    }
}

/// Drives runs through the pipeline. Cheap to clone; clones share the
/// registry, artifact store and active-run set.
#[derive(Clone)]
pub struct StageExecutor {
    registry: Arc<RunRegistry>,
    artifacts: ArtifactStore,
    processors: ProcessorSet,
    active: Arc<Mutex<HashSet<Uuid>>>,
}

impl StageExecutor {
    pub fn new(registry: Arc<RunRegistry>, artifacts: ArtifactStore, processors: ProcessorSet) -> Self {
        Self {
            registry,
            artifacts,
            processors,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Registers a new pending run for a document.
    ///
    /// # Errors
    ///
    /// Returns `ExecutorError::Registry` if persisting fails.
    pub async fn create(
        &self,
        document: DocumentSource,
        config: RunConfig,
    ) -> Result<Uuid, ExecutorError> {
        let run = crate::registry::run::PipelineRun::new(document, config);
        Ok(self.registry.create(run).await?)
    }

    /// Executes a pending run from the first stage until the pause point,
    /// a failure, or completion.
    ///
    /// # Errors
    ///
    /// Returns `ExecutorError::ConcurrencyConflict` if the run is already
    /// being driven, `ExecutorError::Deleted` for soft-deleted runs.
    /// Stage failures do not surface here; they are recorded on the run.
    pub async fn start(&self, run_id: Uuid) -> Result<(), ExecutorError> {
        let guard = self.reserve(run_id)?;
        self.check_live(run_id).await?;
        self.drive(run_id, Stage::first(), guard).await
    }

    /// Resumes a paused (or finished) run from a stage, re-executing that
    /// stage and everything after it. A `target_stages` hint supplied
    /// here replaces the run's stored hint before the drive.
    ///
    /// # Errors
    ///
    /// Same surface as [`StageExecutor::start`].
    pub async fn resume_from_stage(
        &self,
        run_id: Uuid,
        target: Option<Stage>,
        target_stages: Option<Vec<Stage>>,
    ) -> Result<(), ExecutorError> {
        let guard = self.reserve(run_id)?;
        self.check_live(run_id).await?;
        let from = target.unwrap_or_else(Stage::first_after_pause);
        self.arm_resume(run_id, from, target_stages).await?;
        self.drive(run_id, from, guard).await
    }

    /// Creates a new run seeded from a source run's payload and drives it
    /// from the first post-pause stage (or the earliest requested target).
    ///
    /// Returns the new run's id immediately; execution continues in the
    /// background.
    ///
    /// # Errors
    ///
    /// Returns `ExecutorError::ConcurrencyConflict` if the source run is
    /// currently being driven (its payload would be a torn mid-stage
    /// snapshot), `ExecutorError::Registry` if the source run does not
    /// exist or the new run cannot be persisted.
    pub async fn fork(
        &self,
        source_id: Uuid,
        target_stages: Option<Vec<Stage>>,
    ) -> Result<Uuid, ExecutorError> {
        // Hold the source reservation while copying so a concurrent
        // resume cannot start mutating the payload mid-copy.
        let _source_guard = self.reserve(source_id)?;
        let source = self.registry.get(source_id).await?;
        let mut run = crate::registry::run::PipelineRun::forked_from(&source);
        if let Some(targets) = target_stages {
            run.config.target_stages = Some(targets);
        }

        let from = run
            .config
            .target_stages
            .as_ref()
            .and_then(|targets| targets.iter().copied().min_by_key(|s| s.index()))
            .unwrap_or_else(Stage::first_after_pause);

        // Stages before the entry point are satisfied by the inherited
        // payload; mark them so the history reads as already done.
        for stage in &Stage::ORDER[..from.index()] {
            run.record_mut(*stage).status = StageStatus::Completed;
        }

        let new_id = self.registry.create(run).await?;
        info!(run_id = %new_id, source_run_id = %source_id, from = %from, "Forked pipeline run");
        self.resume_detached(new_id, Some(from), None).await?;
        Ok(new_id)
    }

    /// Creates a fresh run of the same document and configuration as the
    /// source and drives it like [`StageExecutor::fork`].
    ///
    /// # Errors
    ///
    /// Same surface as [`StageExecutor::fork`].
    pub async fn rerun(
        &self,
        source_id: Uuid,
        target_stages: Option<Vec<Stage>>,
    ) -> Result<Uuid, ExecutorError> {
        self.fork(source_id, target_stages).await
    }

    /// Reserves the run synchronously, then executes it in the background.
    ///
    /// Conflicts and deleted runs are rejected before this returns, so
    /// callers can answer immediately while stages run detached.
    ///
    /// # Errors
    ///
    /// Same surface as [`StageExecutor::start`].
    pub async fn start_detached(&self, run_id: Uuid) -> Result<(), ExecutorError> {
        let guard = self.reserve(run_id)?;
        self.check_live(run_id).await?;
        let executor = self.clone();
        tokio::spawn(async move {
            if let Err(e) = executor.drive(run_id, Stage::first(), guard).await {
                error!(run_id = %run_id, error = %e, "Background start failed");
            }
        });
        Ok(())
    }

    /// Reserves and re-arms the run synchronously, then resumes it in the
    /// background.
    ///
    /// # Errors
    ///
    /// Same surface as [`StageExecutor::start`].
    pub async fn resume_detached(
        &self,
        run_id: Uuid,
        target: Option<Stage>,
        target_stages: Option<Vec<Stage>>,
    ) -> Result<(), ExecutorError> {
        let guard = self.reserve(run_id)?;
        self.check_live(run_id).await?;
        let from = target.unwrap_or_else(Stage::first_after_pause);
        self.arm_resume(run_id, from, target_stages).await?;

        let executor = self.clone();
        tokio::spawn(async move {
            if let Err(e) = executor.drive(run_id, from, guard).await {
                error!(run_id = %run_id, error = %e, "Background resume failed");
            }
        });
        Ok(())
    }

    /// Records the resume target, replaces the stage hint when one is
    /// supplied, and re-arms the records from the entry stage onward.
    async fn arm_resume(
        &self,
        run_id: Uuid,
        from: Stage,
        target_stages: Option<Vec<Stage>>,
    ) -> Result<(), ExecutorError> {
        self.registry
            .update(run_id, |run| {
                run.resume_target = Some(from);
                if let Some(targets) = target_stages {
                    run.config.target_stages = Some(targets);
                }
                for stage in &Stage::ORDER[from.index()..] {
                    let record = run.record_mut(*stage);
                    record.status = StageStatus::Pending;
                    record.error = None;
                }
                Ok(())
            })
            .await?;
        info!(run_id = %run_id, from = %from, "Resuming pipeline run");
        Ok(())
    }

    /// Reserves the run for a single drive.
    fn reserve(&self, run_id: Uuid) -> Result<RunGuard, ExecutorError> {
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !active.insert(run_id) {
            return Err(ExecutorError::ConcurrencyConflict(run_id));
        }
        Ok(RunGuard {
            active: Arc::clone(&self.active),
            run_id,
        })
    }

    async fn check_live(&self, run_id: Uuid) -> Result<(), ExecutorError> {
        let run = self.registry.get(run_id).await?;
        if run.deleted {
            return Err(ExecutorError::Deleted(run_id));
        }
        Ok(())
    }

    /// Walks the canonical order from `from`, executing each stage and
    /// persisting its outcome. Consumes the reservation guard so it is
    /// held for the whole drive.
    async fn drive(&self, run_id: Uuid, from: Stage, _guard: RunGuard) -> Result<(), ExecutorError> {
        for stage in Stage::ORDER[from.index()..].iter().copied() {
            let snapshot = self.registry.get(run_id).await?;

            // A target-stage hint narrows execution: stages outside the
            // hint are skipped when their contribution already exists,
            // otherwise left pending for a later resume.
            if let Some(targets) = &snapshot.config.target_stages {
                if !targets.contains(&stage) {
                    if snapshot.structured_data.satisfies(stage) {
                        self.mark_skipped(run_id, stage).await?;
                    }
                    continue;
                }
            }

            if snapshot.config.skip_if_exists && snapshot.structured_data.satisfies(stage) {
                info!(run_id = %run_id, stage = %stage, "Skipping stage, contribution exists");
                self.mark_skipped(run_id, stage).await?;
                continue;
            }

            let processor = self
                .processors
                .get(stage)
                .ok_or(ExecutorError::MissingProcessor(stage))?
                .clone();

            self.registry
                .update(run_id, |run| {
                    run.status = RunStatus::Running;
                    run.current_stage = stage;
                    let record = run.record_mut(stage);
                    record.status = StageStatus::Running;
                    record.error = None;
                    Ok(())
                })
                .await?;

            let ctx = StageContext {
                run_id,
                config: snapshot.config.clone(),
                document: snapshot.document.clone(),
                data: snapshot.structured_data.clone(),
                artifacts: self.artifacts.clone(),
            };

            info!(run_id = %run_id, stage = %stage, "Executing stage");
            let started = Instant::now();
            let outcome = processor.process(&ctx).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(contribution) => {
                    self.registry
                        .update(run_id, |run| {
                            run.structured_data.merge(contribution);
                            let record = run.record_mut(stage);
                            record.status = StageStatus::Completed;
                            record.duration_ms = duration_ms;
                            run.processing_stats.stages_completed += 1;
                            run.processing_stats.total_duration_ms += duration_ms;
                            if let Some(questions) = &run.structured_data.questions {
                                run.processing_stats.questions_discovered = questions.len();
                            }
                            if let Some(sub) = &run.structured_data.substitution {
                                run.processing_stats.mappings_applied = sub.total_mappings;
                            }
                            Ok(())
                        })
                        .await?;
                    info!(run_id = %run_id, stage = %stage, duration_ms, "Stage completed");
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(run_id = %run_id, stage = %stage, error = %message, "Stage failed");
                    self.registry
                        .update(run_id, |run| {
                            run.status = RunStatus::Failed;
                            let record = run.record_mut(stage);
                            record.status = StageStatus::Failed;
                            record.duration_ms = duration_ms;
                            record.error = Some(message.clone());
                            Ok(())
                        })
                        .await?;
                    return Ok(());
                }
            }

            if stage.is_pause_point() {
                self.registry
                    .update(run_id, |run| {
                        run.status = RunStatus::PausedForMapping;
                        Ok(())
                    })
                    .await?;
                info!(run_id = %run_id, stage = %stage, "Run paused for mapping edits");
                return Ok(());
            }
        }

        self.registry
            .update(run_id, |run| {
                run.status = RunStatus::Completed;
                Ok(())
            })
            .await?;
        info!(run_id = %run_id, "Run completed");
        Ok(())
    }

    async fn mark_skipped(&self, run_id: Uuid, stage: Stage) -> Result<(), ExecutorError> {
        self.registry
            .update(run_id, |run| {
                let record = run.record_mut(stage);
                record.status = StageStatus::Completed;
                record.duration_ms = 0;
                record.error = None;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
