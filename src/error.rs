//! Shared error types for the run registry and its callers.

use thiserror::Error;
use uuid::Uuid;

use crate::mapping::MappingError;

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The requested run does not exist.
    #[error("Run {0} not found")]
    RunNotFound(Uuid),

    /// The requested question does not exist on the run.
    #[error("Question {question_id} not found on run {run_id}")]
    QuestionNotFound { run_id: Uuid, question_id: Uuid },

    /// The run is executing and does not admit the mutation.
    #[error("Run {0} is executing; mapping edits require a paused or finished run")]
    RunBusy(Uuid),

    /// A mapping mutation failed validation.
    #[error("Mapping validation failed: {0}")]
    Mapping(#[from] MappingError),

    /// IO error while persisting or loading the registry file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error while persisting or loading the registry file.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
