//! HTTP request handlers.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::info;
use uuid::Uuid;

use crate::error::RegistryError;
use crate::mapping::MappingError;
use crate::pipeline::executor::{ExecutorError, StageError};
use crate::registry::run::{PipelineRun, RunStatus};
use crate::registry::{RunPage, RunQuery};
use crate::storage::StorageError;

use super::types::{
    ErrorBody, FileListResponse, ForkRequest, ForkResponse, HealthResponse, ManipulationRequest,
    OverlapDetail, ResumeRequest, SoftDeleteResponse, StartRequest, StartResponse, StatusResponse,
    ValidateRequest, ValidateResponse,
};
use super::ApiState;

/// Error surface of all handlers, mapped onto HTTP statuses.
#[derive(Debug)]
pub enum ApiError {
    Registry(RegistryError),
    Executor(ExecutorError),
    Storage(StorageError),
    /// The external grading collaborator failed.
    Scoring(StageError),
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        ApiError::Registry(e)
    }
}

impl From<ExecutorError> for ApiError {
    fn from(e: ExecutorError) -> Self {
        match e {
            ExecutorError::Registry(inner) => ApiError::Registry(inner),
            other => ApiError::Executor(other),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        ApiError::Storage(e)
    }
}

impl From<StageError> for ApiError {
    fn from(e: StageError) -> Self {
        ApiError::Scoring(e)
    }
}

fn mapping_status(e: &MappingError) -> (StatusCode, Option<OverlapDetail>) {
    match e {
        MappingError::Overlap { first, second } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Some(OverlapDetail {
                first: *first,
                second: *second,
            }),
        ),
        _ => (StatusCode::UNPROCESSABLE_ENTITY, None),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, conflict, message) = match &self {
            ApiError::Registry(RegistryError::RunNotFound(_))
            | ApiError::Registry(RegistryError::QuestionNotFound { .. }) => {
                (StatusCode::NOT_FOUND, None, self_message(&self))
            }
            ApiError::Registry(RegistryError::RunBusy(_)) => {
                (StatusCode::CONFLICT, None, self_message(&self))
            }
            ApiError::Registry(RegistryError::Mapping(e)) => {
                let (status, detail) = mapping_status(e);
                (status, detail, self_message(&self))
            }
            ApiError::Registry(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, None, self_message(&self))
            }
            ApiError::Executor(ExecutorError::ConcurrencyConflict(_)) => {
                (StatusCode::CONFLICT, None, self_message(&self))
            }
            ApiError::Executor(ExecutorError::Deleted(_)) => {
                (StatusCode::GONE, None, self_message(&self))
            }
            ApiError::Executor(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, None, self_message(&self))
            }
            ApiError::Storage(StorageError::InvalidPath(_)) => {
                (StatusCode::BAD_REQUEST, None, self_message(&self))
            }
            ApiError::Storage(StorageError::NotFound { .. }) => {
                (StatusCode::NOT_FOUND, None, self_message(&self))
            }
            ApiError::Storage(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, None, self_message(&self))
            }
            ApiError::Scoring(_) => (StatusCode::BAD_GATEWAY, None, self_message(&self)),
        };

        (
            status,
            Json(ErrorBody {
                error: message,
                conflict,
            }),
        )
            .into_response()
    }
}

fn self_message(e: &ApiError) -> String {
    match e {
        ApiError::Registry(e) => e.to_string(),
        ApiError::Executor(e) => e.to_string(),
        ApiError::Storage(e) => e.to_string(),
        ApiError::Scoring(e) => e.to_string(),
    }
}

pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Creates a run and starts executing it. Answers before the first stage
/// finishes; observers follow up through the status endpoint.
pub async fn start_run(
    State(state): State<ApiState>,
    Json(request): Json<StartRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = state
        .executor
        .create(request.document, request.config)
        .await?;
    state.executor.start_detached(run_id).await?;

    info!(run_id = %run_id, "Accepted pipeline start");
    Ok((
        StatusCode::ACCEPTED,
        Json(StartResponse {
            run_id,
            status: RunStatus::Pending,
        }),
    ))
}

pub async fn list_runs(
    State(state): State<ApiState>,
    Query(query): Query<RunQuery>,
) -> Json<RunPage> {
    Json(state.registry.list(&query).await)
}

/// Full run record, soft-deleted runs included.
pub async fn get_run(
    State(state): State<ApiState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<PipelineRun>, ApiError> {
    Ok(Json(state.registry.get(run_id).await?))
}

pub async fn get_status(
    State(state): State<ApiState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<StatusResponse>, ApiError> {
    let run = state.registry.get(run_id).await?;
    Ok(Json(StatusResponse {
        id: run.id,
        status: run.status,
        current_stage: run.current_stage,
        stages: run.stages,
        structured_data: run.structured_data,
        processing_stats: run.processing_stats,
        updated_at: run.updated_at,
    }))
}

/// Resumes a paused or finished run. A run already being executed
/// answers 409 without touching it.
pub async fn resume_run(
    State(state): State<ApiState>,
    Path(run_id): Path<Uuid>,
    Json(request): Json<ResumeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .executor
        .resume_detached(run_id, request.target_stage, request.target_stages)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn fork_run(
    State(state): State<ApiState>,
    Path(run_id): Path<Uuid>,
    Json(request): Json<ForkRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let new_id = state.executor.fork(run_id, request.target_stages).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ForkResponse {
            run_id: new_id,
            source_run_id: run_id,
            status: RunStatus::Pending,
        }),
    ))
}

pub async fn rerun_run(
    State(state): State<ApiState>,
    Path(run_id): Path<Uuid>,
    Json(request): Json<ForkRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let new_id = state.executor.rerun(run_id, request.target_stages).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ForkResponse {
            run_id: new_id,
            source_run_id: run_id,
            status: RunStatus::Pending,
        }),
    ))
}

/// Marks the run deleted, keeping its history and artifacts.
pub async fn soft_delete_run(
    State(state): State<ApiState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<SoftDeleteResponse>, ApiError> {
    state.registry.soft_delete(run_id).await?;
    Ok(Json(SoftDeleteResponse {
        run_id,
        deleted: true,
    }))
}

/// Removes the run record and its artifact root entirely.
pub async fn hard_delete_run(
    State(state): State<ApiState>,
    Path(run_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.delete(run_id).await?;
    state.artifacts.remove_run(run_id).await?;
    info!(run_id = %run_id, "Hard-deleted run and artifacts");
    Ok(StatusCode::NO_CONTENT)
}

/// Replaces a question's mapping set. Last writer wins at question
/// granularity; an invalid set leaves the stored one untouched.
///
/// The running-state check lives inside the update closure so a resume
/// cannot slip between the check and the write.
pub async fn put_manipulation(
    State(state): State<ApiState>,
    Path((run_id, question_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<ManipulationRequest>,
) -> Result<Json<PipelineRun>, ApiError> {
    let updated = state
        .registry
        .update(run_id, |run| {
            if run.status == RunStatus::Running {
                return Err(RegistryError::RunBusy(run_id));
            }
            let question = run
                .question_mut(question_id)
                .ok_or(RegistryError::QuestionNotFound { run_id, question_id })?;
            question.set_manipulation(request.method.clone(), request.substring_mappings.clone())?;
            Ok(run.clone())
        })
        .await?;

    info!(run_id = %run_id, question_id = %question_id, "Updated question manipulation");
    Ok(Json(updated))
}

pub async fn delete_manipulation(
    State(state): State<ApiState>,
    Path((run_id, question_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<PipelineRun>, ApiError> {
    let updated = state
        .registry
        .update(run_id, |run| {
            let question = run
                .question_mut(question_id)
                .ok_or(RegistryError::QuestionNotFound { run_id, question_id })?;
            question.clear_manipulation();
            Ok(run.clone())
        })
        .await?;
    Ok(Json(updated))
}

/// Validates a candidate mapping set without storing anything, then runs
/// the grading collaborator against the previewed text. Invalid sets are
/// a negative answer, not an error status; a collaborator failure is 502.
pub async fn validate_manipulation(
    State(state): State<ApiState>,
    Path((run_id, question_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<ValidateRequest>,
) -> Result<Json<ValidateResponse>, ApiError> {
    let run = state.registry.get(run_id).await?;
    let mut question = run
        .question(question_id)
        .cloned()
        .ok_or(RegistryError::QuestionNotFound { run_id, question_id })?;

    let response = match question.set_manipulation(None, request.substring_mappings) {
        Ok(()) => match question.preview() {
            Ok(preview) => {
                let effectiveness = state.scoring.score(&question, &preview).await?;
                ValidateResponse {
                    valid: true,
                    preview: Some(preview),
                    effectiveness: Some(effectiveness),
                    error: None,
                }
            }
            Err(e) => ValidateResponse {
                valid: false,
                preview: None,
                effectiveness: None,
                error: Some(e.to_string()),
            },
        },
        Err(e) => ValidateResponse {
            valid: false,
            preview: None,
            effectiveness: None,
            error: Some(e.to_string()),
        },
    };
    Ok(Json(response))
}

pub async fn list_files(
    State(state): State<ApiState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<FileListResponse>, ApiError> {
    // Listing a run that does not exist is a 404, not an empty page.
    state.registry.get(run_id).await?;
    let files = state.artifacts.list(run_id).await?;
    Ok(Json(FileListResponse { run_id, files }))
}

pub async fn get_file(
    State(state): State<ApiState>,
    Path((run_id, path)): Path<(Uuid, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let bytes = state.artifacts.read(run_id, &path).await?;
    let content_type = if path.ends_with(".json") {
        "application/json"
    } else {
        "text/plain; charset=utf-8"
    };
    Ok(([(header::CONTENT_TYPE, content_type)], bytes))
}
