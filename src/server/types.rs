//! Request and response bodies for the HTTP API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mapping::SubstringMapping;
use crate::pipeline::config::RunConfig;
use crate::pipeline::stage::Stage;
use crate::registry::run::{
    DocumentSource, ProcessingStats, RunStatus, StageRecord, StructuredData,
};

/// Body of `POST /pipeline/start`.
#[derive(Debug, Clone, Deserialize)]
pub struct StartRequest {
    /// The assessment document to run against.
    pub document: DocumentSource,
    /// Per-run configuration; defaults apply when omitted.
    #[serde(default)]
    pub config: RunConfig,
}

/// Response of `POST /pipeline/start`.
#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub run_id: Uuid,
    pub status: RunStatus,
}

/// Body of `POST /pipeline/{run_id}/resume`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResumeRequest {
    /// Stage to re-enter at; the first post-pause stage when omitted.
    #[serde(default)]
    pub target_stage: Option<Stage>,
    /// Replacement target-stage hint for the rest of the run.
    #[serde(default)]
    pub target_stages: Option<Vec<Stage>>,
}

/// Body of `POST /pipeline/{run_id}/fork`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ForkRequest {
    /// Replacement target-stage hint for the forked run.
    #[serde(default)]
    pub target_stages: Option<Vec<Stage>>,
}

/// Response of fork and rerun endpoints.
#[derive(Debug, Serialize)]
pub struct ForkResponse {
    pub run_id: Uuid,
    pub source_run_id: Uuid,
    pub status: RunStatus,
}

/// Status projection returned by `GET /pipeline/{run_id}/status`.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub id: Uuid,
    pub status: RunStatus,
    pub current_stage: Stage,
    pub stages: Vec<StageRecord>,
    pub structured_data: StructuredData,
    pub processing_stats: ProcessingStats,
    pub updated_at: DateTime<Utc>,
}

/// Body of `PUT /pipeline/{run_id}/questions/{question_id}/manipulation`.
#[derive(Debug, Clone, Deserialize)]
pub struct ManipulationRequest {
    /// Name of the enhancement method that produced the mappings.
    #[serde(default)]
    pub method: Option<String>,
    /// Replacement mapping set; validated as a unit before applying.
    pub substring_mappings: Vec<SubstringMapping>,
}

/// Body of `POST /pipeline/{run_id}/questions/{question_id}/validate`.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidateRequest {
    pub substring_mappings: Vec<SubstringMapping>,
}

/// Response of the validate endpoint. Invalid sets answer 200 with
/// `valid: false`; validation is a query, not a mutation.
#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub valid: bool,
    /// Reconstructed text when the set is valid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    /// Grader effectiveness of the previewed text when the set is valid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effectiveness: Option<f64>,
    /// Human-readable reason when it is not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response of `DELETE /pipeline/{run_id}`.
#[derive(Debug, Serialize)]
pub struct SoftDeleteResponse {
    pub run_id: Uuid,
    pub deleted: bool,
}

/// Response of `GET /pipeline/{run_id}/files`.
#[derive(Debug, Serialize)]
pub struct FileListResponse {
    pub run_id: Uuid,
    pub files: Vec<String>,
}

/// Response of `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Error body shared by all endpoints.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    /// Machine-readable overlap detail, present only for mapping
    /// conflicts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict: Option<OverlapDetail>,
}

/// The two half-open ranges of a rejected overlapping mapping.
#[derive(Debug, Serialize)]
pub struct OverlapDetail {
    pub first: (usize, usize),
    pub second: (usize, usize),
}
