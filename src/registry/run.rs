//! Pipeline run records and their stage-mutated structured data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::config::RunConfig;
use crate::pipeline::stage::Stage;
use crate::question::QuestionManipulation;

/// Run-level status. The derived ordering follows the declaration order
/// and is used for status-sorted listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created but no stage has started yet.
    Pending,
    /// A drive is advancing through the stage order.
    Running,
    /// Discovery finished; waiting for mapping edits and an explicit resume.
    PausedForMapping,
    /// All stages finished.
    Completed,
    /// A stage failed; later stages never ran.
    Failed,
}

impl RunStatus {
    /// True once the run can no longer change without an explicit
    /// resume/rerun action.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::PausedForMapping => write!(f, "paused_for_mapping"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Per-stage status within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One entry of a run's fixed-order stage history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// The canonical stage this record tracks.
    pub name: Stage,
    /// Current status of the stage.
    pub status: StageStatus,
    /// Wall-clock duration of the last execution, in milliseconds.
    pub duration_ms: u64,
    /// Error message from the last failed execution.
    pub error: Option<String>,
}

impl StageRecord {
    fn pending(name: Stage) -> Self {
        Self {
            name,
            status: StageStatus::Pending,
            duration_ms: 0,
            error: None,
        }
    }
}

/// The document a run was started from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DocumentSource {
    /// Already-extracted text submitted inline.
    Inline {
        /// Display name of the uploaded document.
        name: String,
        /// Question paper text.
        text: String,
        /// Optional answer key text ("1. B" style lines).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        answer_key: Option<String>,
    },
    /// A file readable by the server process.
    File {
        /// Path to the question paper.
        path: std::path::PathBuf,
        /// Optional path to an answer key file.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        answer_key_path: Option<std::path::PathBuf>,
    },
}

impl DocumentSource {
    /// Display name for listings and logs.
    pub fn name(&self) -> String {
        match self {
            DocumentSource::Inline { name, .. } => name.clone(),
            DocumentSource::File { path, .. } => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
        }
    }
}

/// Output of the extraction stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionData {
    /// Extracted question-paper text.
    pub text: String,
    /// Extracted answer-key text, if one was supplied.
    pub answer_key: Option<String>,
    /// Length of the extracted text in codepoints.
    pub char_count: usize,
    /// Name of the source document.
    pub source_name: String,
}

/// One question's attacked rendition produced by the substitution stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackedQuestion {
    /// Question this rendition belongs to.
    pub question_id: Uuid,
    /// Printed question number.
    pub question_number: u32,
    /// Reconstructed text with all mappings applied.
    pub attacked_text: String,
    /// Replacement spans in attacked-text coordinates, for highlighting.
    pub final_spans: Vec<(usize, usize)>,
    /// Net codepoint length change versus the original text.
    pub length_delta: i64,
}

/// Output of the substitution stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubstitutionData {
    /// Attacked renditions, one per manipulated question.
    pub attacked: Vec<AttackedQuestion>,
    /// Total mappings applied across the run.
    pub total_mappings: usize,
}

/// Output of the rendering stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderingData {
    /// Run-relative artifact paths written by the renderer.
    pub artifacts: Vec<String>,
}

/// Per-question score from the classroom collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionScore {
    pub question_id: Uuid,
    pub question_number: u32,
    /// How strongly the manipulation shifts automated grading, 0.0..=1.0.
    pub effectiveness: f64,
}

/// Scoring summary attached to a run by the classroom collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassroomEvaluation {
    /// Questions that carried at least one mapping and were scored.
    pub evaluated_questions: usize,
    /// Mean effectiveness over the evaluated questions.
    pub mean_effectiveness: f64,
    /// Individual scores.
    pub scores: Vec<QuestionScore>,
}

/// Output of the report stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportData {
    pub total_questions: usize,
    pub manipulated_questions: usize,
    pub total_mappings: usize,
    pub mean_effectiveness: Option<f64>,
    /// Run-relative path of the written report artifact.
    pub artifact: String,
}

/// A single stage's contribution to the run's structured data.
///
/// Tagged by stage so merges are field-scoped: a contribution can only
/// ever replace its own slot, never another stage's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageContribution {
    DocumentExtraction(ExtractionData),
    ContentDiscovery { questions: Vec<QuestionManipulation> },
    SmartSubstitution(SubstitutionData),
    DocumentRendering(RenderingData),
    ClassroomEvaluation(ClassroomEvaluation),
    ReportGeneration(ReportData),
}

impl StageContribution {
    /// The stage that produces this contribution shape.
    pub fn stage(&self) -> Stage {
        match self {
            StageContribution::DocumentExtraction(_) => Stage::DocumentExtraction,
            StageContribution::ContentDiscovery { .. } => Stage::ContentDiscovery,
            StageContribution::SmartSubstitution(_) => Stage::SmartSubstitution,
            StageContribution::DocumentRendering(_) => Stage::DocumentRendering,
            StageContribution::ClassroomEvaluation(_) => Stage::ClassroomEvaluation,
            StageContribution::ReportGeneration(_) => Stage::ReportGeneration,
        }
    }
}

/// Accumulated, stage-mutated extraction/analysis payload of a run.
///
/// Created empty at run creation and merged-into (never wholesale
/// replaced) by each stage on completion.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StructuredData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction: Option<ExtractionData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub questions: Option<Vec<QuestionManipulation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substitution: Option<SubstitutionData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendering: Option<RenderingData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classroom: Option<ClassroomEvaluation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<ReportData>,
}

impl StructuredData {
    /// Merges a stage contribution into its own slot, leaving every other
    /// slot untouched.
    pub fn merge(&mut self, contribution: StageContribution) {
        match contribution {
            StageContribution::DocumentExtraction(data) => self.extraction = Some(data),
            StageContribution::ContentDiscovery { questions } => self.questions = Some(questions),
            StageContribution::SmartSubstitution(data) => self.substitution = Some(data),
            StageContribution::DocumentRendering(data) => self.rendering = Some(data),
            StageContribution::ClassroomEvaluation(data) => self.classroom = Some(data),
            StageContribution::ReportGeneration(data) => self.report = Some(data),
        }
    }

    /// True if the given stage's contribution is already present.
    pub fn satisfies(&self, stage: Stage) -> bool {
        match stage {
            Stage::DocumentExtraction => self.extraction.is_some(),
            Stage::ContentDiscovery => self.questions.is_some(),
            Stage::SmartSubstitution => self.substitution.is_some(),
            Stage::DocumentRendering => self.rendering.is_some(),
            Stage::ClassroomEvaluation => self.classroom.is_some(),
            Stage::ReportGeneration => self.report.is_some(),
        }
    }
}

/// Summary counters exposed in the status projection.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProcessingStats {
    /// Stages completed across the run's lifetime, including re-runs.
    pub stages_completed: u64,
    /// Total stage wall-clock time in milliseconds.
    pub total_duration_ms: u64,
    /// Questions found by the last discovery.
    pub questions_discovered: usize,
    /// Mappings applied by the last substitution.
    pub mappings_applied: usize,
}

/// One end-to-end execution of the pipeline against one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Opaque identifier, immutable.
    pub id: Uuid,
    /// Run-level status.
    pub status: RunStatus,
    /// The stage the executor is at or paused after.
    pub current_stage: Stage,
    /// Stage requested by the last resume call, if any.
    pub resume_target: Option<Stage>,
    /// Source run when this run was forked or rerun.
    pub parent_run_id: Option<Uuid>,
    /// Soft-delete flag; history and artifacts are preserved.
    pub deleted: bool,
    /// The document this run was started from.
    pub document: DocumentSource,
    /// Configuration submitted at start.
    pub config: RunConfig,
    /// Fixed-order stage history, one record per canonical stage.
    pub stages: Vec<StageRecord>,
    /// Stage-mutated payload.
    pub structured_data: StructuredData,
    /// Summary counters.
    pub processing_stats: ProcessingStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    /// Creates a pending run with an empty payload and a pending record
    /// for every canonical stage.
    pub fn new(document: DocumentSource, config: RunConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: RunStatus::Pending,
            current_stage: Stage::first(),
            resume_target: None,
            parent_run_id: None,
            deleted: false,
            document,
            config,
            stages: Stage::ORDER.iter().map(|s| StageRecord::pending(*s)).collect(),
            structured_data: StructuredData::default(),
            processing_stats: ProcessingStats::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates a new run seeded from a source run's payload, for fork and
    /// rerun.
    pub fn forked_from(source: &PipelineRun) -> Self {
        let mut run = Self::new(source.document.clone(), source.config.clone());
        run.parent_run_id = Some(source.id);
        run.structured_data = source.structured_data.clone();
        run.processing_stats = source.processing_stats.clone();
        run
    }

    /// Mutable access to the record of a canonical stage.
    pub fn record_mut(&mut self, stage: Stage) -> &mut StageRecord {
        &mut self.stages[stage.index()]
    }

    /// Read access to the record of a canonical stage.
    pub fn record(&self, stage: Stage) -> &StageRecord {
        &self.stages[stage.index()]
    }

    /// True once the run can no longer change without explicit action.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Finds a question by id in the discovery payload.
    pub fn question(&self, question_id: Uuid) -> Option<&QuestionManipulation> {
        self.structured_data
            .questions
            .as_ref()
            .and_then(|qs| qs.iter().find(|q| q.id == question_id))
    }

    /// Mutable variant of [`PipelineRun::question`].
    pub fn question_mut(&mut self, question_id: Uuid) -> Option<&mut QuestionManipulation> {
        self.structured_data
            .questions
            .as_mut()
            .and_then(|qs| qs.iter_mut().find(|q| q.id == question_id))
    }

    /// Bumps the modification timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
