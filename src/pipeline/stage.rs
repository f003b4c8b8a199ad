//! Canonical pipeline stages.
//!
//! Stage identity is a closed enumeration with a fixed order, so "resume
//! to an invalid stage" is a parse error at the API boundary rather than
//! a runtime string-matching problem inside the executor.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a stage name cannot be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown stage '{0}'")]
pub struct StageParseError(pub String);

/// A named, ordered step of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Pull text out of the uploaded assessment document.
    DocumentExtraction,
    /// Discover questions, options and gold answers. Pause point.
    ContentDiscovery,
    /// Apply validated substring mappings to each question.
    SmartSubstitution,
    /// Render the attacked document into the run's artifact root.
    DocumentRendering,
    /// Score the attack against the classroom collaborator.
    ClassroomEvaluation,
    /// Produce the detection/evaluation report.
    ReportGeneration,
}

impl Stage {
    /// The canonical stage order. Runs never skip or reorder stages
    /// except via explicit resume-from-stage requests.
    pub const ORDER: [Stage; 6] = [
        Stage::DocumentExtraction,
        Stage::ContentDiscovery,
        Stage::SmartSubstitution,
        Stage::DocumentRendering,
        Stage::ClassroomEvaluation,
        Stage::ReportGeneration,
    ];

    /// Position of this stage in the canonical order.
    pub fn index(self) -> usize {
        Self::ORDER
            .iter()
            .position(|s| *s == self)
            .unwrap_or_default()
    }

    /// True for the stage after which the executor stops automatic
    /// advancement pending external mapping edits.
    pub fn is_pause_point(self) -> bool {
        self == Stage::ContentDiscovery
    }

    /// The first stage of the canonical order.
    pub fn first() -> Stage {
        Self::ORDER[0]
    }

    /// The first stage after the pause point; default entry for fork and
    /// rerun when no target stages are requested.
    pub fn first_after_pause() -> Stage {
        Stage::SmartSubstitution
    }

    /// Wire name of the stage.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::DocumentExtraction => "document_extraction",
            Stage::ContentDiscovery => "content_discovery",
            Stage::SmartSubstitution => "smart_substitution",
            Stage::DocumentRendering => "document_rendering",
            Stage::ClassroomEvaluation => "classroom_evaluation",
            Stage::ReportGeneration => "report_generation",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = StageParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ORDER
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| StageParseError(s.to_string()))
    }
}
