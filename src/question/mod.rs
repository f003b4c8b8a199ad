//! Question manipulation records and their validated mutation operations.
//!
//! A [`QuestionManipulation`] belongs to exactly one pipeline run. Its
//! `original_text` is immutable once discovered; the mapping set is only
//! ever mutated through the validated operations here, so the non-overlap
//! invariant holds for every persisted state.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mapping::{self, MappingError, SubstringMapping};

/// Classification of a discovered question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    MultipleChoice,
    TrueFalse,
    ShortAnswer,
    Essay,
    Numeric,
}

impl std::fmt::Display for QuestionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuestionType::MultipleChoice => write!(f, "multiple_choice"),
            QuestionType::TrueFalse => write!(f, "true_false"),
            QuestionType::ShortAnswer => write!(f, "short_answer"),
            QuestionType::Essay => write!(f, "essay"),
            QuestionType::Numeric => write!(f, "numeric"),
        }
    }
}

/// A question discovered in the assessment document, together with the
/// manipulation applied to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionManipulation {
    /// Stable identifier, assigned at discovery.
    pub id: Uuid,
    /// 1-based number as printed in the document.
    pub question_number: u32,
    /// Detected question type.
    pub question_type: QuestionType,
    /// The question text as discovered; never mutated afterwards.
    pub original_text: String,
    /// Answer options for multiple-choice questions.
    pub options: Vec<String>,
    /// Expected answer, when an answer key was supplied.
    pub gold_answer: Option<String>,
    /// Name of the enhancement method that produced the mappings.
    pub manipulation_method: Option<String>,
    /// Validated, non-overlapping replacement set.
    pub substring_mappings: Vec<SubstringMapping>,
}

impl QuestionManipulation {
    /// Creates a freshly discovered question with no manipulation.
    pub fn new(
        question_number: u32,
        question_type: QuestionType,
        original_text: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            question_number,
            question_type,
            original_text: original_text.into(),
            options: Vec::new(),
            gold_answer: None,
            manipulation_method: None,
            substring_mappings: Vec::new(),
        }
    }

    /// Sets the answer options.
    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    /// Sets the gold answer.
    pub fn with_gold_answer(mut self, answer: impl Into<String>) -> Self {
        self.gold_answer = Some(answer.into());
        self
    }

    /// Adds a single mapping after validating it against the original text
    /// and the existing set.
    ///
    /// # Errors
    ///
    /// Returns the validation error untouched; the mapping set is not
    /// modified on failure.
    pub fn add_mapping(&mut self, candidate: SubstringMapping) -> Result<(), MappingError> {
        mapping::validate_for_text(&self.original_text, &candidate)?;
        mapping::validate(&self.substring_mappings, &candidate)?;

        self.substring_mappings.push(candidate);
        self.substring_mappings
            .sort_by_key(|m| (m.start_pos, m.end_pos));
        Ok(())
    }

    /// Replaces the whole mapping set after validating it as a unit.
    ///
    /// This is the write path for both the interactive editor and the
    /// substitution stage; last writer wins at question granularity.
    ///
    /// # Errors
    ///
    /// Rejects before any mutation; the previous set stays in place.
    pub fn set_manipulation(
        &mut self,
        method: Option<String>,
        mut mappings: Vec<SubstringMapping>,
    ) -> Result<(), MappingError> {
        mapping::validate_set(&mappings)?;
        for m in &mappings {
            mapping::validate_for_text(&self.original_text, m)?;
        }

        mappings.sort_by_key(|m| (m.start_pos, m.end_pos));
        self.manipulation_method = method;
        self.substring_mappings = mappings;
        Ok(())
    }

    /// Removes all mappings and the method tag.
    pub fn clear_manipulation(&mut self) {
        self.manipulation_method = None;
        self.substring_mappings.clear();
    }

    /// Reconstructs the attacked text from the current mapping set.
    ///
    /// With no mappings this returns the original text unchanged.
    pub fn preview(&self) -> Result<String, MappingError> {
        mapping::reconstruct(&self.original_text, &self.substring_mappings)
    }

    /// True if any mapping has been applied.
    pub fn is_manipulated(&self) -> bool {
        !self.substring_mappings.is_empty()
    }
}
