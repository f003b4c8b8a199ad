//! Built-in stage processors.
//!
//! Each processor reads the run snapshot it is given and returns exactly
//! one contribution for its own stage. Anything a later stage needs must
//! travel through the structured data, never through processor state.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::question::{QuestionManipulation, QuestionType};
use crate::registry::run::{
    AttackedQuestion, ClassroomEvaluation, DocumentSource, ExtractionData, QuestionScore,
    RenderingData, ReportData, StageContribution, SubstitutionData,
};

use super::executor::{ProcessorSet, StageContext, StageError, StageProcessor};
use super::stage::Stage;

/// Scores how strongly a manipulated question shifts automated grading.
#[async_trait]
pub trait ScoringService: Send + Sync {
    /// Returns an effectiveness score in `0.0..=1.0`.
    async fn score(
        &self,
        question: &QuestionManipulation,
        attacked_text: &str,
    ) -> Result<f64, StageError>;
}

/// Deterministic scorer used when no external grader is configured.
///
/// Effectiveness grows with the number of mappings and the share of the
/// question text they rewrite, capped at 1.0.
#[derive(Debug, Default)]
pub struct HeuristicScoring;

#[async_trait]
impl ScoringService for HeuristicScoring {
    async fn score(
        &self,
        question: &QuestionManipulation,
        _attacked_text: &str,
    ) -> Result<f64, StageError> {
        let original_len = question.original_text.chars().count().max(1);
        let rewritten: usize = question
            .substring_mappings
            .iter()
            .map(|m| m.span_len())
            .sum();
        let coverage = rewritten as f64 / original_len as f64;
        let per_mapping = 0.1 * question.substring_mappings.len() as f64;
        Ok((0.2 + per_mapping + coverage).min(1.0))
    }
}

/// Builds the default processor set, wired to the given scorer.
pub fn builtin(scoring: Arc<dyn ScoringService>) -> ProcessorSet {
    let mut set = ProcessorSet::new();
    set.insert(Arc::new(ExtractionProcessor));
    set.insert(Arc::new(DiscoveryProcessor));
    set.insert(Arc::new(SubstitutionProcessor));
    set.insert(Arc::new(RenderingProcessor));
    set.insert(Arc::new(ClassroomProcessor { scoring }));
    set.insert(Arc::new(ReportProcessor));
    set
}

/// Pulls text out of the submitted document.
pub struct ExtractionProcessor;

#[async_trait]
impl StageProcessor for ExtractionProcessor {
    fn stage(&self) -> Stage {
        Stage::DocumentExtraction
    }

    async fn process(&self, ctx: &StageContext) -> Result<StageContribution, StageError> {
        let (source_name, text, answer_key) = match &ctx.document {
            DocumentSource::Inline {
                name,
                text,
                answer_key,
            } => (name.clone(), text.clone(), answer_key.clone()),
            DocumentSource::File {
                path,
                answer_key_path,
            } => {
                let text = tokio::fs::read_to_string(path).await?;
                let key = match answer_key_path {
                    Some(key_path) => Some(tokio::fs::read_to_string(key_path).await?),
                    None => None,
                };
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                (name, text, key)
            }
        };

        if text.trim().is_empty() {
            return Err(StageError::Processor(format!(
                "Document '{source_name}' contains no text"
            )));
        }

        let char_count = text.chars().count();
        info!(run_id = %ctx.run_id, source = %source_name, char_count, "Extracted document text");
        Ok(StageContribution::DocumentExtraction(ExtractionData {
            text,
            answer_key,
            char_count,
            source_name,
        }))
    }
}

/// Finds numbered questions, their options and gold answers in the
/// extracted text.
pub struct DiscoveryProcessor;

impl DiscoveryProcessor {
    fn classify(text: &str, options: &[String]) -> QuestionType {
        let lower = text.to_lowercase();
        if lower.contains("true or false") || lower.contains("true/false") {
            QuestionType::TrueFalse
        } else if !options.is_empty() {
            QuestionType::MultipleChoice
        } else if ["explain", "discuss", "describe why"]
            .iter()
            .any(|cue| lower.contains(cue))
        {
            QuestionType::Essay
        } else if ["how many", "calculate", "compute"]
            .iter()
            .any(|cue| lower.contains(cue))
        {
            QuestionType::Numeric
        } else {
            QuestionType::ShortAnswer
        }
    }

    fn parse_answer_key(key: &str) -> Result<Vec<(u32, String)>, StageError> {
        let line_re = Regex::new(r"^\s*(\d{1,3})[.)]\s*(.+?)\s*$")?;
        let mut answers = Vec::new();
        for line in key.lines() {
            if let Some(caps) = line_re.captures(line) {
                if let Ok(number) = caps[1].parse::<u32>() {
                    answers.push((number, caps[2].to_string()));
                }
            }
        }
        Ok(answers)
    }
}

#[async_trait]
impl StageProcessor for DiscoveryProcessor {
    fn stage(&self) -> Stage {
        Stage::ContentDiscovery
    }

    async fn process(&self, ctx: &StageContext) -> Result<StageContribution, StageError> {
        let extraction = ctx.data.extraction.as_ref().ok_or(StageError::MissingInput {
            stage: Stage::ContentDiscovery,
            needs: "extracted document text",
        })?;

        let question_re = Regex::new(r"^\s*(\d{1,3})[.)]\s+(.*\S)\s*$")?;
        let option_re = Regex::new(r"^\s*([A-Da-d])[.)]\s+(.*\S)\s*$")?;

        let mut questions: Vec<QuestionManipulation> = Vec::new();
        let mut current: Option<(u32, String, Vec<String>)> = None;

        let mut flush = |pending: Option<(u32, String, Vec<String>)>,
                         out: &mut Vec<QuestionManipulation>| {
            if let Some((number, text, options)) = pending {
                let question_type = Self::classify(&text, &options);
                out.push(
                    QuestionManipulation::new(number, question_type, text).with_options(options),
                );
            }
        };

        for line in extraction.text.lines() {
            if let Some(caps) = question_re.captures(line) {
                if let Ok(number) = caps[1].parse::<u32>() {
                    flush(current.take(), &mut questions);
                    current = Some((number, caps[2].to_string(), Vec::new()));
                    continue;
                }
            }
            if let Some(caps) = option_re.captures(line) {
                if let Some((_, _, options)) = current.as_mut() {
                    options.push(format!("{}. {}", caps[1].to_uppercase(), &caps[2]));
                    continue;
                }
            }
            // Continuation lines extend the current question's stem.
            if let Some((_, text, options)) = current.as_mut() {
                if options.is_empty() && !line.trim().is_empty() {
                    text.push(' ');
                    text.push_str(line.trim());
                }
            }
        }
        flush(current.take(), &mut questions);

        if questions.is_empty() {
            return Err(StageError::Processor(
                "No numbered questions found in document".to_string(),
            ));
        }

        if let Some(key) = &extraction.answer_key {
            for (number, answer) in Self::parse_answer_key(key)? {
                if let Some(q) = questions.iter_mut().find(|q| q.question_number == number) {
                    q.gold_answer = Some(answer);
                }
            }
        }

        info!(run_id = %ctx.run_id, count = questions.len(), "Discovered questions");
        Ok(StageContribution::ContentDiscovery { questions })
    }
}

/// Applies each question's mapping set, producing attacked renditions.
pub struct SubstitutionProcessor;

#[async_trait]
impl StageProcessor for SubstitutionProcessor {
    fn stage(&self) -> Stage {
        Stage::SmartSubstitution
    }

    async fn process(&self, ctx: &StageContext) -> Result<StageContribution, StageError> {
        let questions = ctx.data.questions.as_ref().ok_or(StageError::MissingInput {
            stage: Stage::SmartSubstitution,
            needs: "discovered questions",
        })?;

        let mut attacked = Vec::new();
        let mut total_mappings = 0;
        for question in questions {
            if !question.is_manipulated() {
                continue;
            }
            let attacked_text = question.preview()?;
            let final_spans = crate::mapping::final_spans(&question.substring_mappings);
            let length_delta: i64 = question
                .substring_mappings
                .iter()
                .map(|m| m.length_delta())
                .sum();
            total_mappings += question.substring_mappings.len();
            attacked.push(AttackedQuestion {
                question_id: question.id,
                question_number: question.question_number,
                attacked_text,
                final_spans,
                length_delta,
            });
        }

        info!(
            run_id = %ctx.run_id,
            questions = attacked.len(),
            total_mappings,
            "Applied substring substitutions"
        );
        Ok(StageContribution::SmartSubstitution(SubstitutionData {
            attacked,
            total_mappings,
        }))
    }
}

/// Writes the attacked document into the run's artifact root.
pub struct RenderingProcessor;

#[async_trait]
impl StageProcessor for RenderingProcessor {
    fn stage(&self) -> Stage {
        Stage::DocumentRendering
    }

    async fn process(&self, ctx: &StageContext) -> Result<StageContribution, StageError> {
        let extraction = ctx.data.extraction.as_ref().ok_or(StageError::MissingInput {
            stage: Stage::DocumentRendering,
            needs: "extracted document text",
        })?;
        let questions = ctx.data.questions.as_ref().ok_or(StageError::MissingInput {
            stage: Stage::DocumentRendering,
            needs: "discovered questions",
        })?;
        let substitution = ctx.data.substitution.as_ref().ok_or(StageError::MissingInput {
            stage: Stage::DocumentRendering,
            needs: "substitution output",
        })?;

        // Splice each attacked stem over its original occurrence; the
        // rest of the document renders unchanged.
        let mut rendered = extraction.text.clone();
        for attack in &substitution.attacked {
            if let Some(question) = questions.iter().find(|q| q.id == attack.question_id) {
                rendered = rendered.replacen(&question.original_text, &attack.attacked_text, 1);
            }
        }

        let path = "attacked/document.txt";
        ctx.artifacts
            .store(ctx.run_id, path, rendered.as_bytes())
            .await?;

        debug!(run_id = %ctx.run_id, path, "Rendered attacked document");
        Ok(StageContribution::DocumentRendering(RenderingData {
            artifacts: vec![path.to_string()],
        }))
    }
}

/// Scores the attacked questions against the configured grader.
pub struct ClassroomProcessor {
    pub scoring: Arc<dyn ScoringService>,
}

#[async_trait]
impl StageProcessor for ClassroomProcessor {
    fn stage(&self) -> Stage {
        Stage::ClassroomEvaluation
    }

    async fn process(&self, ctx: &StageContext) -> Result<StageContribution, StageError> {
        let questions = ctx.data.questions.as_ref().ok_or(StageError::MissingInput {
            stage: Stage::ClassroomEvaluation,
            needs: "discovered questions",
        })?;
        let substitution = ctx.data.substitution.as_ref().ok_or(StageError::MissingInput {
            stage: Stage::ClassroomEvaluation,
            needs: "substitution output",
        })?;

        let mut scores = Vec::new();
        for attack in &substitution.attacked {
            let Some(question) = questions.iter().find(|q| q.id == attack.question_id) else {
                continue;
            };
            let effectiveness = self.scoring.score(question, &attack.attacked_text).await?;
            scores.push(QuestionScore {
                question_id: question.id,
                question_number: question.question_number,
                effectiveness,
            });
        }

        let mean_effectiveness = if scores.is_empty() {
            0.0
        } else {
            scores.iter().map(|s| s.effectiveness).sum::<f64>() / scores.len() as f64
        };

        info!(
            run_id = %ctx.run_id,
            evaluated = scores.len(),
            mean_effectiveness,
            "Scored attacked questions"
        );
        Ok(StageContribution::ClassroomEvaluation(ClassroomEvaluation {
            evaluated_questions: scores.len(),
            mean_effectiveness,
            scores,
        }))
    }
}

/// Shape of the written report artifact.
#[derive(Debug, Serialize)]
struct ReportDocument<'a> {
    run_id: Uuid,
    source_name: &'a str,
    total_questions: usize,
    manipulated_questions: usize,
    total_mappings: usize,
    mean_effectiveness: Option<f64>,
    scores: &'a [QuestionScore],
}

/// Summarizes the run into a JSON report artifact.
pub struct ReportProcessor;

#[async_trait]
impl StageProcessor for ReportProcessor {
    fn stage(&self) -> Stage {
        Stage::ReportGeneration
    }

    async fn process(&self, ctx: &StageContext) -> Result<StageContribution, StageError> {
        let questions = ctx.data.questions.as_ref().ok_or(StageError::MissingInput {
            stage: Stage::ReportGeneration,
            needs: "discovered questions",
        })?;

        let total_mappings = ctx
            .data
            .substitution
            .as_ref()
            .map(|s| s.total_mappings)
            .unwrap_or(0);
        let manipulated = questions.iter().filter(|q| q.is_manipulated()).count();
        let mean_effectiveness = ctx
            .data
            .classroom
            .as_ref()
            .map(|c| c.mean_effectiveness);

        let source_name = ctx
            .data
            .extraction
            .as_ref()
            .map(|e| e.source_name.as_str())
            .unwrap_or("unknown");
        let empty = Vec::new();
        let scores = ctx
            .data
            .classroom
            .as_ref()
            .map(|c| c.scores.as_slice())
            .unwrap_or(&empty);

        let report = ReportDocument {
            run_id: ctx.run_id,
            source_name,
            total_questions: questions.len(),
            manipulated_questions: manipulated,
            total_mappings,
            mean_effectiveness,
            scores,
        };
        let artifact = "reports/report.json";
        let body = serde_json::to_vec_pretty(&report)?;
        ctx.artifacts.store(ctx.run_id, artifact, &body).await?;

        info!(run_id = %ctx.run_id, artifact, "Wrote evaluation report");
        Ok(StageContribution::ReportGeneration(ReportData {
            total_questions: questions.len(),
            manipulated_questions: manipulated,
            total_mappings,
            mean_effectiveness,
            artifact: artifact.to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::SubstringMapping;
    use crate::pipeline::config::RunConfig;
    use crate::registry::run::StructuredData;
    use crate::storage::ArtifactStore;

    const PAPER: &str = "\
Algebra Midterm

1. What is 2+2?
A. 3
B. 4
C. 5

2. True or false: the sum of two odd numbers is odd.

3. Explain why prime numbers are infinite.
";

    fn ctx_with(data: StructuredData, artifacts: ArtifactStore) -> StageContext {
        StageContext {
            run_id: Uuid::new_v4(),
            config: RunConfig::default(),
            document: DocumentSource::Inline {
                name: "midterm.txt".to_string(),
                text: PAPER.to_string(),
                answer_key: Some("1. B\n2. False\n".to_string()),
            },
            data,
            artifacts,
        }
    }

    fn extraction() -> ExtractionData {
        ExtractionData {
            text: PAPER.to_string(),
            answer_key: Some("1. B\n2. False\n".to_string()),
            char_count: PAPER.chars().count(),
            source_name: "midterm.txt".to_string(),
        }
    }

    #[tokio::test]
    async fn test_extraction_from_inline_document() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with(StructuredData::default(), ArtifactStore::new(dir.path()));

        let contribution = ExtractionProcessor.process(&ctx).await.unwrap();
        let StageContribution::DocumentExtraction(data) = contribution else {
            panic!("wrong contribution");
        };
        assert_eq!(data.source_name, "midterm.txt");
        assert_eq!(data.char_count, PAPER.chars().count());
        assert!(data.answer_key.is_some());
    }

    #[tokio::test]
    async fn test_discovery_finds_questions_options_and_answers() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = StructuredData::default();
        data.extraction = Some(extraction());
        let ctx = ctx_with(data, ArtifactStore::new(dir.path()));

        let contribution = DiscoveryProcessor.process(&ctx).await.unwrap();
        let StageContribution::ContentDiscovery { questions } = contribution else {
            panic!("wrong contribution");
        };
        assert_eq!(questions.len(), 3);

        assert_eq!(questions[0].question_number, 1);
        assert_eq!(questions[0].question_type, QuestionType::MultipleChoice);
        assert_eq!(questions[0].options.len(), 3);
        assert_eq!(questions[0].gold_answer.as_deref(), Some("B"));

        assert_eq!(questions[1].question_type, QuestionType::TrueFalse);
        assert_eq!(questions[1].gold_answer.as_deref(), Some("False"));

        assert_eq!(questions[2].question_type, QuestionType::Essay);
        assert!(questions[2].gold_answer.is_none());
    }

    #[tokio::test]
    async fn test_discovery_requires_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_with(StructuredData::default(), ArtifactStore::new(dir.path()));
        assert!(matches!(
            DiscoveryProcessor.process(&ctx).await,
            Err(StageError::MissingInput { .. })
        ));
    }

    #[tokio::test]
    async fn test_substitution_skips_untouched_questions() {
        let dir = tempfile::tempdir().unwrap();
        let mut q1 = QuestionManipulation::new(1, QuestionType::ShortAnswer, "What is 2+2?");
        // "2+2" starts at codepoint 8.
        q1.add_mapping(SubstringMapping::new("2+2", "3+3", 8, 11))
            .unwrap();
        let q2 = QuestionManipulation::new(2, QuestionType::ShortAnswer, "Untouched?");

        let mut data = StructuredData::default();
        data.extraction = Some(extraction());
        data.questions = Some(vec![q1, q2]);
        let ctx = ctx_with(data, ArtifactStore::new(dir.path()));

        let contribution = SubstitutionProcessor.process(&ctx).await.unwrap();
        let StageContribution::SmartSubstitution(sub) = contribution else {
            panic!("wrong contribution");
        };
        assert_eq!(sub.attacked.len(), 1);
        assert_eq!(sub.attacked[0].attacked_text, "What is 3+3?");
        assert_eq!(sub.attacked[0].final_spans, vec![(8, 11)]);
        assert_eq!(sub.attacked[0].length_delta, 0);
        assert_eq!(sub.total_mappings, 1);
    }

    #[tokio::test]
    async fn test_rendering_splices_attacked_text() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());

        let mut q = QuestionManipulation::new(1, QuestionType::ShortAnswer, "What is 2+2?");
        q.add_mapping(SubstringMapping::new("2+2", "3+3", 8, 11))
            .unwrap();
        let attacked_text = q.preview().unwrap();

        let mut data = StructuredData::default();
        data.extraction = Some(extraction());
        data.substitution = Some(SubstitutionData {
            attacked: vec![AttackedQuestion {
                question_id: q.id,
                question_number: 1,
                attacked_text,
                final_spans: vec![(8, 11)],
                length_delta: 0,
            }],
            total_mappings: 1,
        });
        data.questions = Some(vec![q]);
        let ctx = ctx_with(data, store.clone());

        let contribution = RenderingProcessor.process(&ctx).await.unwrap();
        let StageContribution::DocumentRendering(rendering) = contribution else {
            panic!("wrong contribution");
        };
        assert_eq!(rendering.artifacts, vec!["attacked/document.txt"]);

        let rendered = store.read(ctx.run_id, "attacked/document.txt").await.unwrap();
        let rendered = String::from_utf8(rendered).unwrap();
        assert!(rendered.contains("What is 3+3?"));
        assert!(!rendered.contains("What is 2+2?"));
        assert!(rendered.contains("True or false"));
    }

    #[tokio::test]
    async fn test_heuristic_scoring_bounds() {
        let mut q = QuestionManipulation::new(1, QuestionType::ShortAnswer, "What is 2+2?");
        q.add_mapping(SubstringMapping::new("2+2", "3+3", 8, 11))
            .unwrap();

        let score = HeuristicScoring.score(&q, "What is 3+3?").await.unwrap();
        assert!(score > 0.2 && score <= 1.0);
    }

    #[tokio::test]
    async fn test_report_writes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());

        let mut q = QuestionManipulation::new(1, QuestionType::ShortAnswer, "What is 2+2?");
        q.add_mapping(SubstringMapping::new("2+2", "3+3", 8, 11))
            .unwrap();

        let mut data = StructuredData::default();
        data.extraction = Some(extraction());
        data.questions = Some(vec![q]);
        data.substitution = Some(SubstitutionData {
            attacked: vec![],
            total_mappings: 1,
        });
        let ctx = ctx_with(data, store.clone());

        let contribution = ReportProcessor.process(&ctx).await.unwrap();
        let StageContribution::ReportGeneration(report) = contribution else {
            panic!("wrong contribution");
        };
        assert_eq!(report.total_questions, 1);
        assert_eq!(report.manipulated_questions, 1);
        assert_eq!(report.total_mappings, 1);

        let body = store.read(ctx.run_id, &report.artifact).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["total_questions"], 1);
    }
}
