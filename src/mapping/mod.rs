//! Substring mapping validation and document reconstruction.
//!
//! This module is the single gate through which all per-question text
//! replacements pass. It enforces the non-overlap invariant over the
//! original text's coordinate space and rebuilds previewed/attacked text
//! from an ordered replacement set whose lengths differ from the spans
//! they replace.
//!
//! All positions are codepoint offsets into the original text, never byte
//! offsets. Ranges are half-open: `[start_pos, end_pos)`. Adjacent ranges
//! (`a.end_pos == b.start_pos`) do not overlap. `end_pos == start_pos`
//! denotes a pure insertion.
//!
//! Everything here is pure and synchronous; no I/O.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by mapping validation and reconstruction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    /// Two mappings' ranges intersect over the original text.
    #[error("Mapping [{}, {}) overlaps existing mapping [{}, {})", second.0, second.1, first.0, first.1)]
    Overlap {
        /// Range of the mapping that was accepted first.
        first: (usize, usize),
        /// Range of the rejected candidate.
        second: (usize, usize),
    },

    /// `end_pos` is smaller than `start_pos`.
    #[error("Invalid range: end_pos {end} < start_pos {start}")]
    InvertedRange { start: usize, end: usize },

    /// The range extends past the end of the original text.
    #[error("Range end {end} exceeds text length {len} (codepoints)")]
    OutOfBounds { end: usize, len: usize },

    /// The mapping's `original` field does not match the span it claims.
    #[error("Mapping text '{expected}' does not match span content '{found}'")]
    SpanMismatch { expected: String, found: String },
}

/// Where in a question the mapping applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MappingContext {
    /// The question stem itself.
    #[default]
    QuestionStem,
    /// One of the answer options.
    AnswerOption,
    /// Instructions surrounding the question.
    Instruction,
    /// The answer key entry for the question.
    AnswerKey,
}

/// A single original→replacement substitution scoped to a span of a
/// question's original text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubstringMapping {
    /// Text being replaced; must match `original_text[start_pos..end_pos]`.
    pub original: String,
    /// Replacement text; may differ in length from the span.
    pub replacement: String,
    /// Codepoint offset of the span start (inclusive).
    pub start_pos: usize,
    /// Codepoint offset of the span end (exclusive).
    pub end_pos: usize,
    /// Which part of the question the mapping targets.
    #[serde(default)]
    pub context: MappingContext,
    /// Optional score assigned by the scoring collaborator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effectiveness_score: Option<f64>,
}

impl SubstringMapping {
    /// Creates a mapping over `[start_pos, end_pos)` of the original text.
    pub fn new(
        original: impl Into<String>,
        replacement: impl Into<String>,
        start_pos: usize,
        end_pos: usize,
    ) -> Self {
        Self {
            original: original.into(),
            replacement: replacement.into(),
            start_pos,
            end_pos,
            context: MappingContext::default(),
            effectiveness_score: None,
        }
    }

    /// Sets the mapping context.
    pub fn with_context(mut self, context: MappingContext) -> Self {
        self.context = context;
        self
    }

    /// The half-open range over the original text.
    pub fn range(&self) -> (usize, usize) {
        (self.start_pos, self.end_pos)
    }

    /// Length of the replaced span in codepoints.
    pub fn span_len(&self) -> usize {
        self.end_pos.saturating_sub(self.start_pos)
    }

    /// Signed length change this mapping applies to the final text.
    pub fn length_delta(&self) -> i64 {
        self.replacement.chars().count() as i64 - self.span_len() as i64
    }

    fn check_range(&self) -> Result<(), MappingError> {
        if self.end_pos < self.start_pos {
            return Err(MappingError::InvertedRange {
                start: self.start_pos,
                end: self.end_pos,
            });
        }
        Ok(())
    }
}

/// Returns true if two half-open ranges intersect.
///
/// Adjacency (`a.end == b.start`) is not an intersection.
fn ranges_intersect(a: (usize, usize), b: (usize, usize)) -> bool {
    a.0.max(b.0) < a.1.min(b.1)
}

/// Validates a candidate mapping against an existing set.
///
/// Rejects if the candidate's range intersects any existing mapping's
/// range. The returned error identifies the offending pair, with `second`
/// always being the candidate's range.
///
/// # Errors
///
/// Returns `MappingError::InvertedRange` for a malformed candidate, or
/// `MappingError::Overlap` naming the conflicting ranges.
pub fn validate(
    existing: &[SubstringMapping],
    candidate: &SubstringMapping,
) -> Result<(), MappingError> {
    candidate.check_range()?;

    for m in existing {
        if ranges_intersect(m.range(), candidate.range()) {
            return Err(MappingError::Overlap {
                first: m.range(),
                second: candidate.range(),
            });
        }
    }

    Ok(())
}

/// Validates a whole mapping set for pairwise non-overlap.
///
/// Sorts by `start_pos` and checks each adjacent pair.
///
/// # Errors
///
/// Returns the first violation found in sorted order.
pub fn validate_set(mappings: &[SubstringMapping]) -> Result<(), MappingError> {
    for m in mappings {
        m.check_range()?;
    }

    let mut sorted: Vec<&SubstringMapping> = mappings.iter().collect();
    sorted.sort_by_key(|m| (m.start_pos, m.end_pos));

    for pair in sorted.windows(2) {
        if ranges_intersect(pair[0].range(), pair[1].range()) {
            return Err(MappingError::Overlap {
                first: pair[0].range(),
                second: pair[1].range(),
            });
        }
    }

    Ok(())
}

/// Validates a mapping against the text it will be applied to.
///
/// Beyond the range checks, the mapping's `original` field must match the
/// span content exactly; this catches edits made against a stale copy of
/// the question text before they reach persisted state.
///
/// # Errors
///
/// Returns `OutOfBounds` or `SpanMismatch` in addition to the range checks.
pub fn validate_for_text(text: &str, mapping: &SubstringMapping) -> Result<(), MappingError> {
    mapping.check_range()?;

    let chars: Vec<char> = text.chars().collect();
    if mapping.end_pos > chars.len() {
        return Err(MappingError::OutOfBounds {
            end: mapping.end_pos,
            len: chars.len(),
        });
    }

    let span: String = chars[mapping.start_pos..mapping.end_pos].iter().collect();
    if span != mapping.original {
        return Err(MappingError::SpanMismatch {
            expected: mapping.original.clone(),
            found: span,
        });
    }

    Ok(())
}

/// Reconstructs the previewed/attacked text from a mapping set.
///
/// Mappings are applied in original-text order: the unmodified original
/// text between the end of the previous mapping and the start of the
/// current one is emitted, then the replacement in place of the span, and
/// the tail after the last mapping is appended unchanged.
///
/// Identity law: an empty mapping set returns the original text. Calling
/// this repeatedly with the same inputs yields byte-identical output.
///
/// # Errors
///
/// The set is validated (non-overlap, bounds, span agreement) before any
/// text is produced.
pub fn reconstruct(original: &str, mappings: &[SubstringMapping]) -> Result<String, MappingError> {
    validate_set(mappings)?;
    for m in mappings {
        validate_for_text(original, m)?;
    }

    let chars: Vec<char> = original.chars().collect();
    let mut sorted: Vec<&SubstringMapping> = mappings.iter().collect();
    sorted.sort_by_key(|m| (m.start_pos, m.end_pos));

    let mut out = String::with_capacity(original.len());
    let mut cursor = 0usize;

    for m in sorted {
        out.extend(&chars[cursor..m.start_pos]);
        out.push_str(&m.replacement);
        cursor = m.end_pos;
    }
    out.extend(&chars[cursor..]);

    Ok(out)
}

/// Computes each replacement's span in final-text coordinates.
///
/// Walks the mappings in original-text order accumulating the running
/// offset (`len(replacement) - span`) so callers can highlight replaced
/// regions in a rendered view of the reconstructed text. Spans are
/// returned in the sorted order the reconstruction applies them.
pub fn final_spans(mappings: &[SubstringMapping]) -> Vec<(usize, usize)> {
    let mut sorted: Vec<&SubstringMapping> = mappings.iter().collect();
    sorted.sort_by_key(|m| (m.start_pos, m.end_pos));

    let mut offset: i64 = 0;
    let mut spans = Vec::with_capacity(sorted.len());

    for m in sorted {
        let repl_len = m.replacement.chars().count() as i64;
        let start = m.start_pos as i64 + offset;
        spans.push((start as usize, (start + repl_len) as usize));
        offset += repl_len - m.span_len() as i64;
    }

    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(original: &str, replacement: &str, start: usize, end: usize) -> SubstringMapping {
        SubstringMapping::new(original, replacement, start, end)
    }

    #[test]
    fn test_validate_empty_existing() {
        let candidate = m("cat", "dog", 10, 13);
        assert!(validate(&[], &candidate).is_ok());
    }

    #[test]
    fn test_validate_rejects_overlap() {
        let existing = vec![m("x", "y", 8, 12)];
        let candidate = m("a", "b", 5, 10);
        let err = validate(&existing, &candidate).unwrap_err();
        assert_eq!(
            err,
            MappingError::Overlap {
                first: (8, 12),
                second: (5, 10),
            }
        );
    }

    #[test]
    fn test_validate_rejects_contained_range() {
        let existing = vec![m("abcdef", "x", 0, 6)];
        let candidate = m("cd", "y", 2, 4);
        assert!(matches!(
            validate(&existing, &candidate),
            Err(MappingError::Overlap { .. })
        ));
    }

    #[test]
    fn test_adjacency_allowed() {
        let existing = vec![m("abc", "x", 0, 3)];
        let candidate = m("def", "y", 3, 6);
        assert!(validate(&existing, &candidate).is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let candidate = m("x", "y", 5, 3);
        assert_eq!(
            validate(&[], &candidate),
            Err(MappingError::InvertedRange { start: 5, end: 3 })
        );
    }

    #[test]
    fn test_validate_set_sorted_pairwise() {
        let set = vec![m("a", "x", 0, 3), m("b", "y", 5, 8), m("c", "z", 3, 5)];
        assert!(validate_set(&set).is_ok());

        let bad = vec![m("a", "x", 0, 3), m("b", "y", 2, 5)];
        assert!(matches!(
            validate_set(&bad),
            Err(MappingError::Overlap { .. })
        ));
    }

    #[test]
    fn test_reconstruct_identity() {
        let text = "The quick brown fox jumps over the lazy dog";
        assert_eq!(reconstruct(text, &[]).unwrap(), text);
        assert_eq!(reconstruct("", &[]).unwrap(), "");
    }

    #[test]
    fn test_reconstruct_equal_length() {
        let text = "There is a cat on the mat";
        assert_eq!(&text[11..14], "cat");
        let mappings = vec![m("cat", "dog", 11, 14)];
        let out = reconstruct(text, &mappings).unwrap();
        assert_eq!(out, "There is a dog on the mat");
        assert_eq!(out.chars().count(), text.chars().count());
    }

    #[test]
    fn test_reconstruct_length_law() {
        let text = "one two three four";
        let mappings = vec![m("one", "1", 0, 3), m("three", "333333", 8, 13)];
        let out = reconstruct(text, &mappings).unwrap();
        assert_eq!(out, "1 two 333333 four");

        let delta: i64 = mappings.iter().map(|m| m.length_delta()).sum();
        assert_eq!(
            out.chars().count() as i64,
            text.chars().count() as i64 + delta
        );
    }

    #[test]
    fn test_reconstruct_pure_insertion() {
        let text = "ab";
        let mappings = vec![m("", "XY", 1, 1)];
        assert_eq!(reconstruct(text, &mappings).unwrap(), "aXYb");
    }

    #[test]
    fn test_reconstruct_unsorted_input() {
        let text = "alpha beta gamma";
        let mappings = vec![m("gamma", "G", 11, 16), m("alpha", "A", 0, 5)];
        assert_eq!(reconstruct(text, &mappings).unwrap(), "A beta G");
    }

    #[test]
    fn test_reconstruct_idempotent_inputs() {
        let text = "repeatable output";
        let mappings = vec![m("output", "result", 11, 17)];
        let a = reconstruct(text, &mappings).unwrap();
        let b = reconstruct(text, &mappings).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_reconstruct_codepoint_offsets() {
        // Multi-byte codepoints: offsets count chars, not bytes.
        let text = "héllo wörld";
        let mappings = vec![m("wörld", "earth", 6, 11)];
        assert_eq!(reconstruct(text, &mappings).unwrap(), "héllo earth");
    }

    #[test]
    fn test_reconstruct_rejects_stale_span() {
        let text = "fresh text";
        let mappings = vec![m("stale", "x", 0, 5)];
        assert!(matches!(
            reconstruct(text, &mappings),
            Err(MappingError::SpanMismatch { .. })
        ));
    }

    #[test]
    fn test_reconstruct_rejects_out_of_bounds() {
        let text = "short";
        let mappings = vec![m("beyond", "x", 3, 9)];
        assert_eq!(
            reconstruct(text, &mappings),
            Err(MappingError::OutOfBounds { end: 9, len: 5 })
        );
    }

    #[test]
    fn test_partial_overlap_both_directions() {
        // Inserting {5,10} when {8,12} exists must be rejected.
        let existing = vec![m("x", "y", 8, 12)];
        let candidate = m("a", "b", 5, 10);
        assert!(validate(&existing, &candidate).is_err());

        // [10,13) then [11,15) intersects as well.
        let existing = vec![m("cat", "dog", 10, 13)];
        let candidate = m("t on", "q", 11, 15);
        assert!(matches!(
            validate(&existing, &candidate),
            Err(MappingError::Overlap {
                first: (10, 13),
                second: (11, 15),
            })
        ));
    }

    #[test]
    fn test_final_spans_offset_accumulation() {
        // "one two three" -> "1 two 333333"
        let mappings = vec![m("one", "1", 0, 3), m("three", "333333", 8, 13)];
        let spans = final_spans(&mappings);
        // "1" occupies [0,1); offset is now -2, so "333333" starts at 6.
        assert_eq!(spans, vec![(0, 1), (6, 12)]);
    }

    #[test]
    fn test_final_spans_empty() {
        assert!(final_spans(&[]).is_empty());
    }
}
