//! Merge policy for validated completion-service suggestions.
//!
//! A suggestion replaces the stored value only when it strictly raises the
//! field's confidence; ties keep what is already there. The confidence
//! assigned to a suggestion depends on what it does to the field.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::fields::CanonicalField;
use crate::models::{FieldMap, FieldValue, Provenance};
use crate::validate::ValidatedSuggestion;

/// Confidence for a suggestion that fills an empty or absent field.
pub const FILLED_CONFIDENCE: f64 = 0.85;
/// Confidence for a suggestion that disagrees with the stored value.
pub const CORRECTED_CONFIDENCE: f64 = 0.75;
/// Confidence for a suggestion that repeats the stored value.
pub const CONFIRMED_CONFIDENCE: f64 = 0.95;

/// What a suggestion does relative to the stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionContext {
    Filled,
    Corrected,
    Confirmed,
}

impl CorrectionContext {
    pub fn classify(current: Option<&FieldValue>, suggestion: &ValidatedSuggestion) -> Self {
        match current {
            None => CorrectionContext::Filled,
            Some(v) if v.data.is_blank() => CorrectionContext::Filled,
            Some(v) if v.data.agrees_with(&suggestion.data) => CorrectionContext::Confirmed,
            Some(_) => CorrectionContext::Corrected,
        }
    }

    pub fn confidence(self) -> f64 {
        match self {
            CorrectionContext::Filled => FILLED_CONFIDENCE,
            CorrectionContext::Corrected => CORRECTED_CONFIDENCE,
            CorrectionContext::Confirmed => CONFIRMED_CONFIDENCE,
        }
    }
}

/// Outcome of merging one batch of suggestions.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeResult {
    /// Values that replaced (or filled) the stored field.
    pub applied: BTreeMap<CanonicalField, FieldValue>,
    /// Fields whose stored value won (equal or higher confidence).
    pub kept: Vec<CanonicalField>,
}

/// Merge `suggestions` over `current` without mutating it.
///
/// Later suggestions for the same field are judged against earlier accepted
/// ones, so the result does not depend on which group finished first when
/// groups never share fields.
pub fn merge_suggestions(current: &FieldMap, suggestions: &[ValidatedSuggestion]) -> MergeResult {
    let mut result = MergeResult::default();

    for suggestion in suggestions {
        let stored = result
            .applied
            .get(&suggestion.field)
            .or_else(|| current.get(&suggestion.field));
        let context = CorrectionContext::classify(stored, suggestion);
        let confidence = context.confidence();
        let stored_confidence = stored.map(|v| v.confidence).unwrap_or(0.0);

        if confidence > stored_confidence {
            result.applied.insert(
                suggestion.field,
                FieldValue::new(
                    suggestion.data.clone(),
                    confidence,
                    Provenance::CompletionService,
                ),
            );
            result.kept.retain(|f| *f != suggestion.field);
        } else if !result.kept.contains(&suggestion.field) {
            result.kept.push(suggestion.field);
        }
    }

    result
}
