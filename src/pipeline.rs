//! Extraction pipeline for a single record.
//!
//! ```text
//! claim ─▶ analyze ─▶ fallback ─▶ consistency ─▶ guarded patch ─▶ EXTRACTED
//!   │         │                                      │
//!   │         └─ error ─▶ ERROR                      └─ stale ─▶ PENDING
//!   └─ lost ─▶ NotClaimed
//! ```
//!
//! The claim is the only exclusivity this module relies on, and only for
//! the duration of one call. Every exit after a successful claim leaves the
//! record in a state the lifecycle graph allows to continue from.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use extraction_guard_core::consistency::{check_totals, ConsistencyReport};
use extraction_guard_core::fields::CanonicalField;
use extraction_guard_core::models::{
    ExtractionRecord, FieldMap, FieldPatch, LineItem, ProcessingState, Provenance, RecordId,
};
use extraction_guard_core::store::{require_record, RecordStore, StoreResult};

use crate::fallback::{FallbackOrchestrator, FallbackOutcome, FallbackRequest};

/// Output of the document-analysis step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Analysis {
    #[serde(default)]
    pub fields: FieldMap,
    /// Fields the analyzer looked for and did not find.
    #[serde(default)]
    pub missing: BTreeSet<CanonicalField>,
    #[serde(default)]
    pub line_items: Option<Vec<LineItem>>,
    /// Plain document text, used for the fallback excerpt.
    #[serde(default)]
    pub text: String,
}

/// The document-analysis collaborator.
#[async_trait]
pub trait FieldExtractor: Send + Sync {
    async fn analyze(&self, record: &ExtractionRecord) -> anyhow::Result<Analysis>;
}

/// Replays a saved analysis result from a JSON file.
pub struct AnalysisFile {
    path: PathBuf,
}

impl AnalysisFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl FieldExtractor for AnalysisFile {
    async fn analyze(&self, _record: &ExtractionRecord) -> anyhow::Result<Analysis> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read analysis file {}: {}", self.path.display(), e)
        })?;
        let analysis: Analysis = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid analysis file {}: {}", self.path.display(), e))?;
        Ok(analysis)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineOutcome {
    /// Another worker holds the record, or it is not PENDING.
    NotClaimed,
    Extracted {
        version: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        fallback: Option<FallbackOutcome>,
        consistency: ConsistencyReport,
    },
    /// Lost a race after claiming; the record is PENDING again.
    Requeued { reason: String },
    Failed { reason: String },
}

/// Run one record through the pipeline.
///
/// Store faults propagate as errors. Everything else, including a failed
/// analysis or a partial fallback, is reported through [`PipelineOutcome`].
pub async fn process_record(
    store: &dyn RecordStore,
    orchestrator: Option<&FallbackOrchestrator>,
    extractor: &dyn FieldExtractor,
    id: &RecordId,
    tolerance: f64,
) -> StoreResult<PipelineOutcome> {
    if !store.claim_for_extraction(id).await? {
        tracing::debug!(record = %id, "claim lost");
        return Ok(PipelineOutcome::NotClaimed);
    }

    match run_claimed(store, orchestrator, extractor, id, tolerance).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            // Leave the record claimable if the store comes back.
            if let Err(release) = release(store, id, ProcessingState::Pending).await {
                tracing::error!(record = %id, error = %release, "failed to release claim");
            }
            Err(e)
        }
    }
}

async fn run_claimed(
    store: &dyn RecordStore,
    orchestrator: Option<&FallbackOrchestrator>,
    extractor: &dyn FieldExtractor,
    id: &RecordId,
    tolerance: f64,
) -> StoreResult<PipelineOutcome> {
    let record = require_record(store, id).await?;

    let analysis = match extractor.analyze(&record).await {
        Ok(analysis) => analysis,
        Err(e) => {
            tracing::warn!(record = %id, error = %e, "document analysis failed");
            release(store, id, ProcessingState::Error).await?;
            return Ok(PipelineOutcome::Failed {
                reason: format!("document analysis failed: {}", e),
            });
        }
    };

    let mut fields = overlay_analysis(&record.fields, &analysis.fields);

    let fallback = match orchestrator {
        Some(orchestrator) => {
            let request = FallbackRequest {
                document_fingerprint: record.document_fingerprint.clone(),
                fields: fields.clone(),
                missing: analysis.missing.clone(),
                excerpt: analysis.text.clone(),
            };
            let outcome = orchestrator.run(&request).await;
            fields.extend(outcome.merge.applied.clone());
            Some(outcome)
        }
        None => None,
    };

    let line_items = analysis
        .line_items
        .clone()
        .unwrap_or_else(|| record.line_items.clone());
    let consistency = check_totals(&fields, &line_items, tolerance);
    for warning in consistency.warnings() {
        tracing::warn!(record = %id, warning = %warning, "consistency check failed");
    }

    let patch = FieldPatch {
        fields: fields
            .iter()
            .filter(|(k, v)| record.fields.get(k) != Some(v))
            .map(|(k, v)| (*k, Some(v.clone())))
            .collect(),
        line_items: analysis.line_items,
    };
    let rows = store
        .patch_with_version_guard(id, record.review_version, &patch)
        .await?;
    if rows == 0 {
        tracing::info!(record = %id, "record edited during extraction; requeueing");
        release(store, id, ProcessingState::Pending).await?;
        return Ok(PipelineOutcome::Requeued {
            reason: format!(
                "record changed after version {} was read",
                record.review_version
            ),
        });
    }

    let from = BTreeSet::from([ProcessingState::Processing]);
    if !store
        .transition_state(id, &from, ProcessingState::Extracted)
        .await?
    {
        return Ok(PipelineOutcome::Failed {
            reason: "record left PROCESSING before extraction finished".to_string(),
        });
    }

    tracing::info!(
        record = %id,
        version = record.review_version + 1,
        consistent = consistency.all_valid,
        "record extracted"
    );
    Ok(PipelineOutcome::Extracted {
        version: record.review_version + 1,
        fallback,
        consistency,
    })
}

/// Analyzer output replaces stored values except those a reviewer set.
fn overlay_analysis(stored: &FieldMap, analyzed: &FieldMap) -> FieldMap {
    let mut fields = stored.clone();
    for (field, value) in analyzed {
        let reviewed = stored
            .get(field)
            .is_some_and(|v| v.provenance == Provenance::Human);
        if !reviewed {
            fields.insert(*field, value.clone());
        }
    }
    fields
}

async fn release(store: &dyn RecordStore, id: &RecordId, to: ProcessingState) -> StoreResult<()> {
    let from = BTreeSet::from([ProcessingState::Processing]);
    if !store.transition_state(id, &from, to).await? {
        tracing::warn!(record = %id, to = %to, "record was no longer PROCESSING");
    }
    Ok(())
}
