//! End-to-end pipeline runs against a SQLite store.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use extraction_guard::completion::{CompletionClient, CompletionError, CompletionRequest};
use extraction_guard::config::{Config, DbConfig, ServerConfig};
use extraction_guard::db;
use extraction_guard::fallback::{FallbackOrchestrator, FallbackSettings};
use extraction_guard::migrate::apply_schema;
use extraction_guard::pipeline::{process_record, Analysis, FieldExtractor, PipelineOutcome};
use extraction_guard::sqlite_store::SqliteRecordStore;
use extraction_guard_core::cache::FallbackCache;
use extraction_guard_core::consistency::DEFAULT_TOLERANCE;
use extraction_guard_core::fields::{CanonicalField, FieldGroup};
use extraction_guard_core::merge::FILLED_CONFIDENCE;
use extraction_guard_core::models::{
    ExtractionRecord, FieldData, FieldMap, FieldPatch, FieldValue, NewRecord, ProcessingState,
    Provenance, RecordId,
};
use extraction_guard_core::store::RecordStore;

async fn open_store(tmp: &TempDir) -> Arc<SqliteRecordStore> {
    let config = Config {
        db: DbConfig {
            path: tmp.path().join("exg.sqlite"),
        },
        fallback: Default::default(),
        completion: Default::default(),
        consistency: Default::default(),
        server: ServerConfig {
            bind: "127.0.0.1:0".to_string(),
        },
    };
    let pool = db::connect(&config).await.unwrap();
    apply_schema(&pool).await.unwrap();
    Arc::new(SqliteRecordStore::new(pool))
}

async fn insert(store: &SqliteRecordStore, fields: FieldMap) -> RecordId {
    store
        .insert_record(&NewRecord {
            document_fingerprint: "doc-7".into(),
            fields,
            ..Default::default()
        })
        .await
        .unwrap()
}

/// A reviewer saves an edit while analysis is still running.
struct EditedDuringAnalysis {
    store: Arc<SqliteRecordStore>,
}

#[async_trait]
impl FieldExtractor for EditedDuringAnalysis {
    async fn analyze(&self, record: &ExtractionRecord) -> anyhow::Result<Analysis> {
        let edit = FieldPatch::default().set(
            CanonicalField::VendorName,
            FieldValue::human(FieldData::Text("Acme Reviewed".into())),
        );
        let rows = self
            .store
            .patch_with_version_guard(&record.id, record.review_version, &edit)
            .await?;
        assert_eq!(rows, 1);

        let mut analysis = Analysis::default();
        analysis.fields.insert(
            CanonicalField::InvoiceNumber,
            FieldValue::new(FieldData::Text("INV-7".into()), 0.97, Provenance::DocumentAnalysis),
        );
        Ok(analysis)
    }
}

struct Fixed(Analysis);

#[async_trait]
impl FieldExtractor for Fixed {
    async fn analyze(&self, _record: &ExtractionRecord) -> anyhow::Result<Analysis> {
        Ok(self.0.clone())
    }
}

/// Answers each group with a fixed payload; unknown groups get `{}`.
#[derive(Default)]
struct GroupReplies {
    replies: HashMap<FieldGroup, Value>,
    calls: Mutex<Vec<FieldGroup>>,
}

#[async_trait]
impl CompletionClient for GroupReplies {
    async fn complete(&self, request: &CompletionRequest) -> Result<Value, CompletionError> {
        self.calls.lock().unwrap().push(request.group);
        Ok(self
            .replies
            .get(&request.group)
            .cloned()
            .unwrap_or_else(|| json!({})))
    }
}

fn orchestrator(client: Arc<GroupReplies>) -> FallbackOrchestrator {
    FallbackOrchestrator::new(
        client,
        Arc::new(FallbackCache::new(Duration::from_secs(60), 16)),
        FallbackSettings {
            confidence_threshold: 0.8,
            max_in_flight: 2,
            max_attempts: 2,
            call_timeout: Duration::from_millis(500),
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(2),
            excerpt_chars: 200,
        },
    )
}

#[tokio::test]
async fn test_edit_during_extraction_requeues_record() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let id = insert(&store, FieldMap::new()).await;
    let extractor = EditedDuringAnalysis {
        store: store.clone(),
    };

    let outcome = process_record(store.as_ref(), None, &extractor, &id, DEFAULT_TOLERANCE)
        .await
        .unwrap();
    assert!(
        matches!(outcome, PipelineOutcome::Requeued { .. }),
        "got {:?}",
        outcome
    );

    let record = store.get_record(&id).await.unwrap().unwrap();
    assert_eq!(record.processing_state, ProcessingState::Pending);
    // Only the reviewer's write landed.
    assert_eq!(record.review_version, 1);
    assert_eq!(
        record.fields[&CanonicalField::VendorName].provenance,
        Provenance::Human
    );
    assert!(!record.fields.contains_key(&CanonicalField::InvoiceNumber));

    // The requeued record can be claimed and extracted on the next pass.
    let outcome = process_record(
        store.as_ref(),
        None,
        &Fixed(Analysis::default()),
        &id,
        DEFAULT_TOLERANCE,
    )
    .await
    .unwrap();
    assert!(matches!(outcome, PipelineOutcome::Extracted { version: 2, .. }));
}

#[tokio::test]
async fn test_fallback_suggestions_are_stored_without_touching_reviewed_fields() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let mut fields = FieldMap::new();
    fields.insert(
        CanonicalField::VendorName,
        FieldValue::human(FieldData::Text("Acme Reviewed".into())),
    );
    let id = insert(&store, fields).await;

    let mut analysis = Analysis::default();
    analysis.fields.insert(
        CanonicalField::VendorName,
        FieldValue::new(FieldData::Text("ACME LTD".into()), 0.9, Provenance::DocumentAnalysis),
    );
    analysis.missing = BTreeSet::from([CanonicalField::InvoiceNumber]);
    analysis.text = "Invoice INV-7 from Acme".into();

    let client = Arc::new(GroupReplies {
        replies: HashMap::from([(
            FieldGroup::Header,
            json!({"invoice_number": "INV-7", "vendor_name": "Someone Else"}),
        )]),
        ..Default::default()
    });
    let orchestrator = orchestrator(client.clone());

    let outcome = process_record(
        store.as_ref(),
        Some(&orchestrator),
        &Fixed(analysis),
        &id,
        DEFAULT_TOLERANCE,
    )
    .await
    .unwrap();
    match outcome {
        PipelineOutcome::Extracted {
            version, fallback, ..
        } => {
            assert_eq!(version, 1);
            let fallback = fallback.unwrap();
            assert_eq!(fallback.attempted, 1);
            assert_eq!(fallback.succeeded, 1);
        }
        other => panic!("expected extraction, got {:?}", other),
    }
    assert_eq!(*client.calls.lock().unwrap(), vec![FieldGroup::Header]);

    let record = store.get_record(&id).await.unwrap().unwrap();
    assert_eq!(record.processing_state, ProcessingState::Extracted);
    assert_eq!(record.review_version, 1);

    let invoice = &record.fields[&CanonicalField::InvoiceNumber];
    assert_eq!(invoice.data, FieldData::Text("INV-7".into()));
    assert_eq!(invoice.provenance, Provenance::CompletionService);
    assert_eq!(invoice.confidence, FILLED_CONFIDENCE);

    let vendor = &record.fields[&CanonicalField::VendorName];
    assert_eq!(vendor.data, FieldData::Text("Acme Reviewed".into()));
    assert_eq!(vendor.provenance, Provenance::Human);
}

#[tokio::test]
async fn test_shared_orchestrator_reuses_cached_suggestions_across_records() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    // Same source document ingested twice.
    let first = insert(&store, FieldMap::new()).await;
    let second = insert(&store, FieldMap::new()).await;

    let client = Arc::new(GroupReplies {
        replies: HashMap::from([(FieldGroup::Header, json!({"invoice_number": "INV-7"}))]),
        ..Default::default()
    });
    let orchestrator = orchestrator(client.clone());
    let analysis = Analysis {
        missing: BTreeSet::from([CanonicalField::InvoiceNumber]),
        text: "Invoice INV-7".into(),
        ..Default::default()
    };

    let mut cached = Vec::new();
    for id in [&first, &second] {
        let outcome = process_record(
            store.as_ref(),
            Some(&orchestrator),
            &Fixed(analysis.clone()),
            id,
            DEFAULT_TOLERANCE,
        )
        .await
        .unwrap();
        let fallback = match outcome {
            PipelineOutcome::Extracted {
                fallback: Some(fallback),
                ..
            } => fallback,
            other => panic!("expected extraction with fallback, got {:?}", other),
        };
        let report = fallback.report(FieldGroup::Header).unwrap();
        cached.push(matches!(
            report.status,
            extraction_guard::fallback::GroupStatus::Succeeded { cached: true, .. }
        ));
    }

    assert_eq!(cached, vec![false, true]);
    assert_eq!(client.calls.lock().unwrap().len(), 1);
    let record = store.get_record(&second).await.unwrap().unwrap();
    assert_eq!(
        record.fields[&CanonicalField::InvoiceNumber].data,
        FieldData::Text("INV-7".into())
    );
}
