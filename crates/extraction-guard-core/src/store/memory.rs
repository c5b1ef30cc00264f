//! In-memory [`RecordStore`] implementation for tests and embedded use.
//!
//! Each operation evaluates its guard and applies its write under one lock
//! acquisition, which is the in-process equivalent of a single guarded
//! statement.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::models::{ExtractionRecord, FieldPatch, NewRecord, ProcessingState, RecordId};

use super::{legal_sources, RecordStore, StoreError, StoreResult};

/// In-memory guarded store.
pub struct InMemoryRecordStore {
    records: Mutex<HashMap<RecordId, ExtractionRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, HashMap<RecordId, ExtractionRecord>>> {
        self.records
            .lock()
            .map_err(|_| StoreError::Unavailable("record map lock poisoned".to_string()))
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert_record(&self, record: &NewRecord) -> StoreResult<RecordId> {
        let id = record.id.clone().unwrap_or_else(RecordId::generate);
        let now = Utc::now();
        let mut records = self.lock()?;
        if records.contains_key(&id) {
            return Err(StoreError::Constraint(format!("duplicate record id {}", id)));
        }
        records.insert(
            id.clone(),
            ExtractionRecord {
                id: id.clone(),
                document_fingerprint: record.document_fingerprint.clone(),
                processing_state: ProcessingState::Pending,
                review_version: 0,
                fields: record.fields.clone(),
                line_items: record.line_items.clone(),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn get_record(&self, id: &RecordId) -> StoreResult<Option<ExtractionRecord>> {
        Ok(self.lock()?.get(id).cloned())
    }

    async fn claim_for_extraction(&self, id: &RecordId) -> StoreResult<bool> {
        let mut records = self.lock()?;
        match records.get_mut(id) {
            Some(r) if r.processing_state == ProcessingState::Pending => {
                r.processing_state = ProcessingState::Processing;
                r.updated_at = Utc::now();
                Ok(true)
            }
            _ => {
                tracing::debug!(record = %id, "claim guard did not match");
                Ok(false)
            }
        }
    }

    async fn transition_state(
        &self,
        id: &RecordId,
        from: &BTreeSet<ProcessingState>,
        to: ProcessingState,
    ) -> StoreResult<bool> {
        let legal = legal_sources(from, to)?;
        let mut records = self.lock()?;
        match records.get_mut(id) {
            Some(r) if legal.contains(&r.processing_state) => {
                r.processing_state = to;
                r.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn patch_with_version_guard(
        &self,
        id: &RecordId,
        expected_version: u64,
        patch: &FieldPatch,
    ) -> StoreResult<u64> {
        let mut records = self.lock()?;
        match records.get_mut(id) {
            Some(r) if r.review_version == expected_version => {
                patch.apply_to(&mut r.fields, &mut r.line_items);
                r.review_version = expected_version + 1;
                r.updated_at = Utc::now();
                Ok(1)
            }
            _ => {
                tracing::debug!(record = %id, expected_version, "version guard did not match");
                Ok(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::CanonicalField;
    use crate::models::{FieldData, FieldValue};
    use std::sync::Arc;

    async fn seeded() -> (Arc<InMemoryRecordStore>, RecordId) {
        let store = Arc::new(InMemoryRecordStore::new());
        let id = store
            .insert_record(&NewRecord {
                document_fingerprint: "fp".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        (store, id)
    }

    fn states(s: &[ProcessingState]) -> BTreeSet<ProcessingState> {
        s.iter().copied().collect()
    }

    #[tokio::test]
    async fn test_state_machine_scenario() {
        let (store, id) = seeded().await;
        assert!(store.claim_for_extraction(&id).await.unwrap());
        let r = store.get_record(&id).await.unwrap().unwrap();
        assert_eq!(r.processing_state, ProcessingState::Processing);

        assert!(store
            .transition_state(&id, &states(&[ProcessingState::Processing]), ProcessingState::Extracted)
            .await
            .unwrap());
        assert!(!store.claim_for_extraction(&id).await.unwrap());
        let r = store.get_record(&id).await.unwrap().unwrap();
        assert_eq!(r.processing_state, ProcessingState::Extracted);
    }

    #[tokio::test]
    async fn test_unknown_id_is_lost_race_not_error() {
        let store = InMemoryRecordStore::new();
        let ghost = RecordId::from("ghost");
        assert!(!store.claim_for_extraction(&ghost).await.unwrap());
        assert_eq!(
            store
                .patch_with_version_guard(&ghost, 0, &FieldPatch::default())
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_constraint_error() {
        let (store, id) = seeded().await;
        let err = store
            .insert_record(&NewRecord {
                id: Some(id),
                document_fingerprint: "fp".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_single_winner() {
        let (store, id) = seeded().await;
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                store.claim_for_extraction(&id).await.unwrap()
            }));
        }
        let mut wins = 0;
        for h in handles {
            if h.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_patches_bump_version_once() {
        let (store, id) = seeded().await;
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                let patch = FieldPatch::default().set(
                    CanonicalField::VendorName,
                    FieldValue::human(FieldData::Text(format!("writer-{}", i))),
                );
                store.patch_with_version_guard(&id, 0, &patch).await.unwrap()
            }));
        }
        let mut applied = 0;
        for h in handles {
            applied += h.await.unwrap();
        }
        assert_eq!(applied, 1);
        let r = store.get_record(&id).await.unwrap().unwrap();
        assert_eq!(r.review_version, 1);
    }
}
