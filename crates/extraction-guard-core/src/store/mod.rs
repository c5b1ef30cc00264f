//! Guarded record storage.
//!
//! The [`RecordStore`] trait is the only way to mutate an
//! [`ExtractionRecord`](crate::models::ExtractionRecord). Every mutating
//! operation is one predicate-guarded write that reports how many rows it
//! touched; none of them reads the row, decides in application code, and
//! writes again.
//!
//! Zero rows affected is a normal outcome meaning "someone else won the
//! race". Backend failures are [`StoreError`]s and are never reported as a
//! lost race.
//!
//! # Operations
//!
//! | Method | Guard | Effect |
//! |--------|-------|--------|
//! | [`claim_for_extraction`](RecordStore::claim_for_extraction) | state = PENDING | state := PROCESSING |
//! | [`transition_state`](RecordStore::transition_state) | state ∈ from | state := to |
//! | [`patch_with_version_guard`](RecordStore::patch_with_version_guard) | version = expected | apply patch, version := expected + 1 |

pub mod memory;

use async_trait::async_trait;
use std::collections::BTreeSet;
use thiserror::Error;

use crate::models::{ExtractionRecord, FieldPatch, NewRecord, ProcessingState, RecordId};

/// Store failures. A lost race is never one of these.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connectivity, pool exhaustion, busy database, poisoned lock.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Constraint violation, including inserting a duplicate id.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// A stored payload no longer decodes.
    #[error("corrupt record {id}: {message}")]
    Corrupt { id: String, message: String },

    /// The requested edge does not exist in the lifecycle graph.
    #[error("illegal transition from {from:?} to {to}")]
    IllegalTransition {
        from: Vec<ProcessingState>,
        to: ProcessingState,
    },

    /// A mandatory lookup found nothing.
    #[error("record not found: {0}")]
    NotFound(RecordId),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Restrict `from` to states with a legal edge into `to`.
///
/// Fails with [`StoreError::IllegalTransition`] when none remain, so a
/// caller asking for an impossible move gets an error instead of a silent
/// `false` that looks like a lost race.
pub fn legal_sources(
    from: &BTreeSet<ProcessingState>,
    to: ProcessingState,
) -> StoreResult<Vec<ProcessingState>> {
    let legal: Vec<ProcessingState> = from
        .iter()
        .copied()
        .filter(|s| s.can_transition_to(to))
        .collect();
    if legal.is_empty() {
        return Err(StoreError::IllegalTransition {
            from: from.iter().copied().collect(),
            to,
        });
    }
    Ok(legal)
}

/// Abstract guarded storage backend.
///
/// Implementations must make each mutating method atomic with respect to
/// every other caller, in this process or any other.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a new `PENDING` record at version 0. Returns its id.
    async fn insert_record(&self, record: &NewRecord) -> StoreResult<RecordId>;

    /// Fetch the authoritative record.
    async fn get_record(&self, id: &RecordId) -> StoreResult<Option<ExtractionRecord>>;

    /// PENDING → PROCESSING. True iff exactly this call won the claim.
    async fn claim_for_extraction(&self, id: &RecordId) -> StoreResult<bool>;

    /// Move to `to` if the record is currently in one of `from`.
    async fn transition_state(
        &self,
        id: &RecordId,
        from: &BTreeSet<ProcessingState>,
        to: ProcessingState,
    ) -> StoreResult<bool>;

    /// Apply `patch` and set the version to `expected_version + 1`, only if
    /// the stored version equals `expected_version`. Returns rows affected
    /// (0 = stale, 1 = applied).
    async fn patch_with_version_guard(
        &self,
        id: &RecordId,
        expected_version: u64,
        patch: &FieldPatch,
    ) -> StoreResult<u64>;
}

/// Fetch a record that must exist.
pub async fn require_record(
    store: &dyn RecordStore,
    id: &RecordId,
) -> StoreResult<ExtractionRecord> {
    store
        .get_record(id)
        .await?
        .ok_or_else(|| StoreError::NotFound(id.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_sources_filters() {
        let from: BTreeSet<_> = [ProcessingState::Processing, ProcessingState::Staged]
            .into_iter()
            .collect();
        let legal = legal_sources(&from, ProcessingState::Extracted).unwrap();
        assert_eq!(legal, vec![ProcessingState::Processing]);
    }

    #[test]
    fn test_legal_sources_rejects_impossible_move() {
        let from: BTreeSet<_> = [ProcessingState::Pending].into_iter().collect();
        let err = legal_sources(&from, ProcessingState::Staged).unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }
}
