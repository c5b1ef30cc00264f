//! Optimistic concurrency gateway.
//!
//! Turns the store's guarded primitives into a caller-facing contract for
//! the review API and the CLI. Each operation calls exactly one guarded
//! primitive and branches on its result; a lost race is answered with a
//! [`Conflict`] carrying the current authoritative version and state. The
//! gateway never retries and never merges on the caller's behalf.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;

use extraction_guard_core::fields::CanonicalField;
use extraction_guard_core::models::{
    FieldPatch, FieldValue, LineItem, ProcessingState, RecordId,
};
use extraction_guard_core::store::{require_record, RecordStore, StoreError};
use extraction_guard_core::validate::{validate_value, ValidationError};

/// Stable machine-readable conflict codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictCode {
    /// `expected_version` is stale.
    VersionConflict,
    /// The record is not in a state the request accepts.
    StateConflict,
}

impl ConflictCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictCode::VersionConflict => "version_conflict",
            ConflictCode::StateConflict => "state_conflict",
        }
    }
}

/// Everything a caller needs to reload and decide what to do next.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conflict {
    pub code: ConflictCode,
    pub message: String,
    pub current_version: u64,
    pub current_state: ProcessingState,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{}", .0.message)]
    Conflict(Conflict),
    #[error("record not found: {0}")]
    NotFound(RecordId),
    #[error("invalid field value: {0}")]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for GatewayError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => GatewayError::NotFound(id),
            other => GatewayError::Store(other),
        }
    }
}

/// A successfully applied patch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatchApplied {
    pub version: u64,
    /// The field changes as applied; `null` marks a cleared field.
    pub fields: BTreeMap<CanonicalField, Option<FieldValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_items: Option<Vec<LineItem>>,
}

#[derive(Clone)]
pub struct ReviewGateway {
    store: Arc<dyn RecordStore>,
}

impl ReviewGateway {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Apply `patch` if the record is still at `expected_version`.
    pub async fn apply_patch(
        &self,
        id: &RecordId,
        expected_version: u64,
        patch: FieldPatch,
    ) -> Result<PatchApplied, GatewayError> {
        let rows = self
            .store
            .patch_with_version_guard(id, expected_version, &patch)
            .await?;
        if rows == 1 {
            tracing::info!(record = %id, version = expected_version + 1, "patch applied");
            return Ok(PatchApplied {
                version: expected_version + 1,
                fields: patch.fields,
                line_items: patch.line_items,
            });
        }

        let current = require_record(self.store.as_ref(), id).await?;
        tracing::debug!(
            record = %id,
            expected = expected_version,
            current = current.review_version,
            "stale patch rejected"
        );
        Err(GatewayError::Conflict(Conflict {
            code: ConflictCode::VersionConflict,
            message: format!(
                "record {} is at version {}, not {}; reload and re-apply your edit",
                id, current.review_version, expected_version
            ),
            current_version: current.review_version,
            current_state: current.processing_state,
        }))
    }

    /// Claim a PENDING record for extraction.
    pub async fn claim(&self, id: &RecordId) -> Result<(), GatewayError> {
        if self.store.claim_for_extraction(id).await? {
            tracing::info!(record = %id, "claimed for extraction");
            return Ok(());
        }
        Err(self
            .state_conflict(id, format!("record {} is not PENDING", id))
            .await)
    }

    /// Move a record from any state in `from` to `to`.
    pub async fn transition(
        &self,
        id: &RecordId,
        from: &BTreeSet<ProcessingState>,
        to: ProcessingState,
    ) -> Result<(), GatewayError> {
        if self.store.transition_state(id, from, to).await? {
            tracing::info!(record = %id, to = %to, "state transitioned");
            return Ok(());
        }
        let expected = from
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        Err(self
            .state_conflict(id, format!("record {} is not in any of [{}]", id, expected))
            .await)
    }

    async fn state_conflict(&self, id: &RecordId, message: String) -> GatewayError {
        match require_record(self.store.as_ref(), id).await {
            Ok(current) => GatewayError::Conflict(Conflict {
                code: ConflictCode::StateConflict,
                message: format!("{} (currently {})", message, current.processing_state),
                current_version: current.review_version,
                current_state: current.processing_state,
            }),
            Err(e) => e.into(),
        }
    }
}

/// Build a patch from reviewer input: `{field_name: raw_value | null}`.
///
/// Values go through the same format rules as completion suggestions and
/// are stored with human provenance.
pub fn human_patch(
    fields: &Map<String, Value>,
    line_items: Option<Vec<LineItem>>,
) -> Result<FieldPatch, ValidationError> {
    let mut patch = FieldPatch {
        fields: BTreeMap::new(),
        line_items,
    };
    for (name, raw) in fields {
        let field: CanonicalField = name
            .parse()
            .map_err(|_| ValidationError::UnknownField(name.clone()))?;
        patch = if raw.is_null() {
            patch.clear(field)
        } else {
            patch.set(field, FieldValue::human(validate_value(field, raw)?))
        };
    }
    Ok(patch)
}
