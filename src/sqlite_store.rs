//! SQLite-backed [`RecordStore`] implementation.
//!
//! Every mutating method is exactly one `UPDATE … WHERE id = ? AND <guard>`
//! statement; the rows-affected count is the answer. Field patches are
//! applied inside the same statement with `json_set`/`json_remove`, so the
//! version bump and the field change commit together or not at all.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeSet;

use extraction_guard_core::models::{
    ExtractionRecord, FieldMap, FieldPatch, LineItem, NewRecord, ProcessingState, RecordId,
};
use extraction_guard_core::store::{legal_sources, RecordStore, StoreError, StoreResult};

/// SQLite implementation of the [`RecordStore`] trait.
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Map a driver error onto the store taxonomy. Constraint violations are
/// kept apart from everything else (connectivity, busy, I/O).
fn store_err(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db)
            if db.is_unique_violation()
                || db.is_check_violation()
                || db.is_foreign_key_violation() =>
        {
            StoreError::Constraint(db.message().to_string())
        }
        _ => StoreError::Unavailable(e.to_string()),
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn to_json<T: serde::Serialize>(value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|e| StoreError::Constraint(e.to_string()))
}

fn decode_row(row: &SqliteRow) -> StoreResult<ExtractionRecord> {
    let id: String = row.try_get("id").map_err(store_err)?;
    let corrupt = |message: String| StoreError::Corrupt {
        id: id.clone(),
        message,
    };

    let state: String = row.try_get("processing_state").map_err(store_err)?;
    let processing_state = state.parse::<ProcessingState>().map_err(corrupt)?;
    let version: i64 = row.try_get("review_version").map_err(store_err)?;
    let fields_json: String = row.try_get("fields_json").map_err(store_err)?;
    let items_json: String = row.try_get("line_items_json").map_err(store_err)?;
    let fields: FieldMap =
        serde_json::from_str(&fields_json).map_err(|e| corrupt(format!("fields: {}", e)))?;
    let line_items: Vec<LineItem> =
        serde_json::from_str(&items_json).map_err(|e| corrupt(format!("line items: {}", e)))?;

    Ok(ExtractionRecord {
        id: RecordId::from(id.clone()),
        document_fingerprint: row.try_get("document_fingerprint").map_err(store_err)?,
        processing_state,
        review_version: u64::try_from(version)
            .map_err(|_| corrupt(format!("negative version {}", version)))?,
        fields,
        line_items,
        created_at: from_millis(row.try_get("created_at").map_err(store_err)?),
        updated_at: from_millis(row.try_get("updated_at").map_err(store_err)?),
    })
}

/// Build the `fields_json` expression for a patch plus its bind values, in
/// textual order: `json_set` paths/values first, then `json_remove` paths.
fn patch_expression(patch: &FieldPatch) -> StoreResult<(String, Vec<String>)> {
    let mut expr = "fields_json".to_string();
    let mut binds = Vec::new();

    let sets: Vec<_> = patch
        .fields
        .iter()
        .filter_map(|(f, v)| v.as_ref().map(|v| (f, v)))
        .collect();
    if !sets.is_empty() {
        let args = vec!["?, json(?)"; sets.len()].join(", ");
        expr = format!("json_set({}, {})", expr, args);
        for (field, value) in sets {
            binds.push(format!("$.{}", field.as_str()));
            binds.push(to_json(value)?);
        }
    }

    let removes: Vec<_> = patch
        .fields
        .iter()
        .filter(|(_, v)| v.is_none())
        .map(|(f, _)| format!("$.{}", f.as_str()))
        .collect();
    if !removes.is_empty() {
        let args = vec!["?"; removes.len()].join(", ");
        expr = format!("json_remove({}, {})", expr, args);
        binds.extend(removes);
    }

    Ok((expr, binds))
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn insert_record(&self, record: &NewRecord) -> StoreResult<RecordId> {
        let id = record.id.clone().unwrap_or_else(RecordId::generate);
        let now = now_millis();

        sqlx::query(
            r#"
            INSERT INTO extraction_records (id, document_fingerprint, processing_state,
                                            review_version, fields_json, line_items_json,
                                            created_at, updated_at)
            VALUES (?, ?, 'PENDING', 0, ?, ?, ?, ?)
            "#,
        )
        .bind(id.as_str())
        .bind(&record.document_fingerprint)
        .bind(to_json(&record.fields)?)
        .bind(to_json(&record.line_items)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(id)
    }

    async fn get_record(&self, id: &RecordId) -> StoreResult<Option<ExtractionRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, document_fingerprint, processing_state, review_version,
                   fields_json, line_items_json, created_at, updated_at
            FROM extraction_records
            WHERE id = ?
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        row.as_ref().map(decode_row).transpose()
    }

    async fn claim_for_extraction(&self, id: &RecordId) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE extraction_records
            SET processing_state = 'PROCESSING', updated_at = ?
            WHERE id = ? AND processing_state = 'PENDING'
            "#,
        )
        .bind(now_millis())
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 0 {
            tracing::debug!(record = %id, "claim guard did not match");
        }
        Ok(result.rows_affected() == 1)
    }

    async fn transition_state(
        &self,
        id: &RecordId,
        from: &BTreeSet<ProcessingState>,
        to: ProcessingState,
    ) -> StoreResult<bool> {
        let legal = legal_sources(from, to)?;
        let placeholders = vec!["?"; legal.len()].join(", ");
        let sql = format!(
            "UPDATE extraction_records SET processing_state = ?, updated_at = ? \
             WHERE id = ? AND processing_state IN ({})",
            placeholders
        );

        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(now_millis())
            .bind(id.as_str());
        for state in &legal {
            query = query.bind(state.as_str());
        }
        let result = query.execute(&self.pool).await.map_err(store_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn patch_with_version_guard(
        &self,
        id: &RecordId,
        expected_version: u64,
        patch: &FieldPatch,
    ) -> StoreResult<u64> {
        // No stored row can hold a version beyond i64::MAX.
        let Ok(expected) = i64::try_from(expected_version) else {
            return Ok(0);
        };

        let (fields_expr, binds) = patch_expression(patch)?;
        let line_items = patch.line_items.as_ref().map(to_json).transpose()?;
        let sql = format!(
            "UPDATE extraction_records \
             SET fields_json = {}, \
                 line_items_json = COALESCE(?, line_items_json), \
                 review_version = ? + 1, \
                 updated_at = ? \
             WHERE id = ? AND review_version = ?",
            fields_expr
        );

        let mut query = sqlx::query(&sql);
        for value in binds {
            query = query.bind(value);
        }
        let result = query
            .bind(line_items)
            .bind(expected)
            .bind(now_millis())
            .bind(id.as_str())
            .bind(expected)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        if result.rows_affected() == 0 {
            tracing::debug!(record = %id, expected_version, "version guard did not match");
        }
        Ok(result.rows_affected())
    }
}
