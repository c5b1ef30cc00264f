//! Review HTTP API.
//!
//! A thin axum layer over the [`ReviewGateway`]. Handlers never read a
//! record and write it back; every mutation is one guarded store call.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`   | `/health` | Health check (returns version) |
//! | `GET`   | `/records/{id}` | Fetch the authoritative record |
//! | `POST`  | `/records/{id}/claim` | PENDING → PROCESSING |
//! | `POST`  | `/records/{id}/transition` | `{from: [..], to}` |
//! | `PATCH` | `/records/{id}/fields` | `{expected_version, fields, line_items?}` |
//! | `GET`   | `/records/{id}/consistency` | Aggregation consistency report |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "version_conflict", "message": "...", "current_version": 3 } }
//! ```
//!
//! Error codes: `bad_request` (400), `illegal_transition` (400), `not_found` (404),
//! `version_conflict` (409), `state_conflict` (409), `internal` (500).
//!
//! Conflict bodies also carry `current_version` and `current_state` so the
//! client can reload and retry without losing its edit.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use extraction_guard_core::consistency::{check_record, ConsistencyReport};
use extraction_guard_core::models::{ExtractionRecord, LineItem, ProcessingState, RecordId};
use extraction_guard_core::store::{require_record, RecordStore, StoreError};

use crate::config::Config;
use crate::db;
use crate::gateway::{human_patch, Conflict, GatewayError, PatchApplied, ReviewGateway};
use crate::sqlite_store::SqliteRecordStore;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    gateway: ReviewGateway,
    tolerance: f64,
}

impl AppState {
    pub fn new(store: Arc<dyn RecordStore>, tolerance: f64) -> Self {
        Self {
            gateway: ReviewGateway::new(store),
            tolerance,
        }
    }
}

/// Build the router without binding, so tests can serve it on their own
/// listener.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/records/{id}", get(handle_get_record))
        .route("/records/{id}/claim", post(handle_claim))
        .route("/records/{id}/transition", post(handle_transition))
        .route("/records/{id}/fields", patch(handle_patch_fields))
        .route("/records/{id}/consistency", get(handle_consistency))
        .layer(cors)
        .with_state(state)
}

/// Start the review API on `[server].bind` against the configured database.
///
/// Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let store: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::new(pool));
    let app = router(AppState::new(store, config.consistency.tolerance));

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "review API listening");
    println!("Review API listening on http://{}", config.server.bind);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_state: Option<ProcessingState>,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    conflict: Option<Conflict>,
}

impl AppError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
            conflict: None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                current_version: self.conflict.as_ref().map(|c| c.current_version),
                current_state: self.conflict.as_ref().map(|c| c.current_state),
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(id: &RecordId) -> AppError {
    AppError::new(
        StatusCode::NOT_FOUND,
        "not_found",
        format!("record not found: {}", id),
    )
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => not_found(&id),
            StoreError::IllegalTransition { .. } => {
                AppError::new(StatusCode::BAD_REQUEST, "illegal_transition", e.to_string())
            }
            other => {
                tracing::error!(error = %other, "store failure");
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", other.to_string())
            }
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Conflict(conflict) => AppError {
                status: StatusCode::CONFLICT,
                code: conflict.code.as_str().to_string(),
                message: conflict.message.clone(),
                conflict: Some(conflict),
            },
            GatewayError::NotFound(id) => not_found(&id),
            GatewayError::Invalid(v) => bad_request(v.to_string()),
            GatewayError::Store(s) => s.into(),
        }
    }
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    body.map(|Json(v)| v)
        .map_err(|rejection| bad_request(rejection.body_text()))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /records/{id} ============

async fn handle_get_record(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExtractionRecord>, AppError> {
    let id = RecordId::from(id);
    let record = require_record(state.gateway.store().as_ref(), &id).await?;
    Ok(Json(record))
}

// ============ POST /records/{id}/claim ============

async fn handle_claim(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let id = RecordId::from(id);
    state.gateway.claim(&id).await?;
    Ok(Json(serde_json::json!({ "claimed": true, "id": id })))
}

// ============ POST /records/{id}/transition ============

#[derive(Deserialize)]
struct TransitionRequest {
    from: BTreeSet<ProcessingState>,
    to: ProcessingState,
}

async fn handle_transition(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<TransitionRequest>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let id = RecordId::from(id);
    let request = json_body(body)?;
    if request.from.is_empty() {
        return Err(bad_request("from must not be empty"));
    }
    state.gateway.transition(&id, &request.from, request.to).await?;
    Ok(Json(serde_json::json!({ "id": id, "processing_state": request.to })))
}

// ============ PATCH /records/{id}/fields ============

#[derive(Deserialize)]
struct PatchRequest {
    expected_version: u64,
    #[serde(default)]
    fields: Map<String, Value>,
    #[serde(default)]
    line_items: Option<Vec<LineItem>>,
}

async fn handle_patch_fields(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<PatchRequest>, JsonRejection>,
) -> Result<Json<PatchApplied>, AppError> {
    let id = RecordId::from(id);
    let request = json_body(body)?;
    let patch = human_patch(&request.fields, request.line_items)
        .map_err(|e| bad_request(e.to_string()))?;
    let applied = state
        .gateway
        .apply_patch(&id, request.expected_version, patch)
        .await?;
    Ok(Json(applied))
}

// ============ GET /records/{id}/consistency ============

async fn handle_consistency(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConsistencyReport>, AppError> {
    let id = RecordId::from(id);
    let record = require_record(state.gateway.store().as_ref(), &id).await?;
    Ok(Json(check_record(&record, state.tolerance)))
}
