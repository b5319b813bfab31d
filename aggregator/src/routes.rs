//! HTTP surface of the aggregator.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use openvote_core::{BatchState, CommitRecord, CommitRequest, Error, Record};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::archive::ArchiveReader;
use crate::auth_middleware::metrics_auth;
use crate::database::models::BatchSummary;
use crate::ledger::{GatewayError, LatestResponse, Ledger, RootResponse};
use crate::pipeline::reopen_failed;
use crate::state::AppState;
use crate::utils::now_millis;

const DEFAULT_LIST_LIMIT: u32 = 100;
const MAX_LIST_LIMIT: u32 = 1000;

/// Handler error with a JSON `{error}` body.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Unprocessable(String),
    #[error("internal error")]
    Internal,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = GatewayError {
            error: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::IntakeRejected(_) | Error::InvalidDigest(_) => ApiError::BadRequest(e.to_string()),
            Error::NotFound => ApiError::NotFound,
            Error::LedgerRejected(_)
            | Error::InvalidTransition { .. }
            | Error::ArchiveConflict(_)
            | Error::SealNoOp => ApiError::Conflict(e.to_string()),
            Error::QueuePersistFailed(_)
            | Error::LedgerUnreachable(_)
            | Error::ArchiveUnreachable(_)
            | Error::ArchiveWriteFailed { .. } => ApiError::Unavailable(e.to_string()),
            Error::ArchiveCorrupt { .. } => ApiError::Unprocessable(e.to_string()),
            other => {
                warn!("Unhandled error in request: {}", other);
                ApiError::Internal
            }
        }
    }
}

fn internal(e: anyhow::Error) -> ApiError {
    warn!("Database error in request: {:#}", e);
    ApiError::Internal
}

pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/admin/stats", get(admin_stats))
        .route_layer(middleware::from_fn_with_state(state.clone(), metrics_auth));

    let mut app = Router::new()
        .route("/healthz", get(health_check))
        .route("/vote", post(submit_vote))
        .route("/batch/force", post(force_seal))
        .route("/batch/{ledger_batch_id}", get(get_archived_batch))
        .route("/status", get(get_status))
        .route("/batches", get(list_batches))
        .route("/batches/{local_id}", get(get_batch))
        .route("/batches/{local_id}/retry", post(retry_batch))
        .route("/reconciliation", get(get_reconciliation))
        .route("/reconciliation/{ledger_batch_id}", get(get_reconciliation_result))
        .merge(admin);

    if state.dev_ledger.is_some() {
        app = app
            .route("/dev-ledger/commit", post(dev_ledger_commit))
            .route("/dev-ledger/batches/{ledger_batch_id}/root", get(dev_ledger_root))
            .route("/dev-ledger/latest", get(dev_ledger_latest));
    }

    app.with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "aggregator",
        "version": env!("CARGO_PKG_VERSION"),
        "git_hash": env!("AGGREGATOR_BUILD_GIT_HASH"),
        "built_at": env!("AGGREGATOR_BUILD_TIME_UNIX"),
        "ledger": state.ledger.describe(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    /// Base64 of the signed vote payload.
    pub payload: String,
    pub dedup_key: String,
    #[serde(default)]
    pub origin: String,
}

async fn submit_vote(
    State(state): State<AppState>,
    Json(req): Json<VoteRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let payload = STANDARD
        .decode(req.payload.as_bytes())
        .map_err(|e| ApiError::BadRequest(format!("payload is not base64: {}", e)))?;
    let record = Record::new(payload, req.dedup_key, req.origin, now_millis());

    let accepted = state.accumulator.submit(record).await.map_err(|e| {
        info!("POST /vote - rejected: {}", e);
        ApiError::from(e)
    })?;
    let queue_depth = state.accumulator.status().await.map(|s| s.pending).ok();

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "position": accepted.position,
            "open_batch": accepted.open_batch,
            "queue_depth": queue_depth,
        })),
    ))
}

async fn force_seal(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    info!("POST /batch/force - Manual seal requested");
    match state.accumulator.force_seal().await {
        Ok(batch) => Ok(Json(json!({
            "sealed": true,
            "batch": BatchSummary::from(&batch),
        }))),
        Err(Error::SealNoOp) => Ok(Json(json!({
            "sealed": false,
            "reason": Error::SealNoOp.to_string(),
        }))),
        Err(e) => Err(e.into()),
    }
}

async fn get_archived_batch(
    State(state): State<AppState>,
    Path(ledger_batch_id): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    let batch = state
        .archive
        .fetch(ledger_batch_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(json!(batch)))
}

async fn get_status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let open = state.accumulator.status().await?;
    let by_state = state.store.count_by_state().await.map_err(internal)?;
    let count_of = |wanted: BatchState| {
        by_state
            .iter()
            .find(|(s, _)| *s == wanted)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    };
    let batches: serde_json::Map<String, Value> = by_state
        .iter()
        .map(|(s, n)| (s.as_str().to_string(), json!(n)))
        .collect();
    let progress_pct = (open.pending as f64 / open.max_batch_size as f64 * 100.0).min(100.0);
    let reconciliation = state.report.summary();

    Ok(Json(json!({
        "queue_depth": open.pending,
        "open_batch": {
            "local_id": open.local_id,
            "pending": open.pending,
            "max_batch_size": open.max_batch_size,
            "progress_pct": (progress_pct * 100.0).round() / 100.0,
            "opened_at": open.opened_at,
            "seals_in_ms": open.seals_in_ms,
        },
        "batches": batches,
        "failed_batches": count_of(BatchState::Failed),
        "unarchived_batches": count_of(BatchState::Committed),
        "reconciliation": {
            "match": reconciliation.counts.matched,
            "mismatch": reconciliation.counts.mismatched,
            "data_unavailable": reconciliation.counts.unavailable,
            "last_pass_at": reconciliation.last_pass_at,
            "last_error": reconciliation.last_error,
        },
    })))
}

#[derive(Debug, Deserialize)]
pub struct BatchListQuery {
    pub state: Option<String>,
    pub limit: Option<u32>,
}

async fn list_batches(
    State(state): State<AppState>,
    Query(query): Query<BatchListQuery>,
) -> Result<Json<Vec<BatchSummary>>, ApiError> {
    let filter = query
        .state
        .as_deref()
        .map(str::parse::<BatchState>)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let batches = state.store.list(filter, limit).await.map_err(internal)?;
    Ok(Json(batches.iter().map(BatchSummary::from).collect()))
}

async fn get_batch(
    State(state): State<AppState>,
    Path(local_id): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    let batch = state
        .store
        .get(local_id)
        .await
        .map_err(internal)?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(json!(batch)))
}

async fn retry_batch(
    State(state): State<AppState>,
    Path(local_id): Path<u64>,
) -> Result<(StatusCode, Json<BatchSummary>), ApiError> {
    info!("POST /batches/{}/retry - Operator retry requested", local_id);
    let batch = reopen_failed(&state.store, local_id).await?;
    let summary = BatchSummary::from(&batch);
    if state.handoff().send(batch).is_err() {
        // Pipeline gone; the SEALED row is resubmitted on next start
        warn!("Commit pipeline is not running, batch {} stays SEALED", local_id);
    }
    Ok((StatusCode::ACCEPTED, Json(summary)))
}

async fn get_reconciliation(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "summary": state.report.summary(),
        "results": state.report.results(),
    }))
}

async fn get_reconciliation_result(
    State(state): State<AppState>,
    Path(ledger_batch_id): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    let result = state
        .report
        .get(ledger_batch_id)
        .ok_or(ApiError::NotFound)?;
    Ok(Json(json!(result)))
}

async fn admin_stats(State(state): State<AppState>) -> Json<Value> {
    Json(state.metrics.snapshot_as_json(&state.config.db_path))
}

async fn dev_ledger_commit(
    State(state): State<AppState>,
    Json(request): Json<CommitRequest>,
) -> Result<Json<CommitRecord>, ApiError> {
    let ledger = state.dev_ledger.ok_or(ApiError::NotFound)?;
    Ok(Json(ledger.commit(&request).await?))
}

async fn dev_ledger_root(
    State(state): State<AppState>,
    Path(ledger_batch_id): Path<u64>,
) -> Result<Json<RootResponse>, ApiError> {
    let ledger = state.dev_ledger.ok_or(ApiError::NotFound)?;
    let root = ledger
        .committed_root(ledger_batch_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(RootResponse {
        ledger_batch_id,
        root,
    }))
}

async fn dev_ledger_latest(State(state): State<AppState>) -> Result<Json<LatestResponse>, ApiError> {
    let ledger = state.dev_ledger.ok_or(ApiError::NotFound)?;
    Ok(Json(LatestResponse {
        latest_batch_id: ledger.latest_batch_id().await?,
    }))
}
