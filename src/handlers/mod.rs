//! HTTP handlers for the reconciliation and idempotency surfaces.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;
use validator::Validate;

use crate::{
    dtos::{
        HashRequest, HashResponse, IdempotencyCheckRequest, IdempotencyRemoveQuery,
        IdempotencyReserveRequest, IdempotencyStoreRequest, ManualMatchRequest, MetricsQuery,
        ReservationResponse, RunReconciliationRequest,
    },
    error::AppError,
    models::{MatchMetrics, ReconciliationMatch, ReconciliationReport},
    services::idempotency::ReservationOutcome,
    startup::AppState,
};

/// Run reconciliation over a date range and return the full report.
pub async fn run_reconciliation(
    State(state): State<AppState>,
    Json(payload): Json<RunReconciliationRequest>,
) -> Result<(StatusCode, Json<ReconciliationReport>), AppError> {
    payload.validate()?;

    let overrides = payload
        .config
        .as_ref()
        .map(|c| c.apply(state.matching_defaults()));

    let report = state
        .services
        .run_reconciliation(
            payload.period_start,
            payload.period_end,
            payload.user_id,
            overrides,
            &payload.generated_by,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(report)))
}

/// Fetch a previously generated report.
pub async fn get_report(
    State(state): State<AppState>,
    Path(report_id): Path<Uuid>,
) -> Result<Json<ReconciliationReport>, AppError> {
    let report = state.services.get_report(report_id).await?;
    Ok(Json(report))
}

/// Persist an operator-confirmed match.
pub async fn create_manual_match(
    State(state): State<AppState>,
    Json(payload): Json<ManualMatchRequest>,
) -> Result<(StatusCode, Json<ReconciliationMatch>), AppError> {
    payload.validate()?;

    let created = state
        .services
        .create_manual_match(
            payload.transaction_id,
            payload.logbook_entry_id,
            &payload.matched_by,
            payload.notes.as_deref(),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(created)))
}

/// Aggregate match-quality metrics for a date range.
pub async fn get_match_metrics(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<MatchMetrics>, AppError> {
    let metrics = state
        .services
        .get_metrics(query.period_start, query.period_end, query.user_id)
        .await?;
    Ok(Json(metrics))
}

// ============================================================================
// Idempotency
// ============================================================================

/// Look up the record for (user, key). Returns the cached response for a
/// completed identical request, null for a new one.
pub async fn check_idempotency(
    State(state): State<AppState>,
    Json(payload): Json<IdempotencyCheckRequest>,
) -> Result<Json<Value>, AppError> {
    payload.validate()?;

    let cached = state
        .guard
        .check(&payload.idempotency_key, payload.user_id, &payload.request_hash)
        .await?;

    match cached {
        Some(cached) => Ok(Json(json!({
            "transaction_id": cached.transaction_id,
            "response": cached.response,
        }))),
        None => Ok(Json(Value::Null)),
    }
}

/// Atomically claim (user, key) before a payment-creating operation.
pub async fn reserve_idempotency(
    State(state): State<AppState>,
    Json(payload): Json<IdempotencyReserveRequest>,
) -> Result<Json<ReservationResponse>, AppError> {
    payload.validate()?;

    let outcome = state
        .guard
        .reserve(&payload.idempotency_key, payload.user_id, &payload.request_hash)
        .await?;

    let response = match outcome {
        ReservationOutcome::Proceed => ReservationResponse::Proceed,
        ReservationOutcome::Replay(cached) => ReservationResponse::Replay {
            transaction_id: cached.transaction_id,
            response: cached.response,
        },
        ReservationOutcome::InFlight => ReservationResponse::InFlight,
    };

    Ok(Json(response))
}

/// Store the final record once the guarded operation has completed.
pub async fn store_idempotency(
    State(state): State<AppState>,
    Json(payload): Json<IdempotencyStoreRequest>,
) -> Result<StatusCode, AppError> {
    payload.validate()?;

    state
        .guard
        .store_record(
            &payload.idempotency_key,
            payload.user_id,
            &payload.transaction_id,
            &payload.request_hash,
            payload.response,
        )
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// Drop a reservation after a failed operation so a retry is treated as new.
pub async fn remove_idempotency(
    State(state): State<AppState>,
    Query(query): Query<IdempotencyRemoveQuery>,
) -> Result<StatusCode, AppError> {
    state
        .guard
        .remove_record(&query.idempotency_key, query.user_id)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// Hash a request body the way the guard does.
pub async fn hash_request(
    Json(payload): Json<HashRequest>,
) -> Result<Json<HashResponse>, AppError> {
    Ok(Json(HashResponse {
        request_hash: crate::services::IdempotencyGuard::generate_request_hash(&payload.body),
    }))
}
