//! Request and response payloads for the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use validator::Validate;

use crate::services::matching::MatchingConfig;

// ============================================================================
// Reconciliation
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct RunReconciliationRequest {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub user_id: Option<Uuid>,
    pub config: Option<MatchingOverrides>,
    #[validate(length(min = 1, message = "generated_by is required"))]
    pub generated_by: String,
}

/// Per-run overrides; any omitted field falls back to the service default.
#[derive(Debug, Deserialize)]
pub struct MatchingOverrides {
    pub time_window_minutes: Option<i64>,
    pub amount_tolerance_percent: Option<f64>,
    pub minimum_match_score: Option<f64>,
    pub auto_match_threshold: Option<f64>,
}

impl MatchingOverrides {
    pub fn apply(&self, base: &MatchingConfig) -> MatchingConfig {
        MatchingConfig {
            time_window_minutes: self.time_window_minutes.unwrap_or(base.time_window_minutes),
            amount_tolerance_percent: self
                .amount_tolerance_percent
                .unwrap_or(base.amount_tolerance_percent),
            minimum_match_score: self.minimum_match_score.unwrap_or(base.minimum_match_score),
            auto_match_threshold: self
                .auto_match_threshold
                .unwrap_or(base.auto_match_threshold),
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct ManualMatchRequest {
    pub transaction_id: Uuid,
    pub logbook_entry_id: Uuid,
    #[validate(length(min = 1, message = "matched_by is required"))]
    pub matched_by: String,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub user_id: Option<Uuid>,
}

// ============================================================================
// Idempotency
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct IdempotencyCheckRequest {
    #[validate(length(min = 1, message = "idempotency_key is required"))]
    pub idempotency_key: String,
    pub user_id: Uuid,
    #[validate(length(min = 1, message = "request_hash is required"))]
    pub request_hash: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct IdempotencyReserveRequest {
    #[validate(length(min = 1, message = "idempotency_key is required"))]
    pub idempotency_key: String,
    pub user_id: Uuid,
    #[validate(length(min = 1, message = "request_hash is required"))]
    pub request_hash: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct IdempotencyStoreRequest {
    #[validate(length(min = 1, message = "idempotency_key is required"))]
    pub idempotency_key: String,
    pub user_id: Uuid,
    #[validate(length(min = 1, message = "transaction_id is required"))]
    pub transaction_id: String,
    #[validate(length(min = 1, message = "request_hash is required"))]
    pub request_hash: String,
    pub response: Value,
}

#[derive(Debug, Deserialize)]
pub struct IdempotencyRemoveQuery {
    pub idempotency_key: String,
    pub user_id: Uuid,
}

/// Body to hash the way the guard hashes it, for callers that cannot
/// reproduce the normalization themselves.
#[derive(Debug, Deserialize)]
pub struct HashRequest {
    pub body: Value,
}

#[derive(Debug, Serialize)]
pub struct HashResponse {
    pub request_hash: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReservationResponse {
    /// Caller owns the key and should perform the operation.
    Proceed,
    /// An identical request already completed.
    Replay {
        transaction_id: String,
        response: Value,
    },
    /// An identical request is still processing.
    InFlight,
}
