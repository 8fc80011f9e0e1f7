//! Idempotency guard for payment-creating requests.
//!
//! Retries of a keyed request replay the stored response instead of creating
//! a second financial transaction. The reservation is a single atomic
//! set-if-absent against the TTL store, which closes the check-then-act race
//! between identical concurrent requests. If the TTL store is unreachable
//! the guard fails open: the request proceeds unguarded, and the failure is
//! surfaced through logs and metrics only.

use crate::error::AppError;
use crate::models::{IdempotencyRecord, IdempotencyState};
use crate::services::metrics::{record_idempotency, record_idempotency_store_failure};
use crate::services::redis::TtlStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

pub const DEFAULT_TTL_SECONDS: u64 = 900;

// A lost claim followed by an empty read means the record vanished between
// the two calls (expired or rolled back); re-attempt the claim this many
// times before giving up.
const RESERVE_ATTEMPTS: usize = 3;

/// Cached outcome of a previously completed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    pub transaction_id: String,
    pub response: Value,
}

/// Outcome of the atomic reservation attempt.
#[derive(Debug)]
pub enum ReservationOutcome {
    /// This caller owns the key (or the store was unreachable); proceed with
    /// the guarded operation.
    Proceed,
    /// An identical request already completed; return its response.
    Replay(CachedResponse),
    /// An identical request is still being processed; retry shortly.
    InFlight,
}

pub struct IdempotencyGuard {
    store: Arc<dyn TtlStore>,
    ttl_seconds: u64,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn TtlStore>, ttl_seconds: u64) -> Self {
        Self { store, ttl_seconds }
    }

    fn record_key(user_id: Uuid, idempotency_key: &str) -> String {
        format!("idempotency:{}:{}", user_id, idempotency_key)
    }

    /// Stable hash over the request body. Object keys are sorted recursively
    /// before hashing, so semantically identical payloads hash identically
    /// regardless of field order.
    pub fn generate_request_hash(body: &Value) -> String {
        let normalized = normalize(body);
        let serialized =
            serde_json::to_vec(&normalized).unwrap_or_else(|_| normalized.to_string().into_bytes());
        let mut hasher = Sha256::new();
        hasher.update(&serialized);
        hex::encode(hasher.finalize())
    }

    /// Look up the stored record for (userId, key).
    ///
    /// Returns None for a new request, the cached response for a completed
    /// identical request, `Conflict` when the key was reused with a
    /// different body and `InFlight` while the first request is still
    /// processing.
    pub async fn check(
        &self,
        idempotency_key: &str,
        user_id: Uuid,
        request_hash: &str,
    ) -> Result<Option<CachedResponse>, AppError> {
        let key = Self::record_key(user_id, idempotency_key);
        let raw = match self.store.get(&key).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, idempotency_key, "TTL store unavailable during check, failing open");
                record_idempotency_store_failure("check");
                return Ok(None);
            }
        };

        let Some(raw) = raw else {
            record_idempotency("check", "miss");
            return Ok(None);
        };

        let record: IdempotencyRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(error = %e, idempotency_key, "Corrupt idempotency record, treating as absent");
                record_idempotency_store_failure("check");
                return Ok(None);
            }
        };

        if record.request_hash != request_hash {
            record_idempotency("check", "conflict");
            return Err(AppError::Conflict(anyhow::anyhow!(
                "idempotency key reused with different request body"
            )));
        }

        match record.state {
            IdempotencyState::Completed => {
                record_idempotency("check", "replay");
                Ok(Some(CachedResponse {
                    transaction_id: record.transaction_id.unwrap_or_default(),
                    response: record.response.unwrap_or(Value::Null),
                }))
            }
            IdempotencyState::InFlight => {
                record_idempotency("check", "in_flight");
                Err(AppError::InFlight(
                    "identical request is being processed, retry shortly".to_string(),
                ))
            }
        }
    }

    /// Atomically claim (userId, key) before processing a payment-creating
    /// request. Only the winner proceeds; losers get the cached response,
    /// an in-flight signal, or a conflict.
    pub async fn reserve(
        &self,
        idempotency_key: &str,
        user_id: Uuid,
        request_hash: &str,
    ) -> Result<ReservationOutcome, AppError> {
        let key = Self::record_key(user_id, idempotency_key);
        let reservation = IdempotencyRecord {
            state: IdempotencyState::InFlight,
            request_hash: request_hash.to_string(),
            transaction_id: None,
            response: None,
            created_utc: Utc::now(),
        };
        let payload = serde_json::to_string(&reservation)
            .map_err(|e| AppError::InternalError(anyhow::Error::new(e)))?;

        for _ in 0..RESERVE_ATTEMPTS {
            let claimed = match self.store.set_if_absent(&key, &payload, self.ttl_seconds).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    tracing::warn!(error = %e, idempotency_key, "TTL store unavailable during reserve, failing open");
                    record_idempotency_store_failure("reserve");
                    return Ok(ReservationOutcome::Proceed);
                }
            };

            if claimed {
                record_idempotency("reserve", "claimed");
                return Ok(ReservationOutcome::Proceed);
            }

            // Lost the race (or the key was claimed earlier); inspect the
            // existing record to decide between replay, in-flight and
            // conflict.
            match self.check(idempotency_key, user_id, request_hash).await {
                Ok(Some(cached)) => {
                    record_idempotency("reserve", "replay");
                    return Ok(ReservationOutcome::Replay(cached));
                }
                // The record vanished between the failed claim and the
                // read. Proceeding here would leave the key unclaimed, so
                // go back and contend for it atomically; only one of the
                // concurrent losers can win the re-claim.
                Ok(None) => continue,
                Err(AppError::InFlight(_)) => {
                    record_idempotency("reserve", "in_flight");
                    return Ok(ReservationOutcome::InFlight);
                }
                Err(e) => return Err(e),
            }
        }

        // The record kept disappearing before the claim landed. Do not let
        // the caller proceed without a reservation; tell it to retry.
        tracing::warn!(idempotency_key, "Reservation contention exhausted retries");
        record_idempotency("reserve", "in_flight");
        Ok(ReservationOutcome::InFlight)
    }

    /// Persist the final record once the guarded operation has completed
    /// successfully, overwriting the in-flight reservation.
    pub async fn store_record(
        &self,
        idempotency_key: &str,
        user_id: Uuid,
        transaction_id: &str,
        request_hash: &str,
        response: Value,
    ) -> Result<(), AppError> {
        let key = Self::record_key(user_id, idempotency_key);
        let record = IdempotencyRecord {
            state: IdempotencyState::Completed,
            request_hash: request_hash.to_string(),
            transaction_id: Some(transaction_id.to_string()),
            response: Some(response),
            created_utc: Utc::now(),
        };
        let payload = serde_json::to_string(&record)
            .map_err(|e| AppError::InternalError(anyhow::Error::new(e)))?;

        if let Err(e) = self.store.set_with_ttl(&key, &payload, self.ttl_seconds).await {
            tracing::warn!(error = %e, idempotency_key, "Failed to store idempotency record, failing open");
            record_idempotency_store_failure("store");
        } else {
            record_idempotency("store", "stored");
        }
        Ok(())
    }

    /// Rollback hook for failed operations: drop the reservation so a retry
    /// with the same key is treated as new.
    pub async fn remove_record(
        &self,
        idempotency_key: &str,
        user_id: Uuid,
    ) -> Result<(), AppError> {
        let key = Self::record_key(user_id, idempotency_key);
        if let Err(e) = self.store.delete(&key).await {
            tracing::warn!(error = %e, idempotency_key, "Failed to remove idempotency record");
            record_idempotency_store_failure("remove");
        } else {
            record_idempotency("remove", "removed");
        }
        Ok(())
    }
}

/// Rebuild the value with object keys in sorted order, recursively.
fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), normalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}
