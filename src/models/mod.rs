//! Domain models for payment reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ============================================================================
// Transaction Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// A recorded payment transaction. Owned by the transaction store;
/// read-only to this core.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Transaction {
    pub transaction_id: Uuid,
    pub user_id: Uuid,
    pub amount_minor: i64,
    pub currency: String,
    pub reference: Option<String>,
    pub status: String,
    pub created_utc: DateTime<Utc>,
}

// ============================================================================
// Logbook Models
// ============================================================================

/// An expense entry logged independently of the payment flow, often created
/// offline and synced later. The resolver flips `is_reconciled` and sets the
/// transaction link on a successful match; nothing else mutates it here.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LogbookEntry {
    pub entry_id: Uuid,
    pub user_id: Uuid,
    pub entry_type: String,
    pub amount_minor: i64,
    pub currency: String,
    pub note: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub is_reconciled: bool,
    pub reconciled_transaction_id: Option<Uuid>,
}

// ============================================================================
// Candidate Models
// ============================================================================

/// A scored transaction/entry pairing. Ephemeral: exists only during a run,
/// never persisted.
#[derive(Debug, Clone)]
pub struct ReconciliationCandidate {
    pub transaction_id: Uuid,
    pub logbook_entry_id: Uuid,
    pub user_id: Uuid,
    pub transaction_amount_minor: i64,
    pub entry_amount_minor: i64,
    pub currency: String,
    pub transaction_utc: DateTime<Utc>,
    pub entry_utc: DateTime<Utc>,
    pub match_score: f64,
    pub time_difference_minutes: i64,
    pub amount_difference_minor: i64,
    pub reasons: Vec<String>,
}

// ============================================================================
// Match Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Automatic,
    Manual,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "manual" => Self::Manual,
            _ => Self::Automatic,
        }
    }
}

/// Which of the matching conditions held for a persisted match.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MatchCriteria {
    pub amount_match: bool,
    pub time_match: bool,
    pub currency_match: bool,
    pub user_match: bool,
}

/// Draft of a match handed to the match store for insertion.
#[derive(Debug, Clone)]
pub struct NewMatch {
    pub match_id: Uuid,
    pub logbook_entry_id: Uuid,
    pub transaction_id: Uuid,
    pub user_id: Uuid,
    pub match_score: f64,
    pub match_type: MatchType,
    pub criteria: MatchCriteria,
    pub time_difference_minutes: i64,
    pub amount_difference_minor: i64,
    pub matched_by: Option<String>,
}

/// A persisted reconciliation match. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReconciliationMatch {
    pub match_id: Uuid,
    pub logbook_entry_id: Uuid,
    pub transaction_id: Uuid,
    pub user_id: Uuid,
    pub match_score: f64,
    pub match_type: String,
    pub amount_match: bool,
    pub time_match: bool,
    pub currency_match: bool,
    pub user_match: bool,
    pub time_difference_minutes: i64,
    pub amount_difference_minor: i64,
    pub matched_utc: DateTime<Utc>,
    pub matched_by: Option<String>,
}

impl ReconciliationMatch {
    pub fn criteria(&self) -> MatchCriteria {
        MatchCriteria {
            amount_match: self.amount_match,
            time_match: self.time_match,
            currency_match: self.currency_match,
            user_match: self.user_match,
        }
    }
}

// ============================================================================
// Report Models
// ============================================================================

/// A candidate pairing surfaced for manual review of an unmatched entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchSuggestion {
    pub transaction_id: Uuid,
    pub logbook_entry_id: Uuid,
    pub match_score: f64,
    pub time_difference_minutes: i64,
    pub amount_difference_minor: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnmatchedTransaction {
    pub transaction: Transaction,
    pub possible_matches: Vec<MatchSuggestion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnmatchedLogbookEntry {
    pub entry: LogbookEntry,
    pub possible_matches: Vec<MatchSuggestion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total_transactions: i64,
    pub total_logbook_entries: i64,
    pub automatic_matches: i64,
    pub unmatched_transactions: i64,
    pub unmatched_logbook_entries: i64,
    /// automatic matches / total transactions, as a percentage.
    pub match_rate: f64,
}

/// Outcome of one reconciliation run. Created once per run, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub report_id: Uuid,
    pub report_date: DateTime<Utc>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub user_id: Option<Uuid>,
    pub summary: ReportSummary,
    pub matches: Vec<ReconciliationMatch>,
    pub unmatched_transactions: Vec<UnmatchedTransaction>,
    pub unmatched_logbook_entries: Vec<UnmatchedLogbookEntry>,
    pub generated_utc: DateTime<Utc>,
    pub generated_by: String,
    pub correlation_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchMetrics {
    pub match_rate: f64,
    pub average_match_score: f64,
    pub average_time_difference_minutes: f64,
    pub total_matches: i64,
    pub automatic_matches: i64,
    pub manual_matches: i64,
}

// ============================================================================
// Idempotency Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyState {
    InFlight,
    Completed,
}

/// Record stored in the TTL store per (userId, idempotencyKey). Written as
/// in-flight by the atomic reservation and overwritten once the guarded
/// operation completes; never updated after that.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub state: IdempotencyState,
    pub request_hash: String,
    pub transaction_id: Option<String>,
    pub response: Option<serde_json::Value>,
    pub created_utc: DateTime<Utc>,
}
