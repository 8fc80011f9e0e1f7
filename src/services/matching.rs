//! Candidate generation and scoring.

use crate::models::{LogbookEntry, ReconciliationCandidate, Transaction};

// Score weights. User and currency are hard filters in candidate generation,
// so every surviving candidate collects the full 0.3 from those two
// components and the effective discrimination comes from amount and time.
// The four-factor split is kept so the weights stay tunable if the upstream
// filters are ever relaxed.
const AMOUNT_WEIGHT: f64 = 0.4;
const TIME_WEIGHT: f64 = 0.3;
const USER_WEIGHT: f64 = 0.2;
const CURRENCY_WEIGHT: f64 = 0.1;

/// Tunable matching parameters. All reconciliation runs fall back to these
/// defaults unless the caller overrides them per run.
#[derive(Debug, Clone)]
pub struct MatchingConfig {
    pub time_window_minutes: i64,
    pub amount_tolerance_percent: f64,
    pub minimum_match_score: f64,
    pub auto_match_threshold: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            time_window_minutes: 10,
            amount_tolerance_percent: 0.0,
            minimum_match_score: 0.8,
            auto_match_threshold: 0.95,
        }
    }
}

/// Pair settled transactions with unreconciled logbook entries.
///
/// The cross-product is filtered on same user, same currency, time distance
/// within the window and amount distance within the tolerance band. Surviving
/// pairs are scored, and only candidates at or above `minimum_match_score`
/// are returned. O(T x L); datasets are bounded by the date range.
pub fn generate_candidates(
    transactions: &[Transaction],
    entries: &[LogbookEntry],
    config: &MatchingConfig,
) -> Vec<ReconciliationCandidate> {
    let mut candidates = Vec::new();

    for transaction in transactions {
        for entry in entries {
            if entry.user_id != transaction.user_id {
                continue;
            }
            if entry.currency != transaction.currency {
                continue;
            }

            let time_difference_minutes = (transaction.created_utc - entry.created_utc)
                .num_minutes()
                .abs();
            if time_difference_minutes > config.time_window_minutes {
                continue;
            }

            let amount_difference_minor =
                (transaction.amount_minor - entry.amount_minor).abs();
            let tolerance_minor = tolerance_band_minor(
                transaction.amount_minor,
                config.amount_tolerance_percent,
            );
            if amount_difference_minor as f64 > tolerance_minor {
                continue;
            }

            let match_score = score(
                amount_difference_minor,
                tolerance_minor,
                time_difference_minutes,
                config.time_window_minutes,
            );
            if match_score < config.minimum_match_score {
                continue;
            }

            let mut reasons = vec![
                "same user".to_string(),
                format!("same currency ({})", transaction.currency),
                format!("within {} min window", config.time_window_minutes),
            ];
            if amount_difference_minor == 0 {
                reasons.push("exact amount".to_string());
            } else {
                reasons.push(format!(
                    "amount within tolerance ({} minor units off)",
                    amount_difference_minor
                ));
            }

            candidates.push(ReconciliationCandidate {
                transaction_id: transaction.transaction_id,
                logbook_entry_id: entry.entry_id,
                user_id: transaction.user_id,
                transaction_amount_minor: transaction.amount_minor,
                entry_amount_minor: entry.amount_minor,
                currency: transaction.currency.clone(),
                transaction_utc: transaction.created_utc,
                entry_utc: entry.created_utc,
                match_score,
                time_difference_minutes,
                amount_difference_minor,
                reasons,
            });
        }
    }

    candidates
}

fn tolerance_band_minor(transaction_amount_minor: i64, tolerance_percent: f64) -> f64 {
    (tolerance_percent / 100.0) * transaction_amount_minor.abs() as f64
}

fn score(
    amount_difference_minor: i64,
    tolerance_minor: f64,
    time_difference_minutes: i64,
    time_window_minutes: i64,
) -> f64 {
    let amount_component = if amount_difference_minor == 0 {
        1.0
    } else if tolerance_minor > 0.0 {
        // Linear degradation across the tolerance band; anything outside the
        // band was already filtered out.
        (1.0 - amount_difference_minor as f64 / tolerance_minor).max(0.0)
    } else {
        0.0
    };

    let time_component = if time_window_minutes > 0 {
        (1.0 - time_difference_minutes as f64 / time_window_minutes as f64).max(0.0)
    } else {
        0.0
    };

    // Same-user and same-currency are guaranteed by the generator filters.
    let user_component = 1.0;
    let currency_component = 1.0;

    AMOUNT_WEIGHT * amount_component
        + TIME_WEIGHT * time_component
        + USER_WEIGHT * user_component
        + CURRENCY_WEIGHT * currency_component
}
