//! Claim-based match resolution.
//!
//! Entities move `Unclaimed -> Claimed(match_id)` during a single greedy
//! pass over the scored candidates; claimed is terminal. This guarantees
//! within a run that no transaction or logbook entry appears in more than
//! one emitted match even when several near-duplicate candidates reference
//! the same entity. Cross-run exclusivity is enforced by the unique
//! constraints in the matches table.

use crate::models::{LogbookEntry, MatchSuggestion, ReconciliationCandidate, Transaction};
use std::collections::HashMap;
use uuid::Uuid;

const MAX_SUGGESTIONS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    Unclaimed,
    Claimed(Uuid),
}

/// Outcome of the greedy resolution pass.
#[derive(Debug)]
pub struct Resolution {
    /// Candidates promoted to automatic matches, with their assigned match id.
    pub automatic: Vec<(Uuid, ReconciliationCandidate)>,
    pub unmatched_transaction_ids: Vec<Uuid>,
    pub unmatched_entry_ids: Vec<Uuid>,
}

/// Resolve candidates into mutually exclusive automatic matches.
///
/// Candidates are ordered by score descending, ties broken by smaller time
/// difference and then by transaction id, so the pass is deterministic and
/// reproducible for identical inputs.
pub fn resolve(
    transactions: &[Transaction],
    entries: &[LogbookEntry],
    candidates: &[ReconciliationCandidate],
    auto_match_threshold: f64,
) -> Resolution {
    let mut ordered: Vec<&ReconciliationCandidate> = candidates.iter().collect();
    ordered.sort_by(|a, b| {
        b.match_score
            .total_cmp(&a.match_score)
            .then_with(|| a.time_difference_minutes.cmp(&b.time_difference_minutes))
            .then_with(|| a.transaction_id.cmp(&b.transaction_id))
            .then_with(|| a.logbook_entry_id.cmp(&b.logbook_entry_id))
    });

    let mut transaction_claims: HashMap<Uuid, ClaimState> = transactions
        .iter()
        .map(|t| (t.transaction_id, ClaimState::Unclaimed))
        .collect();
    let mut entry_claims: HashMap<Uuid, ClaimState> = entries
        .iter()
        .map(|e| (e.entry_id, ClaimState::Unclaimed))
        .collect();

    let mut automatic = Vec::new();

    for candidate in ordered {
        if candidate.match_score < auto_match_threshold {
            // Ordered by score, so nothing further qualifies.
            break;
        }
        let transaction_free = matches!(
            transaction_claims.get(&candidate.transaction_id),
            Some(ClaimState::Unclaimed)
        );
        let entry_free = matches!(
            entry_claims.get(&candidate.logbook_entry_id),
            Some(ClaimState::Unclaimed)
        );
        if !transaction_free || !entry_free {
            continue;
        }

        let match_id = Uuid::new_v4();
        transaction_claims.insert(candidate.transaction_id, ClaimState::Claimed(match_id));
        entry_claims.insert(candidate.logbook_entry_id, ClaimState::Claimed(match_id));
        automatic.push((match_id, candidate.clone()));
    }

    let unmatched_transaction_ids = transactions
        .iter()
        .map(|t| t.transaction_id)
        .filter(|id| matches!(transaction_claims.get(id), Some(ClaimState::Unclaimed)))
        .collect();
    let unmatched_entry_ids = entries
        .iter()
        .map(|e| e.entry_id)
        .filter(|id| matches!(entry_claims.get(id), Some(ClaimState::Unclaimed)))
        .collect();

    Resolution {
        automatic,
        unmatched_transaction_ids,
        unmatched_entry_ids,
    }
}

/// Highest-scoring surviving candidates referencing an unmatched transaction.
pub fn suggestions_for_transaction(
    candidates: &[ReconciliationCandidate],
    transaction_id: Uuid,
) -> Vec<MatchSuggestion> {
    top_suggestions(candidates, |c| c.transaction_id == transaction_id)
}

/// Highest-scoring surviving candidates referencing an unmatched entry.
pub fn suggestions_for_entry(
    candidates: &[ReconciliationCandidate],
    entry_id: Uuid,
) -> Vec<MatchSuggestion> {
    top_suggestions(candidates, |c| c.logbook_entry_id == entry_id)
}

fn top_suggestions<F>(
    candidates: &[ReconciliationCandidate],
    predicate: F,
) -> Vec<MatchSuggestion>
where
    F: Fn(&ReconciliationCandidate) -> bool,
{
    let mut relevant: Vec<&ReconciliationCandidate> =
        candidates.iter().filter(|c| predicate(c)).collect();
    relevant.sort_by(|a, b| {
        b.match_score
            .total_cmp(&a.match_score)
            .then_with(|| a.time_difference_minutes.cmp(&b.time_difference_minutes))
    });
    relevant
        .into_iter()
        .take(MAX_SUGGESTIONS)
        .map(|c| MatchSuggestion {
            transaction_id: c.transaction_id,
            logbook_entry_id: c.logbook_entry_id,
            match_score: c.match_score,
            time_difference_minutes: c.time_difference_minutes,
            amount_difference_minor: c.amount_difference_minor,
        })
        .collect()
}
