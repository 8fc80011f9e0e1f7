//! Reconciliation orchestration.
//!
//! One run is a pure pipeline over a snapshot of the two datasets: fetch,
//! generate candidates, resolve claims, then persist the surviving automatic
//! matches and the report. Cross-run exclusivity is delegated to the match
//! store's uniqueness guarantees; a `Conflict` on persist means another run
//! matched the entity first, and the pair is dropped from this run's report.

use crate::error::AppError;
use crate::models::{
    MatchCriteria, MatchMetrics, MatchType, NewMatch, ReconciliationMatch, ReconciliationReport,
    ReportSummary, UnmatchedLogbookEntry, UnmatchedTransaction,
};
use crate::services::database::MatchStore;
use crate::services::matching::{generate_candidates, MatchingConfig};
use crate::services::metrics::{record_match, record_run};
use crate::services::resolver::{
    resolve, suggestions_for_entry, suggestions_for_transaction,
};
use crate::services::stores::{LogbookStore, TransactionStore};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub struct ReconciliationService {
    transactions: Arc<dyn TransactionStore>,
    logbook: Arc<dyn LogbookStore>,
    matches: Arc<dyn MatchStore>,
    config: MatchingConfig,
}

impl ReconciliationService {
    pub fn new(
        transactions: Arc<dyn TransactionStore>,
        logbook: Arc<dyn LogbookStore>,
        matches: Arc<dyn MatchStore>,
        config: MatchingConfig,
    ) -> Self {
        Self {
            transactions,
            logbook,
            matches,
            config,
        }
    }

    /// Run reconciliation over `[period_start, period_end]`, optionally
    /// scoped to one user and with per-run config overrides.
    #[instrument(skip(self, overrides), fields(user_id = ?user_id, generated_by = %generated_by))]
    pub async fn run_reconciliation(
        &self,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        user_id: Option<Uuid>,
        overrides: Option<MatchingConfig>,
        generated_by: &str,
    ) -> Result<ReconciliationReport, AppError> {
        if period_end < period_start {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "period_end must not precede period_start"
            )));
        }

        let config = overrides.unwrap_or_else(|| self.config.clone());
        let correlation_id = Uuid::new_v4();

        info!(
            correlation_id = %correlation_id,
            period_start = %period_start,
            period_end = %period_end,
            "Starting reconciliation run"
        );

        let transactions = self
            .transactions
            .list_settled(user_id, period_start, period_end)
            .await?;
        let entries = self
            .logbook
            .list_unreconciled(user_id, period_start, period_end)
            .await?;

        info!(
            correlation_id = %correlation_id,
            transactions = transactions.len(),
            logbook_entries = entries.len(),
            "Datasets loaded"
        );

        let candidates = generate_candidates(&transactions, &entries, &config);
        let resolution = resolve(
            &transactions,
            &entries,
            &candidates,
            config.auto_match_threshold,
        );

        let mut persisted: Vec<ReconciliationMatch> = Vec::new();
        // Entities whose persist lost a cross-run race. Excluded from both
        // the matched and unmatched sections of the report; the other run
        // owns them now.
        let mut raced_transactions: HashSet<Uuid> = HashSet::new();
        let mut raced_entries: HashSet<Uuid> = HashSet::new();

        for (match_id, candidate) in &resolution.automatic {
            let new_match = NewMatch {
                match_id: *match_id,
                logbook_entry_id: candidate.logbook_entry_id,
                transaction_id: candidate.transaction_id,
                user_id: candidate.user_id,
                match_score: candidate.match_score,
                match_type: MatchType::Automatic,
                criteria: MatchCriteria {
                    amount_match: candidate.amount_difference_minor == 0,
                    time_match: true,
                    currency_match: true,
                    user_match: true,
                },
                time_difference_minutes: candidate.time_difference_minutes,
                amount_difference_minor: candidate.amount_difference_minor,
                matched_by: None,
            };

            match self.matches.insert_match(&new_match).await {
                Ok(inserted) => {
                    self.logbook
                        .mark_reconciled(candidate.logbook_entry_id, candidate.transaction_id)
                        .await?;
                    record_match(MatchType::Automatic.as_str());
                    persisted.push(inserted);
                }
                Err(AppError::Conflict(_)) => {
                    warn!(
                        correlation_id = %correlation_id,
                        transaction_id = %candidate.transaction_id,
                        logbook_entry_id = %candidate.logbook_entry_id,
                        "Entity matched by a concurrent run, skipping pair"
                    );
                    raced_transactions.insert(candidate.transaction_id);
                    raced_entries.insert(candidate.logbook_entry_id);
                }
                Err(e) => return Err(e),
            }
        }

        let unmatched_transactions: Vec<UnmatchedTransaction> = transactions
            .iter()
            .filter(|t| {
                resolution
                    .unmatched_transaction_ids
                    .contains(&t.transaction_id)
                    && !raced_transactions.contains(&t.transaction_id)
            })
            .map(|t| UnmatchedTransaction {
                transaction: t.clone(),
                possible_matches: suggestions_for_transaction(&candidates, t.transaction_id),
            })
            .collect();

        let unmatched_entries: Vec<UnmatchedLogbookEntry> = entries
            .iter()
            .filter(|e| {
                resolution.unmatched_entry_ids.contains(&e.entry_id)
                    && !raced_entries.contains(&e.entry_id)
            })
            .map(|e| UnmatchedLogbookEntry {
                entry: e.clone(),
                possible_matches: suggestions_for_entry(&candidates, e.entry_id),
            })
            .collect();

        let total_transactions = transactions.len() as i64;
        let automatic_matches = persisted.len() as i64;
        let match_rate = if total_transactions > 0 {
            automatic_matches as f64 / total_transactions as f64 * 100.0
        } else {
            0.0
        };

        let now = Utc::now();
        let report = ReconciliationReport {
            report_id: Uuid::new_v4(),
            report_date: now,
            period_start,
            period_end,
            user_id,
            summary: ReportSummary {
                total_transactions,
                total_logbook_entries: entries.len() as i64,
                automatic_matches,
                unmatched_transactions: unmatched_transactions.len() as i64,
                unmatched_logbook_entries: unmatched_entries.len() as i64,
                match_rate,
            },
            matches: persisted,
            unmatched_transactions,
            unmatched_logbook_entries: unmatched_entries,
            generated_utc: now,
            generated_by: generated_by.to_string(),
            correlation_id,
        };

        self.matches.insert_report(&report).await?;
        record_run("success");

        info!(
            correlation_id = %correlation_id,
            report_id = %report.report_id,
            automatic_matches = report.summary.automatic_matches,
            match_rate = report.summary.match_rate,
            "Reconciliation run completed"
        );

        Ok(report)
    }

    /// Persist an operator-confirmed match between a transaction and a
    /// logbook entry. No score threshold applies; the operator's judgment is
    /// authoritative and the match is recorded with score 1.0. The criteria
    /// booleans still reflect the actual comparisons, so a cross-currency
    /// manual match is auditable as such.
    #[instrument(skip(self), fields(transaction_id = %transaction_id, logbook_entry_id = %logbook_entry_id, matched_by = %matched_by))]
    pub async fn create_manual_match(
        &self,
        transaction_id: Uuid,
        logbook_entry_id: Uuid,
        matched_by: &str,
        notes: Option<&str>,
    ) -> Result<ReconciliationMatch, AppError> {
        let transaction = self
            .transactions
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Transaction not found")))?;
        let entry = self
            .logbook
            .get_entry(logbook_entry_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Logbook entry not found")))?;

        if let Some(existing) = self.matches.find_match_for_transaction(transaction_id).await? {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "transaction already matched (match {})",
                existing.match_id
            )));
        }
        if let Some(existing) = self.matches.find_match_for_entry(logbook_entry_id).await? {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "logbook entry already matched (match {})",
                existing.match_id
            )));
        }

        let time_difference_minutes = (transaction.created_utc - entry.created_utc)
            .num_minutes()
            .abs();
        let amount_difference_minor = (transaction.amount_minor - entry.amount_minor).abs();

        let new_match = NewMatch {
            match_id: Uuid::new_v4(),
            logbook_entry_id,
            transaction_id,
            user_id: transaction.user_id,
            match_score: 1.0,
            match_type: MatchType::Manual,
            criteria: MatchCriteria {
                amount_match: amount_difference_minor == 0,
                time_match: time_difference_minutes <= self.config.time_window_minutes,
                currency_match: transaction.currency == entry.currency,
                user_match: transaction.user_id == entry.user_id,
            },
            time_difference_minutes,
            amount_difference_minor,
            matched_by: Some(matched_by.to_string()),
        };

        // Two find_match checks then insert is still racy across processes;
        // the store's uniqueness constraints are the real arbiter.
        let inserted = self.matches.insert_match(&new_match).await?;
        self.logbook
            .mark_reconciled(logbook_entry_id, transaction_id)
            .await?;
        record_match(MatchType::Manual.as_str());

        if let Some(notes) = notes {
            info!(match_id = %inserted.match_id, notes = %notes, "Manual match notes");
        }
        info!(match_id = %inserted.match_id, "Manual match created");

        Ok(inserted)
    }

    pub async fn get_report(
        &self,
        report_id: Uuid,
    ) -> Result<ReconciliationReport, AppError> {
        self.matches
            .get_report(report_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Report not found")))
    }

    /// Aggregate match-quality metrics over a date range.
    #[instrument(skip(self))]
    pub async fn get_metrics(
        &self,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        user_id: Option<Uuid>,
    ) -> Result<MatchMetrics, AppError> {
        if period_end < period_start {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "period_end must not precede period_start"
            )));
        }

        let aggregates = self
            .matches
            .aggregate_matches(period_start, period_end, user_id)
            .await?;
        let total_transactions = self
            .transactions
            .list_settled(user_id, period_start, period_end)
            .await?
            .len() as i64;

        let match_rate = if total_transactions > 0 {
            aggregates.total_matches as f64 / total_transactions as f64 * 100.0
        } else {
            0.0
        };

        Ok(MatchMetrics {
            match_rate,
            average_match_score: aggregates.average_match_score,
            average_time_difference_minutes: aggregates.average_time_difference_minutes,
            total_matches: aggregates.total_matches,
            automatic_matches: aggregates.automatic_matches,
            manual_matches: aggregates.manual_matches,
        })
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        self.matches.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LogbookEntry, Transaction};
    use crate::services::database::InMemoryMatchStore;
    use crate::services::stores::{InMemoryLogbookStore, InMemoryTransactionStore};
    use chrono::{Duration, TimeZone};

    fn service(
        transactions: Arc<InMemoryTransactionStore>,
        logbook: Arc<InMemoryLogbookStore>,
        matches: Arc<InMemoryMatchStore>,
    ) -> ReconciliationService {
        ReconciliationService::new(transactions, logbook, matches, MatchingConfig::default())
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap()
    }

    fn transaction(user_id: Uuid, amount_minor: i64, minutes_offset: i64) -> Transaction {
        Transaction {
            transaction_id: Uuid::new_v4(),
            user_id,
            amount_minor,
            currency: "GHS".to_string(),
            reference: None,
            status: "success".to_string(),
            created_utc: base_time() + Duration::minutes(minutes_offset),
        }
    }

    fn entry(user_id: Uuid, amount_minor: i64, minutes_offset: i64) -> LogbookEntry {
        LogbookEntry {
            entry_id: Uuid::new_v4(),
            user_id,
            entry_type: "expense".to_string(),
            amount_minor,
            currency: "GHS".to_string(),
            note: None,
            created_utc: base_time() + Duration::minutes(minutes_offset),
            is_reconciled: false,
            reconciled_transaction_id: None,
        }
    }

    fn period() -> (DateTime<Utc>, DateTime<Utc>) {
        (base_time() - Duration::hours(1), base_time() + Duration::hours(1))
    }

    #[tokio::test]
    async fn run_auto_matches_exact_pair_and_marks_entry() {
        let transactions = Arc::new(InMemoryTransactionStore::new());
        let logbook = Arc::new(InMemoryLogbookStore::new());
        let matches = Arc::new(InMemoryMatchStore::new());
        let user = Uuid::new_v4();

        let txn = transaction(user, 5000, 0);
        let e = entry(user, 5000, 1);
        transactions.insert(txn.clone());
        logbook.insert(e.clone());

        let svc = service(transactions, logbook.clone(), matches);
        let (start, end) = period();
        let report = svc
            .run_reconciliation(start, end, None, None, "scheduler")
            .await
            .unwrap();

        assert_eq!(report.summary.automatic_matches, 1);
        assert_eq!(report.summary.unmatched_transactions, 0);
        assert_eq!(report.summary.unmatched_logbook_entries, 0);
        assert!((report.summary.match_rate - 100.0).abs() < 1e-9);
        assert_eq!(report.matches[0].transaction_id, txn.transaction_id);

        let reconciled = logbook.get_sync(e.entry_id).unwrap();
        assert!(reconciled.is_reconciled);
        assert_eq!(reconciled.reconciled_transaction_id, Some(txn.transaction_id));
    }

    #[tokio::test]
    async fn below_threshold_pair_becomes_suggestion() {
        let transactions = Arc::new(InMemoryTransactionStore::new());
        let logbook = Arc::new(InMemoryLogbookStore::new());
        let matches = Arc::new(InMemoryMatchStore::new());
        let user = Uuid::new_v4();

        // Two minutes apart scores 0.94: above the retention floor but below
        // the automatic threshold.
        transactions.insert(transaction(user, 5000, 0));
        logbook.insert(entry(user, 5000, 2));

        let svc = service(transactions, logbook, matches);
        let (start, end) = period();
        let report = svc
            .run_reconciliation(start, end, None, None, "scheduler")
            .await
            .unwrap();

        assert_eq!(report.summary.automatic_matches, 0);
        assert_eq!(report.summary.unmatched_transactions, 1);
        assert_eq!(report.unmatched_transactions[0].possible_matches.len(), 1);
        assert!(
            (report.unmatched_transactions[0].possible_matches[0].match_score - 0.94).abs() < 1e-9
        );
        assert_eq!(report.unmatched_logbook_entries[0].possible_matches.len(), 1);
    }

    #[tokio::test]
    async fn second_run_skips_already_matched_pair() {
        let transactions = Arc::new(InMemoryTransactionStore::new());
        let logbook = Arc::new(InMemoryLogbookStore::new());
        let matches = Arc::new(InMemoryMatchStore::new());
        let user = Uuid::new_v4();

        transactions.insert(transaction(user, 5000, 0));
        logbook.insert(entry(user, 5000, 0));

        let svc = service(transactions.clone(), logbook.clone(), matches.clone());
        let (start, end) = period();
        let first = svc
            .run_reconciliation(start, end, None, None, "scheduler")
            .await
            .unwrap();
        assert_eq!(first.summary.automatic_matches, 1);

        // The entry is now reconciled, so the second run sees an empty
        // logbook dataset and creates nothing.
        let second = svc
            .run_reconciliation(start, end, None, None, "scheduler")
            .await
            .unwrap();
        assert_eq!(second.summary.automatic_matches, 0);
        assert_eq!(second.summary.total_logbook_entries, 0);
    }

    #[tokio::test]
    async fn persist_conflict_excludes_pair_from_report() {
        let transactions = Arc::new(InMemoryTransactionStore::new());
        let logbook = Arc::new(InMemoryLogbookStore::new());
        let matches = Arc::new(InMemoryMatchStore::new());
        let user = Uuid::new_v4();

        let txn = transaction(user, 5000, 0);
        let e = entry(user, 5000, 0);
        transactions.insert(txn.clone());
        logbook.insert(e.clone());

        // Simulate a concurrent run that persisted the same transaction
        // after this run snapshotted its datasets.
        matches
            .insert_match(&NewMatch {
                match_id: Uuid::new_v4(),
                logbook_entry_id: Uuid::new_v4(),
                transaction_id: txn.transaction_id,
                user_id: user,
                match_score: 1.0,
                match_type: MatchType::Automatic,
                criteria: MatchCriteria {
                    amount_match: true,
                    time_match: true,
                    currency_match: true,
                    user_match: true,
                },
                time_difference_minutes: 0,
                amount_difference_minor: 0,
                matched_by: None,
            })
            .await
            .unwrap();

        let svc = service(transactions, logbook.clone(), matches);
        let (start, end) = period();
        let report = svc
            .run_reconciliation(start, end, None, None, "scheduler")
            .await
            .unwrap();

        // The raced pair appears in neither the matched nor unmatched lists.
        assert_eq!(report.summary.automatic_matches, 0);
        assert_eq!(report.summary.unmatched_transactions, 0);
        assert_eq!(report.summary.unmatched_logbook_entries, 0);
        // And the entry was not marked reconciled by this run.
        assert!(!logbook.get_sync(e.entry_id).unwrap().is_reconciled);
    }

    #[tokio::test]
    async fn inverted_range_is_rejected() {
        let svc = service(
            Arc::new(InMemoryTransactionStore::new()),
            Arc::new(InMemoryLogbookStore::new()),
            Arc::new(InMemoryMatchStore::new()),
        );
        let (start, end) = period();
        let err = svc
            .run_reconciliation(end, start, None, None, "scheduler")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn manual_match_records_actual_criteria() {
        let transactions = Arc::new(InMemoryTransactionStore::new());
        let logbook = Arc::new(InMemoryLogbookStore::new());
        let matches = Arc::new(InMemoryMatchStore::new());
        let user = Uuid::new_v4();

        // Amounts differ and the gap exceeds the window; only the operator
        // can link these.
        let txn = transaction(user, 5000, 0);
        let e = entry(user, 4800, 45);
        transactions.insert(txn.clone());
        logbook.insert(e.clone());

        let svc = service(transactions, logbook.clone(), matches);
        let m = svc
            .create_manual_match(txn.transaction_id, e.entry_id, "ops@example.com", Some("bank fee"))
            .await
            .unwrap();

        assert_eq!(m.match_type, "manual");
        assert!((m.match_score - 1.0).abs() < 1e-9);
        let criteria = m.criteria();
        assert!(!criteria.amount_match);
        assert!(!criteria.time_match);
        assert!(criteria.currency_match);
        assert!(criteria.user_match);
        assert_eq!(m.matched_by.as_deref(), Some("ops@example.com"));
        assert!(logbook.get_sync(e.entry_id).unwrap().is_reconciled);
    }

    #[tokio::test]
    async fn manual_match_rejects_already_matched_entities() {
        let transactions = Arc::new(InMemoryTransactionStore::new());
        let logbook = Arc::new(InMemoryLogbookStore::new());
        let matches = Arc::new(InMemoryMatchStore::new());
        let user = Uuid::new_v4();

        let txn = transaction(user, 5000, 0);
        let e1 = entry(user, 5000, 0);
        let e2 = entry(user, 5000, 3);
        transactions.insert(txn.clone());
        logbook.insert(e1.clone());
        logbook.insert(e2.clone());

        let svc = service(transactions, logbook, matches);
        svc.create_manual_match(txn.transaction_id, e1.entry_id, "ops", None)
            .await
            .unwrap();

        let err = svc
            .create_manual_match(txn.transaction_id, e2.entry_id, "ops", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn manual_match_unknown_entities_not_found() {
        let svc = service(
            Arc::new(InMemoryTransactionStore::new()),
            Arc::new(InMemoryLogbookStore::new()),
            Arc::new(InMemoryMatchStore::new()),
        );
        let err = svc
            .create_manual_match(Uuid::new_v4(), Uuid::new_v4(), "ops", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn metrics_aggregate_over_persisted_matches() {
        let transactions = Arc::new(InMemoryTransactionStore::new());
        let logbook = Arc::new(InMemoryLogbookStore::new());
        let matches = Arc::new(InMemoryMatchStore::new());
        let user = Uuid::new_v4();

        transactions.insert(transaction(user, 1000, 0));
        transactions.insert(transaction(user, 2000, 20));
        logbook.insert(entry(user, 1000, 0));
        logbook.insert(entry(user, 2000, 21));

        let svc = service(transactions, logbook, matches);
        let (start, end) = period();
        svc.run_reconciliation(start, end, None, None, "scheduler")
            .await
            .unwrap();

        let metrics = svc
            .get_metrics(Utc::now() - Duration::hours(1), Utc::now() + Duration::hours(1), None)
            .await
            .unwrap();
        assert_eq!(metrics.total_matches, 2);
        assert_eq!(metrics.automatic_matches, 2);
        assert_eq!(metrics.manual_matches, 0);
        assert!(metrics.average_match_score > 0.9);
    }
}
