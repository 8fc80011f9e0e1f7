//! Postgres persistence for matches and reports.

use crate::error::AppError;
use crate::models::{
    LogbookEntry, MatchType, NewMatch, ReconciliationMatch, ReconciliationReport, Transaction,
    TransactionStatus,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::stores::{LogbookStore, TransactionStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Aggregates over the matches table for a date range.
#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct MatchAggregates {
    pub total_matches: i64,
    pub automatic_matches: i64,
    pub manual_matches: i64,
    pub average_match_score: f64,
    pub average_time_difference_minutes: f64,
}

/// Insert-only persistence for matches and reports.
///
/// `insert_match` must surface `Conflict` when either entity already has a
/// persisted match; the backing store enforces this with uniqueness
/// constraints on transaction_id and logbook_entry_id, which is what keeps
/// two concurrent runs from double-matching the same entity.
#[async_trait]
pub trait MatchStore: Send + Sync {
    async fn insert_match(&self, new_match: &NewMatch) -> Result<ReconciliationMatch, AppError>;

    async fn find_match_for_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<ReconciliationMatch>, AppError>;

    async fn find_match_for_entry(
        &self,
        entry_id: Uuid,
    ) -> Result<Option<ReconciliationMatch>, AppError>;

    async fn insert_report(&self, report: &ReconciliationReport) -> Result<(), AppError>;

    async fn get_report(
        &self,
        report_id: Uuid,
    ) -> Result<Option<ReconciliationReport>, AppError>;

    async fn aggregate_matches(
        &self,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        user_id: Option<Uuid>,
    ) -> Result<MatchAggregates, AppError>;

    async fn health_check(&self) -> Result<(), AppError>;
}

// ============================================================================
// Postgres implementation
// ============================================================================

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "payment-reconciliation"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl MatchStore for Database {
    #[instrument(skip(self, new_match), fields(transaction_id = %new_match.transaction_id, logbook_entry_id = %new_match.logbook_entry_id))]
    async fn insert_match(&self, new_match: &NewMatch) -> Result<ReconciliationMatch, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_match"])
            .start_timer();

        let result = sqlx::query_as::<_, ReconciliationMatch>(
            r#"
            INSERT INTO reconciliation_matches (match_id, logbook_entry_id, transaction_id, user_id, match_score, match_type, amount_match, time_match, currency_match, user_match, time_difference_minutes, amount_difference_minor, matched_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING match_id, logbook_entry_id, transaction_id, user_id, match_score, match_type, amount_match, time_match, currency_match, user_match, time_difference_minutes, amount_difference_minor, matched_utc, matched_by
            "#,
        )
        .bind(new_match.match_id)
        .bind(new_match.logbook_entry_id)
        .bind(new_match.transaction_id)
        .bind(new_match.user_id)
        .bind(new_match.match_score)
        .bind(new_match.match_type.as_str())
        .bind(new_match.criteria.amount_match)
        .bind(new_match.criteria.time_match)
        .bind(new_match.criteria.currency_match)
        .bind(new_match.criteria.user_match)
        .bind(new_match.time_difference_minutes)
        .bind(new_match.amount_difference_minor)
        .bind(new_match.matched_by.as_deref())
        .fetch_one(&self.pool)
        .await;

        timer.observe_duration();

        match result {
            Ok(inserted) => {
                info!(match_id = %inserted.match_id, match_type = %inserted.match_type, "Match persisted");
                Ok(inserted)
            }
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                Err(AppError::Conflict(anyhow::anyhow!(
                    "transaction or logbook entry already matched"
                )))
            }
            Err(e) => Err(AppError::DatabaseError(anyhow::anyhow!(
                "Failed to insert match: {}",
                e
            ))),
        }
    }

    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    async fn find_match_for_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<ReconciliationMatch>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_match_for_transaction"])
            .start_timer();

        let found = sqlx::query_as::<_, ReconciliationMatch>(
            r#"
            SELECT match_id, logbook_entry_id, transaction_id, user_id, match_score, match_type, amount_match, time_match, currency_match, user_match, time_difference_minutes, amount_difference_minor, matched_utc, matched_by
            FROM reconciliation_matches
            WHERE transaction_id = $1
            "#,
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to find match: {}", e)))?;

        timer.observe_duration();
        Ok(found)
    }

    #[instrument(skip(self), fields(entry_id = %entry_id))]
    async fn find_match_for_entry(
        &self,
        entry_id: Uuid,
    ) -> Result<Option<ReconciliationMatch>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_match_for_entry"])
            .start_timer();

        let found = sqlx::query_as::<_, ReconciliationMatch>(
            r#"
            SELECT match_id, logbook_entry_id, transaction_id, user_id, match_score, match_type, amount_match, time_match, currency_match, user_match, time_difference_minutes, amount_difference_minor, matched_utc, matched_by
            FROM reconciliation_matches
            WHERE logbook_entry_id = $1
            "#,
        )
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to find match: {}", e)))?;

        timer.observe_duration();
        Ok(found)
    }

    #[instrument(skip(self, report), fields(report_id = %report.report_id, correlation_id = %report.correlation_id))]
    async fn insert_report(&self, report: &ReconciliationReport) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_report"])
            .start_timer();

        let summary = serde_json::to_value(&report.summary)
            .map_err(|e| AppError::InternalError(anyhow::Error::new(e)))?;
        let matches = serde_json::to_value(&report.matches)
            .map_err(|e| AppError::InternalError(anyhow::Error::new(e)))?;
        let unmatched_transactions = serde_json::to_value(&report.unmatched_transactions)
            .map_err(|e| AppError::InternalError(anyhow::Error::new(e)))?;
        let unmatched_entries = serde_json::to_value(&report.unmatched_logbook_entries)
            .map_err(|e| AppError::InternalError(anyhow::Error::new(e)))?;

        sqlx::query(
            r#"
            INSERT INTO reconciliation_reports (report_id, report_date, period_start, period_end, user_id, summary, matches, unmatched_transactions, unmatched_logbook_entries, generated_by, correlation_id, generated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(report.report_id)
        .bind(report.report_date)
        .bind(report.period_start)
        .bind(report.period_end)
        .bind(report.user_id)
        .bind(summary)
        .bind(matches)
        .bind(unmatched_transactions)
        .bind(unmatched_entries)
        .bind(&report.generated_by)
        .bind(report.correlation_id)
        .bind(report.generated_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to insert report: {}", e)))?;

        timer.observe_duration();
        info!(report_id = %report.report_id, "Report persisted");
        Ok(())
    }

    #[instrument(skip(self), fields(report_id = %report_id))]
    async fn get_report(
        &self,
        report_id: Uuid,
    ) -> Result<Option<ReconciliationReport>, AppError> {
        #[derive(sqlx::FromRow)]
        struct ReportRow {
            report_id: Uuid,
            report_date: DateTime<Utc>,
            period_start: DateTime<Utc>,
            period_end: DateTime<Utc>,
            user_id: Option<Uuid>,
            summary: serde_json::Value,
            matches: serde_json::Value,
            unmatched_transactions: serde_json::Value,
            unmatched_logbook_entries: serde_json::Value,
            generated_by: String,
            correlation_id: Uuid,
            generated_utc: DateTime<Utc>,
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_report"])
            .start_timer();

        let row = sqlx::query_as::<_, ReportRow>(
            r#"
            SELECT report_id, report_date, period_start, period_end, user_id, summary, matches, unmatched_transactions, unmatched_logbook_entries, generated_by, correlation_id, generated_utc
            FROM reconciliation_reports
            WHERE report_id = $1
            "#,
        )
        .bind(report_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get report: {}", e)))?;

        timer.observe_duration();

        let Some(row) = row else {
            return Ok(None);
        };

        let report = ReconciliationReport {
            report_id: row.report_id,
            report_date: row.report_date,
            period_start: row.period_start,
            period_end: row.period_end,
            user_id: row.user_id,
            summary: serde_json::from_value(row.summary)
                .map_err(|e| AppError::InternalError(anyhow::Error::new(e)))?,
            matches: serde_json::from_value(row.matches)
                .map_err(|e| AppError::InternalError(anyhow::Error::new(e)))?,
            unmatched_transactions: serde_json::from_value(row.unmatched_transactions)
                .map_err(|e| AppError::InternalError(anyhow::Error::new(e)))?,
            unmatched_logbook_entries: serde_json::from_value(row.unmatched_logbook_entries)
                .map_err(|e| AppError::InternalError(anyhow::Error::new(e)))?,
            generated_by: row.generated_by,
            correlation_id: row.correlation_id,
            generated_utc: row.generated_utc,
        };

        Ok(Some(report))
    }

    #[instrument(skip(self))]
    async fn aggregate_matches(
        &self,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        user_id: Option<Uuid>,
    ) -> Result<MatchAggregates, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["aggregate_matches"])
            .start_timer();

        let aggregates = sqlx::query_as::<_, MatchAggregates>(
            r#"
            SELECT COUNT(*) AS total_matches,
                   COUNT(*) FILTER (WHERE match_type = 'automatic') AS automatic_matches,
                   COUNT(*) FILTER (WHERE match_type = 'manual') AS manual_matches,
                   COALESCE(AVG(match_score), 0)::float8 AS average_match_score,
                   COALESCE(AVG(time_difference_minutes), 0)::float8 AS average_time_difference_minutes
            FROM reconciliation_matches
            WHERE matched_utc >= $1 AND matched_utc <= $2
              AND ($3::uuid IS NULL OR user_id = $3)
            "#,
        )
        .bind(period_start)
        .bind(period_end)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to aggregate matches: {}", e))
        })?;

        timer.observe_duration();
        Ok(aggregates)
    }

    /// Check database health.
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }
}

#[async_trait]
impl TransactionStore for Database {
    #[instrument(skip(self))]
    async fn list_settled(
        &self,
        user_id: Option<Uuid>,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_settled"])
            .start_timer();

        let transactions = sqlx::query_as::<_, Transaction>(
            r#"
            SELECT transaction_id, user_id, amount_minor, currency, reference, status, created_utc
            FROM payment_transactions
            WHERE status = $1 AND created_utc >= $2 AND created_utc <= $3
              AND ($4::uuid IS NULL OR user_id = $4)
            ORDER BY created_utc
            "#,
        )
        .bind(TransactionStatus::Success.as_str())
        .bind(period_start)
        .bind(period_end)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list transactions: {}", e))
        })?;

        timer.observe_duration();
        Ok(transactions)
    }

    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    async fn get_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<Transaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_transaction"])
            .start_timer();

        let transaction = sqlx::query_as::<_, Transaction>(
            r#"
            SELECT transaction_id, user_id, amount_minor, currency, reference, status, created_utc
            FROM payment_transactions
            WHERE transaction_id = $1
            "#,
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get transaction: {}", e))
        })?;

        timer.observe_duration();
        Ok(transaction)
    }
}

#[async_trait]
impl LogbookStore for Database {
    #[instrument(skip(self))]
    async fn list_unreconciled(
        &self,
        user_id: Option<Uuid>,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Vec<LogbookEntry>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_unreconciled"])
            .start_timer();

        let entries = sqlx::query_as::<_, LogbookEntry>(
            r#"
            SELECT entry_id, user_id, entry_type, amount_minor, currency, note, created_utc, is_reconciled, reconciled_transaction_id
            FROM logbook_entries
            WHERE is_reconciled = FALSE AND created_utc >= $1 AND created_utc <= $2
              AND ($3::uuid IS NULL OR user_id = $3)
            ORDER BY created_utc
            "#,
        )
        .bind(period_start)
        .bind(period_end)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list logbook entries: {}", e))
        })?;

        timer.observe_duration();
        Ok(entries)
    }

    #[instrument(skip(self), fields(entry_id = %entry_id))]
    async fn get_entry(&self, entry_id: Uuid) -> Result<Option<LogbookEntry>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_entry"])
            .start_timer();

        let entry = sqlx::query_as::<_, LogbookEntry>(
            r#"
            SELECT entry_id, user_id, entry_type, amount_minor, currency, note, created_utc, is_reconciled, reconciled_transaction_id
            FROM logbook_entries
            WHERE entry_id = $1
            "#,
        )
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get logbook entry: {}", e))
        })?;

        timer.observe_duration();
        Ok(entry)
    }

    #[instrument(skip(self), fields(entry_id = %entry_id, transaction_id = %transaction_id))]
    async fn mark_reconciled(
        &self,
        entry_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_reconciled"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE logbook_entries
            SET is_reconciled = TRUE, reconciled_transaction_id = $2
            WHERE entry_id = $1
            "#,
        )
        .bind(entry_id)
        .bind(transaction_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to mark entry reconciled: {}", e))
        })?;

        timer.observe_duration();

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Logbook entry not found"
            )));
        }
        Ok(())
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// In-process MatchStore mirroring the uniqueness semantics of the Postgres
/// tables. Used by tests and local development.
#[derive(Default)]
pub struct InMemoryMatchStore {
    matches: Mutex<Vec<ReconciliationMatch>>,
    reports: Mutex<HashMap<Uuid, ReconciliationReport>>,
}

impl InMemoryMatchStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MatchStore for InMemoryMatchStore {
    async fn insert_match(&self, new_match: &NewMatch) -> Result<ReconciliationMatch, AppError> {
        let mut matches = self
            .matches
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("mutex poisoned: {}", e)))?;

        let taken = matches.iter().any(|m| {
            m.transaction_id == new_match.transaction_id
                || m.logbook_entry_id == new_match.logbook_entry_id
        });
        if taken {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "transaction or logbook entry already matched"
            )));
        }

        let inserted = ReconciliationMatch {
            match_id: new_match.match_id,
            logbook_entry_id: new_match.logbook_entry_id,
            transaction_id: new_match.transaction_id,
            user_id: new_match.user_id,
            match_score: new_match.match_score,
            match_type: new_match.match_type.as_str().to_string(),
            amount_match: new_match.criteria.amount_match,
            time_match: new_match.criteria.time_match,
            currency_match: new_match.criteria.currency_match,
            user_match: new_match.criteria.user_match,
            time_difference_minutes: new_match.time_difference_minutes,
            amount_difference_minor: new_match.amount_difference_minor,
            matched_utc: Utc::now(),
            matched_by: new_match.matched_by.clone(),
        };
        matches.push(inserted.clone());
        Ok(inserted)
    }

    async fn find_match_for_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<ReconciliationMatch>, AppError> {
        let matches = self
            .matches
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("mutex poisoned: {}", e)))?;
        Ok(matches
            .iter()
            .find(|m| m.transaction_id == transaction_id)
            .cloned())
    }

    async fn find_match_for_entry(
        &self,
        entry_id: Uuid,
    ) -> Result<Option<ReconciliationMatch>, AppError> {
        let matches = self
            .matches
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("mutex poisoned: {}", e)))?;
        Ok(matches
            .iter()
            .find(|m| m.logbook_entry_id == entry_id)
            .cloned())
    }

    async fn insert_report(&self, report: &ReconciliationReport) -> Result<(), AppError> {
        let mut reports = self
            .reports
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("mutex poisoned: {}", e)))?;
        reports.insert(report.report_id, report.clone());
        Ok(())
    }

    async fn get_report(
        &self,
        report_id: Uuid,
    ) -> Result<Option<ReconciliationReport>, AppError> {
        let reports = self
            .reports
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("mutex poisoned: {}", e)))?;
        Ok(reports.get(&report_id).cloned())
    }

    async fn aggregate_matches(
        &self,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        user_id: Option<Uuid>,
    ) -> Result<MatchAggregates, AppError> {
        let matches = self
            .matches
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("mutex poisoned: {}", e)))?;

        let in_range: Vec<&ReconciliationMatch> = matches
            .iter()
            .filter(|m| m.matched_utc >= period_start && m.matched_utc <= period_end)
            .filter(|m| user_id.is_none_or(|u| m.user_id == u))
            .collect();

        let total = in_range.len() as i64;
        let automatic = in_range
            .iter()
            .filter(|m| MatchType::parse(&m.match_type) == MatchType::Automatic)
            .count() as i64;
        let (avg_score, avg_time) = if total > 0 {
            (
                in_range.iter().map(|m| m.match_score).sum::<f64>() / total as f64,
                in_range
                    .iter()
                    .map(|m| m.time_difference_minutes as f64)
                    .sum::<f64>()
                    / total as f64,
            )
        } else {
            (0.0, 0.0)
        };

        Ok(MatchAggregates {
            total_matches: total,
            automatic_matches: automatic,
            manual_matches: total - automatic,
            average_match_score: avg_score,
            average_time_difference_minutes: avg_time,
        })
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}
