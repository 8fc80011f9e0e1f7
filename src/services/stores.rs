//! Collaborator store traits for transactions and logbook entries.
//!
//! The transaction and logbook datasets are owned by the wider platform; the
//! reconciliation core consumes them through these seams. In-memory
//! implementations are provided for tests and local development.

use crate::error::AppError;
use crate::models::{LogbookEntry, Transaction, TransactionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use uuid::Uuid;

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// List transactions with status "success" inside `[period_start, period_end]`,
    /// optionally scoped to one user.
    async fn list_settled(
        &self,
        user_id: Option<Uuid>,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, AppError>;

    async fn get_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<Transaction>, AppError>;
}

#[async_trait]
pub trait LogbookStore: Send + Sync {
    /// List unreconciled entries inside `[period_start, period_end]`,
    /// optionally scoped to one user.
    async fn list_unreconciled(
        &self,
        user_id: Option<Uuid>,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Vec<LogbookEntry>, AppError>;

    async fn get_entry(&self, entry_id: Uuid) -> Result<Option<LogbookEntry>, AppError>;

    /// Flip `is_reconciled` and set the transaction link on a matched entry.
    async fn mark_reconciled(
        &self,
        entry_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<(), AppError>;
}

// ============================================================================
// In-memory implementations
// ============================================================================

#[derive(Default)]
pub struct InMemoryTransactionStore {
    transactions: Mutex<Vec<Transaction>>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, transaction: Transaction) {
        self.transactions
            .lock()
            .expect("transaction store mutex poisoned")
            .push(transaction);
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn list_settled(
        &self,
        user_id: Option<Uuid>,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, AppError> {
        let transactions = self
            .transactions
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("mutex poisoned: {}", e)))?;
        Ok(transactions
            .iter()
            .filter(|t| TransactionStatus::parse(&t.status) == TransactionStatus::Success)
            .filter(|t| t.created_utc >= period_start && t.created_utc <= period_end)
            .filter(|t| user_id.is_none_or(|u| t.user_id == u))
            .cloned()
            .collect())
    }

    async fn get_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<Transaction>, AppError> {
        let transactions = self
            .transactions
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("mutex poisoned: {}", e)))?;
        Ok(transactions
            .iter()
            .find(|t| t.transaction_id == transaction_id)
            .cloned())
    }
}

#[derive(Default)]
pub struct InMemoryLogbookStore {
    entries: Mutex<Vec<LogbookEntry>>,
}

impl InMemoryLogbookStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: LogbookEntry) {
        self.entries
            .lock()
            .expect("logbook store mutex poisoned")
            .push(entry);
    }

    pub fn get_sync(&self, entry_id: Uuid) -> Option<LogbookEntry> {
        self.entries
            .lock()
            .expect("logbook store mutex poisoned")
            .iter()
            .find(|e| e.entry_id == entry_id)
            .cloned()
    }
}

#[async_trait]
impl LogbookStore for InMemoryLogbookStore {
    async fn list_unreconciled(
        &self,
        user_id: Option<Uuid>,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Vec<LogbookEntry>, AppError> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("mutex poisoned: {}", e)))?;
        Ok(entries
            .iter()
            .filter(|e| !e.is_reconciled)
            .filter(|e| e.created_utc >= period_start && e.created_utc <= period_end)
            .filter(|e| user_id.is_none_or(|u| e.user_id == u))
            .cloned()
            .collect())
    }

    async fn get_entry(&self, entry_id: Uuid) -> Result<Option<LogbookEntry>, AppError> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("mutex poisoned: {}", e)))?;
        Ok(entries.iter().find(|e| e.entry_id == entry_id).cloned())
    }

    async fn mark_reconciled(
        &self,
        entry_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<(), AppError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("mutex poisoned: {}", e)))?;
        let entry = entries
            .iter_mut()
            .find(|e| e.entry_id == entry_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Logbook entry not found")))?;
        entry.is_reconciled = true;
        entry.reconciled_transaction_id = Some(transaction_id);
        Ok(())
    }
}
