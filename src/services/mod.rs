//! Services module for the payment reconciliation service.

pub mod database;
pub mod idempotency;
pub mod matching;
pub mod metrics;
pub mod reconciliation;
pub mod redis;
pub mod resolver;
pub mod stores;

pub use database::{Database, InMemoryMatchStore, MatchStore};
pub use idempotency::{CachedResponse, IdempotencyGuard, ReservationOutcome};
pub use matching::MatchingConfig;
pub use metrics::{get_metrics, init_metrics, record_error};
pub use reconciliation::ReconciliationService;
pub use redis::{InMemoryTtlStore, RedisTtlStore, TtlStore};
pub use stores::{
    InMemoryLogbookStore, InMemoryTransactionStore, LogbookStore, TransactionStore,
};
