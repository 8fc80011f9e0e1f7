//! Shared test harness: spawns the full router on an ephemeral port with
//! in-memory stores, so tests run without Postgres or Redis.

use chrono::{DateTime, Duration, TimeZone, Utc};
use payment_reconciliation::models::{LogbookEntry, Transaction};
use payment_reconciliation::services::{
    IdempotencyGuard, InMemoryLogbookStore, InMemoryMatchStore, InMemoryTransactionStore,
    InMemoryTtlStore, MatchingConfig, ReconciliationService,
};
use payment_reconciliation::startup::{app_router, AppState};
use std::sync::Arc;
use uuid::Uuid;

pub struct TestApp {
    pub address: String,
    pub client: reqwest::Client,
    pub transactions: Arc<InMemoryTransactionStore>,
    pub logbook: Arc<InMemoryLogbookStore>,
    pub matches: Arc<InMemoryMatchStore>,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }
}

/// Fixed reference instant so test data is reproducible.
#[allow(dead_code)]
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap()
}

#[allow(dead_code)]
pub fn settled_transaction(user_id: Uuid, amount_minor: i64, minutes_offset: i64) -> Transaction {
    Transaction {
        transaction_id: Uuid::new_v4(),
        user_id,
        amount_minor,
        currency: "GHS".to_string(),
        reference: Some("PAY-REF".to_string()),
        status: "success".to_string(),
        created_utc: base_time() + Duration::minutes(minutes_offset),
    }
}

#[allow(dead_code)]
pub fn unreconciled_entry(user_id: Uuid, amount_minor: i64, minutes_offset: i64) -> LogbookEntry {
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

pub async fn spawn_app() -> TestApp {
    let transactions = Arc::new(InMemoryTransactionStore::new());
    let logbook = Arc::new(InMemoryLogbookStore::new());
    let matches = Arc::new(InMemoryMatchStore::new());
    let ttl_store = Arc::new(InMemoryTtlStore::new());

    let matching = MatchingConfig::default();
    let services = Arc::new(ReconciliationService::new(
        transactions.clone(),
        logbook.clone(),
        matches.clone(),
        matching.clone(),
    ));
    let guard = Arc::new(IdempotencyGuard::new(ttl_store, 900));

    let state = AppState::new(services, guard, matching);
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let port = listener.local_addr().expect("Failed to read address").port();

    tokio::spawn(async move {
        axum::serve(listener, router)
            .await
            .expect("Test server failed");
    });

    TestApp {
        address: format!("http://127.0.0.1:{}", port),
        client: reqwest::Client::new(),
        transactions,
        logbook,
        matches,
    }
}
