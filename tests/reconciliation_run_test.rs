//! Integration tests for the reconciliation run endpoint.

mod common;

use common::{base_time, settled_transaction, spawn_app, unreconciled_entry};
use chrono::Duration;
use serde_json::{json, Value};
use uuid::Uuid;

fn run_body(user_id: Option<Uuid>) -> Value {
    json!({
        "period_start": base_time() - Duration::hours(1),
        "period_end": base_time() + Duration::hours(1),
        "user_id": user_id,
        "generated_by": "ops@example.com",
    })
}

#[tokio::test]
async fn run_creates_automatic_match_for_exact_pair() {
    let app = spawn_app().await;
    let user = Uuid::new_v4();

    let txn = settled_transaction(user, 5000, 0);
    let entry = unreconciled_entry(user, 5000, 1);
    app.transactions.insert(txn.clone());
    app.logbook.insert(entry.clone());

    let response = app
        .client
        .post(app.url("/reconciliation/run"))
        .json(&run_body(None))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 201);
    let report: Value = response.json().await.expect("Invalid report body");
    assert_eq!(report["summary"]["automatic_matches"], 1);
    assert_eq!(report["summary"]["unmatched_transactions"], 0);
    assert_eq!(report["summary"]["match_rate"], 100.0);
    assert_eq!(
        report["matches"][0]["transaction_id"],
        txn.transaction_id.to_string()
    );
    assert_eq!(report["matches"][0]["match_type"], "automatic");

    // The entry is now reconciled and linked to the transaction.
    let reconciled = app.logbook.get_sync(entry.entry_id).unwrap();
    assert!(reconciled.is_reconciled);
    assert_eq!(reconciled.reconciled_transaction_id, Some(txn.transaction_id));
}

#[tokio::test]
async fn below_threshold_pair_is_reported_as_suggestion() {
    let app = spawn_app().await;
    let user = Uuid::new_v4();

    // Two minutes apart scores 0.94, under the 0.95 automatic threshold.
    app.transactions.insert(settled_transaction(user, 5000, 0));
    app.logbook.insert(unreconciled_entry(user, 5000, 2));

    let response = app
        .client
        .post(app.url("/reconciliation/run"))
        .json(&run_body(None))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 201);
    let report: Value = response.json().await.expect("Invalid report body");
    assert_eq!(report["summary"]["automatic_matches"], 0);
    assert_eq!(report["summary"]["unmatched_transactions"], 1);
    assert_eq!(report["summary"]["unmatched_logbook_entries"], 1);

    let suggestions = report["unmatched_transactions"][0]["possible_matches"]
        .as_array()
        .unwrap();
    assert_eq!(suggestions.len(), 1);
    let score = suggestions[0]["match_score"].as_f64().unwrap();
    assert!((score - 0.94).abs() < 1e-9);
}

#[tokio::test]
async fn run_scoped_to_user_ignores_other_users() {
    let app = spawn_app().await;
    let user = Uuid::new_v4();
    let other = Uuid::new_v4();

    app.transactions.insert(settled_transaction(user, 5000, 0));
    app.logbook.insert(unreconciled_entry(user, 5000, 0));
    app.transactions.insert(settled_transaction(other, 7000, 0));
    app.logbook.insert(unreconciled_entry(other, 7000, 0));

    let response = app
        .client
        .post(app.url("/reconciliation/run"))
        .json(&run_body(Some(user)))
        .send()
        .await
        .expect("Failed to execute request");

    let report: Value = response.json().await.expect("Invalid report body");
    assert_eq!(report["summary"]["total_transactions"], 1);
    assert_eq!(report["summary"]["automatic_matches"], 1);
}

#[tokio::test]
async fn per_run_overrides_widen_the_window() {
    let app = spawn_app().await;
    let user = Uuid::new_v4();

    // 20 minutes apart: outside the default window entirely.
    app.transactions.insert(settled_transaction(user, 5000, 0));
    app.logbook.insert(unreconciled_entry(user, 5000, 20));

    let mut body = run_body(None);
    body["config"] = json!({
        "time_window_minutes": 60,
        "auto_match_threshold": 0.9,
        "minimum_match_score": 0.5,
    });

    let response = app
        .client
        .post(app.url("/reconciliation/run"))
        .json(&body)
        .send()
        .await
        .expect("Failed to execute request");

    let report: Value = response.json().await.expect("Invalid report body");
    assert_eq!(report["summary"]["automatic_matches"], 1);
}

#[tokio::test]
async fn inverted_range_is_rejected() {
    let app = spawn_app().await;

    let body = json!({
        "period_start": base_time(),
        "period_end": base_time() - Duration::hours(1),
        "generated_by": "ops@example.com",
    });

    let response = app
        .client
        .post(app.url("/reconciliation/run"))
        .json(&body)
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 400);
    let error: Value = response.json().await.expect("Invalid error body");
    assert_eq!(error["code"], "validation_error");
}

#[tokio::test]
async fn report_is_retrievable_after_the_run() {
    let app = spawn_app().await;
    let user = Uuid::new_v4();

    app.transactions.insert(settled_transaction(user, 5000, 0));
    app.logbook.insert(unreconciled_entry(user, 5000, 0));

    let created: Value = app
        .client
        .post(app.url("/reconciliation/run"))
        .json(&run_body(None))
        .send()
        .await
        .expect("Failed to execute request")
        .json()
        .await
        .expect("Invalid report body");
    let report_id = created["report_id"].as_str().unwrap();

    let fetched = app
        .client
        .get(app.url(&format!("/reconciliation/reports/{}", report_id)))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(fetched.status().as_u16(), 200);
    let fetched: Value = fetched.json().await.expect("Invalid report body");
    assert_eq!(fetched["report_id"], created["report_id"]);
    assert_eq!(fetched["summary"], created["summary"]);
}

#[tokio::test]
async fn unknown_report_returns_not_found() {
    let app = spawn_app().await;

    let response = app
        .client
        .get(app.url(&format!("/reconciliation/reports/{}", Uuid::new_v4())))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn match_metrics_aggregate_persisted_matches() {
    let app = spawn_app().await;
    let user = Uuid::new_v4();

    app.transactions.insert(settled_transaction(user, 1000, 0));
    app.transactions.insert(settled_transaction(user, 2000, 20));
    app.logbook.insert(unreconciled_entry(user, 1000, 0));
    app.logbook.insert(unreconciled_entry(user, 2000, 21));

    app.client
        .post(app.url("/reconciliation/run"))
        .json(&run_body(None))
        .send()
        .await
        .expect("Failed to execute request");

    // Matches are stamped with the wall-clock time of the run.
    let now = chrono::Utc::now();
    let response = app
        .client
        .get(app.url("/reconciliation/metrics"))
        .query(&[
            ("period_start", (now - Duration::hours(1)).to_rfc3339()),
            ("period_end", (now + Duration::hours(1)).to_rfc3339()),
        ])
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 200);
    let metrics: Value = response.json().await.expect("Invalid metrics body");
    assert_eq!(metrics["total_matches"], 2);
    assert_eq!(metrics["automatic_matches"], 2);
    assert_eq!(metrics["manual_matches"], 0);
}

#[tokio::test]
async fn health_and_metrics_endpoints_respond() {
    let app = spawn_app().await;

    let health = app
        .client
        .get(app.url("/health"))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(health.status().as_u16(), 200);
    let body: Value = health.json().await.expect("Invalid health body");
    assert_eq!(body["status"], "ok");

    let metrics = app
        .client
        .get(app.url("/metrics"))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(metrics.status().as_u16(), 200);
}
