//! Application startup and lifecycle management.

use crate::config::AppConfig;
use crate::error::AppError;
use crate::handlers;
use crate::services::{
    get_metrics, init_metrics, Database, IdempotencyGuard, MatchingConfig, ReconciliationService,
    RedisTtlStore,
};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<ReconciliationService>,
    pub guard: Arc<IdempotencyGuard>,
    matching: MatchingConfig,
}

impl AppState {
    pub fn new(
        services: Arc<ReconciliationService>,
        guard: Arc<IdempotencyGuard>,
        matching: MatchingConfig,
    ) -> Self {
        Self {
            services,
            guard,
            matching,
        }
    }

    /// Service-level matching defaults that per-run overrides fall back to.
    pub fn matching_defaults(&self) -> &MatchingConfig {
        &self.matching
    }
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.services.health_check().await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "service": "payment-reconciliation",
                "version": env!("CARGO_PKG_VERSION")
            })),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "payment-reconciliation",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.services.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

/// Build the full router over the given state. Shared between the binary and
/// the integration tests.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .route("/reconciliation/run", post(handlers::run_reconciliation))
        .route("/reconciliation/reports/:report_id", get(handlers::get_report))
        .route("/reconciliation/matches", post(handlers::create_manual_match))
        .route("/reconciliation/metrics", get(handlers::get_match_metrics))
        .route("/idempotency/check", post(handlers::check_idempotency))
        .route("/idempotency/reserve", post(handlers::reserve_idempotency))
        .route(
            "/idempotency/records",
            post(handlers::store_idempotency).delete(handlers::remove_idempotency),
        )
        .route("/idempotency/hash", post(handlers::hash_request))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: AppConfig) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        db.run_migrations().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to run migrations");
            e
        })?;

        let db = Arc::new(db);

        let ttl_store = RedisTtlStore::new(&config.redis.url).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to Redis");
            e
        })?;

        let services = Arc::new(ReconciliationService::new(
            db.clone(),
            db.clone(),
            db,
            config.matching.clone(),
        ));
        let guard = Arc::new(IdempotencyGuard::new(
            Arc::new(ttl_store),
            config.idempotency_ttl_seconds,
        ));

        let state = AppState::new(services, guard, config.matching.clone());

        let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Payment reconciliation listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = app_router(self.state);
        axum::serve(self.listener, router).await
    }
}
