//! Configuration module for the payment reconciliation service.

use crate::error::AppError;
use crate::services::matching::MatchingConfig;
use std::env;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub port: u16,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub matching: MatchingConfig,
    pub idempotency_ttl_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Ok(Self {
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "payment-reconciliation".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            port: env::var("PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3001),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            },
            redis: RedisConfig {
                url: env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            },
            matching: MatchingConfig {
                time_window_minutes: env::var("TIME_WINDOW_MINUTES")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(MatchingConfig::default().time_window_minutes),
                amount_tolerance_percent: env::var("AMOUNT_TOLERANCE_PERCENT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(MatchingConfig::default().amount_tolerance_percent),
                minimum_match_score: env::var("MINIMUM_MATCH_SCORE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(MatchingConfig::default().minimum_match_score),
                auto_match_threshold: env::var("AUTO_MATCH_THRESHOLD")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(MatchingConfig::default().auto_match_threshold),
            },
            idempotency_ttl_seconds: env::var("IDEMPOTENCY_TTL_SECONDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(900),
        })
    }
}
