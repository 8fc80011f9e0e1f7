//! TTL key-value store backing the idempotency guard.

use crate::error::AppError;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Fast expiring key-value store with an atomic set-if-absent primitive.
#[async_trait]
pub trait TtlStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError>;

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<(), AppError>;

    /// Atomically claim `key`. Returns true when this caller created the
    /// entry, false when it already existed.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<bool, AppError>;

    async fn delete(&self, key: &str) -> Result<(), AppError>;

    async fn health_check(&self) -> Result<(), AppError>;
}

// ============================================================================
// Redis implementation
// ============================================================================

#[derive(Clone)]
pub struct RedisTtlStore {
    manager: ConnectionManager,
}

impl RedisTtlStore {
    pub async fn new(url: &str) -> Result<Self, AppError> {
        tracing::info!(url = %url, "Connecting to Redis");
        let client = Client::open(url)?;

        // ConnectionManager reconnects automatically on broken connections.
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to get Redis connection manager");
            e
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self { manager })
    }
}

#[async_trait]
impl TtlStore for RedisTtlStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<bool, AppError> {
        let mut conn = self.manager.clone();
        // SET NX EX replies OK when the key was claimed, nil otherwise.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// In-process TtlStore used by tests and local development. The mutex makes
/// set_if_absent atomic with respect to concurrent callers.
#[derive(Default)]
pub struct InMemoryTtlStore {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl InMemoryTtlStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(
        entries: &mut HashMap<String, (String, Option<Instant>)>,
        key: &str,
    ) -> Option<String> {
        match entries.get(key) {
            Some((_, Some(expires))) if *expires <= Instant::now() => {
                entries.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl TtlStore for InMemoryTtlStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("mutex poisoned: {}", e)))?;
        Ok(Self::live_value(&mut entries, key))
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<(), AppError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("mutex poisoned: {}", e)))?;
        let expires = Instant::now() + Duration::from_secs(ttl_seconds);
        entries.insert(key.to_string(), (value.to_string(), Some(expires)));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<bool, AppError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("mutex poisoned: {}", e)))?;
        if Self::live_value(&mut entries, key).is_some() {
            return Ok(false);
        }
        let expires = Instant::now() + Duration::from_secs(ttl_seconds);
        entries.insert(key.to_string(), (value.to_string(), Some(expires)));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("mutex poisoned: {}", e)))?;
        entries.remove(key);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_absent_claims_once() {
        let store = InMemoryTtlStore::new();
        assert!(store.set_if_absent("k", "first", 60).await.unwrap());
        assert!(!store.set_if_absent("k", "second", 60).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("first".to_string()));
    }

    #[tokio::test]
    async fn entries_expire() {
        let store = InMemoryTtlStore::new();
        store.set_with_ttl("k", "v", 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        // Expired entry no longer blocks a new claim.
        assert!(store.set_if_absent("k", "next", 60).await.unwrap());
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let store = InMemoryTtlStore::new();
        store.set_with_ttl("k", "v", 60).await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
