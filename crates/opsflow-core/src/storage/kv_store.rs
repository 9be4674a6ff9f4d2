//! Key-value store trait.
//!
//! Defines the interface for the shared context cache. Keys are already
//! namespaced by tenant (`context:{organization_id}:{resource}:{identifier}`)
//! by the context builder -- isolation here is naming, not ACL.
//! Implementations live in opsflow-infra.

use std::time::Duration;

use opsflow_types::error::RepositoryError;

/// Trait for the engine's shared key-value cache.
///
/// Stores arbitrary JSON values under string keys with optional TTL.
/// Uses RPITIT (native async fn in traits, Rust 2024 edition).
pub trait KvStore: Send + Sync {
    /// Get a value by key. Returns None if the key is absent or expired.
    fn get(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<serde_json::Value>, RepositoryError>> + Send;

    /// Set a value for a key (upsert) with an optional time-to-live.
    fn set(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Option<Duration>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Delete a key. No-op if the key does not exist.
    fn delete(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}

impl<T: KvStore> KvStore for std::sync::Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, RepositoryError> {
        self.as_ref().get(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), RepositoryError> {
        self.as_ref().set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), RepositoryError> {
        self.as_ref().delete(key).await
    }
}
