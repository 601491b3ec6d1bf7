//! Distributed counter store abstraction.
//!
//! The rate limiter and cost controller talk to shared state only through
//! [`DistributedStore`]. Every operation is independently fallible and callers
//! are expected to fall back to process-local state on any [`StoreError`].

mod memory;
mod redis;
mod unavailable;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::clock::Clock;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;
pub use self::unavailable::UnavailableStore;

/// Errors returned by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is not configured")]
    Unavailable,
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("invalid store url: {0}")]
    InvalidUrl(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Sorted-set and hash primitives with per-key TTL.
///
/// Timestamps are microseconds since the Unix epoch and double as sorted-set
/// scores.
#[async_trait]
pub trait DistributedStore: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Record one hit in a sliding window, in a single round-trip.
    ///
    /// Drops members scored at or before `window_start`, counts the survivors,
    /// adds `member` at `now` and refreshes the key TTL. Returns the count
    /// taken before `member` was added.
    async fn window_hit(
        &self,
        key: &str,
        window_start: i64,
        member: &str,
        now: i64,
        ttl_secs: u64,
    ) -> StoreResult<u64>;

    /// Remove a single member from a window.
    async fn window_remove(&self, key: &str, member: &str) -> StoreResult<()>;

    /// Score of the oldest surviving member, if any.
    async fn window_oldest(&self, key: &str) -> StoreResult<Option<i64>>;

    /// Increment hash fields and refresh the key TTL.
    async fn hash_incr(&self, key: &str, fields: &[(&str, i64)], ttl_secs: u64)
        -> StoreResult<()>;

    /// Read every field of a hash. Missing keys read as empty.
    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, i64>>;
}

/// Build the store selected by `url`.
///
/// * `None` selects [`UnavailableStore`] so every call takes the fallback path.
/// * `memory://` selects a process-local [`MemoryStore`].
/// * `redis://` and `rediss://` select [`RedisStore`]; the connection is made
///   lazily so an unreachable server does not block startup.
pub fn connect(
    url: Option<&str>,
    timeout: Duration,
    clock: Arc<dyn Clock>,
) -> StoreResult<Arc<dyn DistributedStore>> {
    let store: Arc<dyn DistributedStore> = match url {
        None => Arc::new(UnavailableStore),
        Some(url) if url.starts_with("memory://") => Arc::new(MemoryStore::new(clock)),
        Some(url) if url.starts_with("redis://") || url.starts_with("rediss://") => {
            Arc::new(RedisStore::open(url, timeout)?)
        }
        Some(url) => return Err(StoreError::InvalidUrl(url.to_string())),
    };

    info!(backend = store.name(), "Distributed store selected");
    Ok(store)
}
