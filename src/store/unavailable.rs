use std::collections::HashMap;

use async_trait::async_trait;

use super::{DistributedStore, StoreError, StoreResult};

/// A store that is never reachable.
///
/// Selected when no store URL is configured; every caller ends up on its
/// in-process fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableStore;

#[async_trait]
impl DistributedStore for UnavailableStore {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    async fn window_hit(&self, _: &str, _: i64, _: &str, _: i64, _: u64) -> StoreResult<u64> {
        Err(StoreError::Unavailable)
    }

    async fn window_remove(&self, _: &str, _: &str) -> StoreResult<()> {
        Err(StoreError::Unavailable)
    }

    async fn window_oldest(&self, _: &str) -> StoreResult<Option<i64>> {
        Err(StoreError::Unavailable)
    }

    async fn hash_incr(&self, _: &str, _: &[(&str, i64)], _: u64) -> StoreResult<()> {
        Err(StoreError::Unavailable)
    }

    async fn hash_get_all(&self, _: &str) -> StoreResult<HashMap<String, i64>> {
        Err(StoreError::Unavailable)
    }
}
