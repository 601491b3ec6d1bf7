//! Core rate limiter implementation.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::key::WindowKey;
use super::window::{retry_after_secs, window_micros, LocalWindows, Tally, GRACE_SECS};
use crate::clock::Clock;
use crate::identity::Identity;
use crate::store::{DistributedStore, StoreError, StoreResult};

/// The verdict for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Seconds until a slot frees up (denied) or the full window (allowed).
    /// The unit is whole seconds, rounded up.
    pub reset_after: u64,
    pub identity: Identity,
    pub bucket: String,
}

/// Sliding-window rate limiter.
///
/// Checks go to the distributed store first. Any store failure is absorbed
/// and the same check is answered from in-process windows instead, so
/// callers never see a store error.
///
/// The distributed path counts, adds and trims in one pipelined round-trip
/// but does not serialize against other writers between that round-trip and
/// the rollback of a rejected entry. Under heavy contention on a single key
/// the admitted count may drift from the limit for a moment; the local path
/// is exact.
pub struct RateLimiter {
    store: Arc<dyn DistributedStore>,
    local: LocalWindows,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a rate limiter. `sweep_every` sets how many local checks pass
    /// between sweeps of idle fallback windows.
    pub fn new(store: Arc<dyn DistributedStore>, clock: Arc<dyn Clock>, sweep_every: u64) -> Self {
        Self {
            store,
            local: LocalWindows::new(sweep_every),
            clock,
        }
    }

    /// Decide whether one more request for `identity` in `bucket` fits in the
    /// trailing `window_secs`.
    pub async fn check(
        &self,
        identity: &Identity,
        bucket: &str,
        limit: u64,
        window_secs: u64,
    ) -> AdmissionDecision {
        let key = WindowKey::new(identity, bucket);
        let now = self.clock.now_micros();

        trace!(key = %key, limit, window_secs, "Checking rate limit");

        let tally = match self.check_distributed(&key, limit, window_secs, now).await {
            Ok(tally) => tally,
            Err(StoreError::Unavailable) => self.local.hit(&key, limit, window_secs, now),
            Err(e) => {
                warn!(
                    key = %key,
                    backend = self.store.name(),
                    error = %e,
                    "Store check failed, using local window"
                );
                self.local.hit(&key, limit, window_secs, now)
            }
        };

        if !tally.allowed {
            debug!(key = %key, reset_after = tally.reset_after, "Rate limit exceeded");
        }

        AdmissionDecision {
            allowed: tally.allowed,
            limit,
            remaining: tally.remaining,
            reset_after: tally.reset_after,
            identity: key.identity,
            bucket: key.bucket,
        }
    }

    async fn check_distributed(
        &self,
        key: &WindowKey,
        limit: u64,
        window_secs: u64,
        now: i64,
    ) -> StoreResult<Tally> {
        let store_key = key.to_store_key();
        let window_start = now.saturating_sub(window_micros(window_secs));
        let member = format!("{now}-{}", Uuid::new_v4().simple());

        let ttl_secs = window_secs.saturating_add(GRACE_SECS);
        let count = self
            .store
            .window_hit(&store_key, window_start, &member, now, ttl_secs)
            .await?;

        if count < limit {
            return Ok(Tally {
                allowed: true,
                remaining: limit - count - 1,
                reset_after: window_secs,
            });
        }

        // The store has denied this request. Cleanup failures below are
        // logged and never reopen the decision.
        if let Err(e) = self.store.window_remove(&store_key, &member).await {
            warn!(
                key = %key,
                backend = self.store.name(),
                error = %e,
                "Failed to roll back rejected request"
            );
        }
        let reset_after = match self.store.window_oldest(&store_key).await {
            Ok(Some(oldest)) => retry_after_secs(oldest, now, window_secs),
            Ok(None) => window_secs,
            Err(e) => {
                warn!(
                    key = %key,
                    backend = self.store.name(),
                    error = %e,
                    "Failed to read oldest window entry"
                );
                window_secs
            }
        };

        Ok(Tally {
            allowed: false,
            remaining: 0,
            reset_after,
        })
    }

    /// Number of keys held by the in-process fallback.
    pub fn local_key_count(&self) -> usize {
        self.local.len()
    }
}
