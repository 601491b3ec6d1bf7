//! Per-identity token and cost accounting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

use super::usage::{
    CostLimits, LimitCheck, Period, Pricing, UsageBucket, UsageSummary, INPUT_FIELD, OUTPUT_FIELD,
};
use crate::clock::Clock;
use crate::identity::Identity;
use crate::store::{DistributedStore, StoreError};

#[derive(Debug, Clone, Copy)]
struct LocalUsage {
    bucket: UsageBucket,
    expires_at: DateTime<Utc>,
}

/// Meters token spend per identity in daily and monthly buckets.
///
/// Buckets are keyed by the current UTC day and month, so a new period starts
/// a fresh bucket without any rollover step. Store writes that fail are kept
/// in an in-process mirror instead.
pub struct CostController {
    store: Arc<dyn DistributedStore>,
    clock: Arc<dyn Clock>,
    pricing: Pricing,
    limits: CostLimits,
    local: DashMap<String, LocalUsage>,
    records: AtomicU64,
    sweep_every: u64,
}

impl CostController {
    pub fn new(
        store: Arc<dyn DistributedStore>,
        clock: Arc<dyn Clock>,
        pricing: Pricing,
        limits: CostLimits,
        sweep_every: u64,
    ) -> Self {
        Self {
            store,
            clock,
            pricing,
            limits,
            local: DashMap::new(),
            records: AtomicU64::new(0),
            sweep_every: sweep_every.max(1),
        }
    }

    pub fn pricing(&self) -> &Pricing {
        &self.pricing
    }

    pub fn limits(&self) -> &CostLimits {
        &self.limits
    }

    /// Add a completed operation's tokens to the identity's current buckets.
    pub async fn record_cost(&self, identity: &Identity, input_tokens: u64, output_tokens: u64) {
        let now = self.clock.now();
        let fields = [
            (INPUT_FIELD, i64::try_from(input_tokens).unwrap_or(i64::MAX)),
            (OUTPUT_FIELD, i64::try_from(output_tokens).unwrap_or(i64::MAX)),
        ];

        for period in Period::ALL {
            let key = period.store_key(identity, now);
            match self.store.hash_incr(&key, &fields, period.ttl_secs()).await {
                Ok(()) => {}
                Err(e) => {
                    log_fallback(&key, self.store.name(), &e);
                    self.record_local(key, period, now, input_tokens, output_tokens);
                }
            }
        }

        debug!(identity = %identity, input_tokens, output_tokens, "Recorded usage");

        let records = self.records.fetch_add(1, Ordering::Relaxed) + 1;
        if records % self.sweep_every == 0 {
            self.sweep(now);
        }
    }

    /// Current daily and monthly usage with dollar costs.
    pub async fn get_usage(&self, identity: &Identity) -> UsageSummary {
        let now = self.clock.now();
        let daily = self.read_bucket(identity, Period::Daily, now).await;
        let monthly = self.read_bucket(identity, Period::Monthly, now).await;

        UsageSummary {
            identity: identity.clone(),
            day: Period::Daily.label(now),
            month: Period::Monthly.label(now),
            daily,
            monthly,
            daily_cost_usd: self.pricing.cost_usd(&daily),
            monthly_cost_usd: self.pricing.cost_usd(&monthly),
        }
    }

    /// Whether the identity may start another metered operation.
    ///
    /// Ceilings are checked daily tokens first, then daily cost, then monthly
    /// cost; the first one reached is reported.
    pub async fn check_limits(&self, identity: &Identity) -> LimitCheck {
        if self.limits.is_unlimited() {
            return LimitCheck::allow();
        }

        let usage = self.get_usage(identity).await;
        let limits = &self.limits;

        let daily_tokens = usage.daily.total_tokens();
        if limits.daily_token_limit > 0 && daily_tokens >= limits.daily_token_limit {
            return LimitCheck::deny(format!(
                "Daily token limit reached: {} of {} tokens used",
                daily_tokens, limits.daily_token_limit
            ));
        }
        if limits.daily_cost_usd > 0.0 && usage.daily_cost_usd >= limits.daily_cost_usd {
            return LimitCheck::deny(format!(
                "Daily cost limit reached: ${:.2} of ${:.2} spent",
                usage.daily_cost_usd, limits.daily_cost_usd
            ));
        }
        if limits.monthly_cost_usd > 0.0 && usage.monthly_cost_usd >= limits.monthly_cost_usd {
            return LimitCheck::deny(format!(
                "Monthly cost limit reached: ${:.2} of ${:.2} spent",
                usage.monthly_cost_usd, limits.monthly_cost_usd
            ));
        }

        LimitCheck::allow()
    }

    async fn read_bucket(
        &self,
        identity: &Identity,
        period: Period,
        now: DateTime<Utc>,
    ) -> UsageBucket {
        let key = period.store_key(identity, now);
        match self.store.hash_get_all(&key).await {
            Ok(fields) => UsageBucket::from_fields(&fields),
            Err(e) => {
                log_fallback(&key, self.store.name(), &e);
                self.local
                    .get(&key)
                    .filter(|usage| usage.expires_at > now)
                    .map(|usage| usage.bucket)
                    .unwrap_or_default()
            }
        }
    }

    fn record_local(
        &self,
        key: String,
        period: Period,
        now: DateTime<Utc>,
        input_tokens: u64,
        output_tokens: u64,
    ) {
        let expires_at = now + chrono::Duration::seconds(period.ttl_secs() as i64);
        let mut usage = self.local.entry(key).or_insert(LocalUsage {
            bucket: UsageBucket::default(),
            expires_at,
        });
        if usage.expires_at <= now {
            usage.bucket = UsageBucket::default();
        }
        usage.bucket.add(input_tokens, output_tokens);
        usage.expires_at = expires_at;
    }

    /// Drop mirrored buckets past their TTL.
    fn sweep(&self, now: DateTime<Utc>) {
        let before = self.local.len();
        self.local.retain(|_, usage| usage.expires_at > now);
        let removed = before.saturating_sub(self.local.len());
        if removed > 0 {
            debug!(removed, "Swept expired local usage buckets");
        }
    }

    /// Number of buckets held in the in-process mirror.
    pub fn local_bucket_count(&self) -> usize {
        self.local.len()
    }
}

fn log_fallback(key: &str, backend: &str, err: &StoreError) {
    match err {
        StoreError::Unavailable => debug!(key, "No store configured, using local usage"),
        _ => warn!(key, backend, error = %err, "Store usage call failed, using local usage"),
    }
}
