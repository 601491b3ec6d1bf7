//! Shared application state.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request};
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::TollgateConfig;
use crate::cost::CostController;
use crate::error::{Result, TollgateError};
use crate::identity::{Identity, IdentityResolver};
use crate::ratelimit::{BucketResolver, RateLimiter};
use crate::store::{self, DistributedStore, StoreError};

/// Everything a request needs for admission and metering, built once at
/// startup and shared behind an `Arc`.
pub struct AppContext {
    pub identity: IdentityResolver,
    pub buckets: BucketResolver,
    pub limiter: RateLimiter,
    pub costs: CostController,
    skip_paths: HashSet<String>,
    enabled: bool,
}

impl AppContext {
    /// Build the context from validated configuration, connecting to the
    /// configured store.
    pub fn build(config: &TollgateConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let rate_limiting = &config.rate_limiting;

        let store = store::connect(
            rate_limiting.store_url.as_deref(),
            rate_limiting.store_timeout(),
            Arc::clone(&clock),
        )
        .map_err(|e| match e {
            StoreError::InvalidUrl(url) => {
                TollgateError::Config(format!("Unsupported store_url scheme: {url}"))
            }
            other => TollgateError::Store(other),
        })?;

        Self::from_parts(config, store, clock)
    }

    /// Assemble the context around an existing store and clock.
    pub fn from_parts(
        config: &TollgateConfig,
        store: Arc<dyn DistributedStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let rate_limiting = &config.rate_limiting;
        let buckets = rate_limiting.bucket_resolver()?;

        info!(
            enabled = rate_limiting.enabled,
            rules = buckets.rules().len(),
            default_limit = rate_limiting.default_limit,
            default_window_seconds = rate_limiting.default_window_seconds,
            "Admission control configured"
        );

        Ok(Self {
            identity: IdentityResolver::from_secret(config.auth.jwt_secret.as_deref()),
            buckets,
            limiter: RateLimiter::new(
                Arc::clone(&store),
                Arc::clone(&clock),
                rate_limiting.sweep_every,
            ),
            costs: CostController::new(
                store,
                clock,
                config.cost.pricing(),
                config.cost.limits,
                rate_limiting.sweep_every,
            ),
            skip_paths: rate_limiting.all_skip_paths(),
            enabled: rate_limiting.enabled,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Paths that skip admission entirely.
    pub fn bypasses(&self, path: &str) -> bool {
        self.skip_paths.contains(path)
    }

    /// Resolve who is making `request`.
    pub fn identify(&self, request: &Request) -> Identity {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        self.identity.resolve(request.headers(), peer)
    }
}
