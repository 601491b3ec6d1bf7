//! Configuration management for Tollgate.
//!
//! Settings come from an optional YAML file layered under environment
//! variables prefixed `TOLLGATE__` (sections separated by `__`, for example
//! `TOLLGATE__RATE_LIMITING__DEFAULT_LIMIT=100`). Every field has a default,
//! so an empty configuration is valid.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cost::{CostLimits, Pricing};
use crate::error::{Result, TollgateError};
use crate::ratelimit::{BucketResolver, BucketRule};

/// Paths that never pass through admission control.
pub const BUILTIN_SKIP_PATHS: &[&str] = &[
    "/health",
    "/healthz",
    "/ready",
    "/docs",
    "/redoc",
    "/openapi.json",
    "/favicon.ico",
];

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Cost metering configuration
    #[serde(default)]
    pub cost: CostConfig,

    /// Bearer token verification
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// When false, requests pass straight through
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Limit for paths no rule covers
    #[serde(default = "default_limit")]
    pub default_limit: u64,

    /// Window for paths no rule covers
    #[serde(default = "default_window_seconds")]
    pub default_window_seconds: u64,

    /// Distributed store URL (`redis://...` or `memory://`); unset means
    /// process-local counting only
    #[serde(default)]
    pub store_url: Option<String>,

    /// Upper bound on any single store round-trip
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Local fallback checks between sweeps of idle windows
    #[serde(default = "default_sweep_every")]
    pub sweep_every: u64,

    /// Extra paths exempt from limiting, on top of the built-ins
    #[serde(default)]
    pub skip_paths: Vec<String>,

    /// Per-prefix rules, in priority order for equal-length prefixes
    #[serde(default)]
    pub rules: Vec<BucketRule>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            default_limit: default_limit(),
            default_window_seconds: default_window_seconds(),
            store_url: None,
            store_timeout_ms: default_store_timeout_ms(),
            sweep_every: default_sweep_every(),
            skip_paths: Vec::new(),
            rules: Vec::new(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_limit() -> u64 {
    100
}

fn default_window_seconds() -> u64 {
    60
}

fn default_store_timeout_ms() -> u64 {
    2000
}

fn default_sweep_every() -> u64 {
    500
}

impl RateLimitingConfig {
    /// Configured skip paths merged with [`BUILTIN_SKIP_PATHS`].
    pub fn all_skip_paths(&self) -> HashSet<String> {
        BUILTIN_SKIP_PATHS
            .iter()
            .map(|p| p.to_string())
            .chain(self.skip_paths.iter().cloned())
            .collect()
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Build the path resolver for the configured rules.
    pub fn bucket_resolver(&self) -> Result<BucketResolver> {
        BucketResolver::new(
            self.rules.clone(),
            self.default_limit,
            self.default_window_seconds,
        )
    }
}

/// Cost metering configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostConfig {
    #[serde(default = "default_input_price")]
    pub input_price_per_million_usd: f64,

    #[serde(default = "default_output_price")]
    pub output_price_per_million_usd: f64,

    /// Spending ceilings; zero disables a ceiling
    #[serde(default)]
    pub limits: CostLimits,
}

impl Default for CostConfig {
    fn default() -> Self {
        let pricing = Pricing::default();
        Self {
            input_price_per_million_usd: pricing.input_price_per_million_usd,
            output_price_per_million_usd: pricing.output_price_per_million_usd,
            limits: CostLimits::default(),
        }
    }
}

fn default_input_price() -> f64 {
    Pricing::default().input_price_per_million_usd
}

fn default_output_price() -> f64 {
    Pricing::default().output_price_per_million_usd
}

impl CostConfig {
    pub fn pricing(&self) -> Pricing {
        Pricing::new(self.input_price_per_million_usd, self.output_price_per_million_usd)
    }
}

/// Bearer token verification settings.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret for access tokens; without it every caller is identified
    /// by address
    #[serde(default)]
    pub jwt_secret: Option<String>,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl TollgateConfig {
    /// Load from an optional file plus `TOLLGATE__*` environment variables,
    /// then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("TOLLGATE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: TollgateConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot be served. This is the only check that
    /// stops startup.
    pub fn validate(&self) -> Result<()> {
        let rate_limiting = &self.rate_limiting;
        rate_limiting.bucket_resolver()?;

        if rate_limiting.sweep_every == 0 {
            return Err(TollgateError::Config("sweep_every must be > 0".to_string()));
        }
        if rate_limiting.store_timeout_ms == 0 {
            return Err(TollgateError::Config("store_timeout_ms must be > 0".to_string()));
        }

        let cost = &self.cost;
        let amounts = [
            ("input_price_per_million_usd", cost.input_price_per_million_usd),
            ("output_price_per_million_usd", cost.output_price_per_million_usd),
            ("limits.daily_cost_usd", cost.limits.daily_cost_usd),
            ("limits.monthly_cost_usd", cost.limits.monthly_cost_usd),
        ];
        for (name, value) in amounts {
            if !value.is_finite() || value < 0.0 {
                return Err(TollgateError::Config(format!(
                    "cost.{name} must be a non-negative number, got {value}"
                )));
            }
        }

        Ok(())
    }
}
