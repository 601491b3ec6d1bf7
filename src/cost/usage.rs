//! Usage counters, pricing and cost ceilings.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::Identity;

pub(crate) const INPUT_FIELD: &str = "input_tokens";
pub(crate) const OUTPUT_FIELD: &str = "output_tokens";

/// Token counts accumulated over one calendar period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageBucket {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl UsageBucket {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    pub(crate) fn add(&mut self, input_tokens: u64, output_tokens: u64) {
        self.input_tokens = self.input_tokens.saturating_add(input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(output_tokens);
    }

    /// Read a bucket back from store hash fields. Missing or negative fields
    /// count as zero.
    pub(crate) fn from_fields(fields: &HashMap<String, i64>) -> Self {
        let read = |name: &str| fields.get(name).copied().unwrap_or(0).max(0) as u64;
        Self {
            input_tokens: read(INPUT_FIELD),
            output_tokens: read(OUTPUT_FIELD),
        }
    }
}

/// Per-million-token prices.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    #[serde(default = "default_input_price")]
    pub input_price_per_million_usd: f64,
    #[serde(default = "default_output_price")]
    pub output_price_per_million_usd: f64,
}

fn default_input_price() -> f64 {
    3.0
}

fn default_output_price() -> f64 {
    15.0
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            input_price_per_million_usd: default_input_price(),
            output_price_per_million_usd: default_output_price(),
        }
    }
}

impl Pricing {
    pub fn new(input_price_per_million_usd: f64, output_price_per_million_usd: f64) -> Self {
        Self {
            input_price_per_million_usd,
            output_price_per_million_usd,
        }
    }

    /// Dollar cost of the tokens in `bucket`.
    pub fn cost_usd(&self, bucket: &UsageBucket) -> f64 {
        bucket.input_tokens as f64 / 1_000_000.0 * self.input_price_per_million_usd
            + bucket.output_tokens as f64 / 1_000_000.0 * self.output_price_per_million_usd
    }
}

/// Spending ceilings. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostLimits {
    #[serde(default)]
    pub daily_cost_usd: f64,
    #[serde(default)]
    pub monthly_cost_usd: f64,
    #[serde(default)]
    pub daily_token_limit: u64,
}

impl CostLimits {
    pub fn is_unlimited(&self) -> bool {
        self.daily_cost_usd == 0.0 && self.monthly_cost_usd == 0.0 && self.daily_token_limit == 0
    }
}

/// Read-only view of one identity's spend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSummary {
    pub identity: Identity,
    /// UTC day the daily bucket covers, `YYYY-MM-DD`
    pub day: String,
    /// UTC month the monthly bucket covers, `YYYY-MM`
    pub month: String,
    pub daily: UsageBucket,
    pub monthly: UsageBucket,
    pub daily_cost_usd: f64,
    pub monthly_cost_usd: f64,
}

/// Result of checking an identity against its ceilings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitCheck {
    pub allowed: bool,
    /// Human-readable reason for a refusal; empty when allowed
    pub reason: String,
}

impl LimitCheck {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: String::new(),
        }
    }

    pub fn deny(reason: String) -> Self {
        Self {
            allowed: false,
            reason,
        }
    }
}

/// Calendar period a usage bucket covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Period {
    Daily,
    Monthly,
}

impl Period {
    pub(crate) const ALL: [Period; 2] = [Period::Daily, Period::Monthly];

    /// How long a bucket outlives its last write. Longer than the period
    /// itself to tolerate clock skew and late reads.
    pub(crate) fn ttl_secs(self) -> u64 {
        match self {
            Period::Daily => 25 * 3600,
            Period::Monthly => 32 * 86400,
        }
    }

    pub(crate) fn label(self, now: DateTime<Utc>) -> String {
        match self {
            Period::Daily => now.format("%Y-%m-%d").to_string(),
            Period::Monthly => now.format("%Y-%m").to_string(),
        }
    }

    pub(crate) fn store_key(self, identity: &Identity, now: DateTime<Utc>) -> String {
        let name = match self {
            Period::Daily => "daily",
            Period::Monthly => "monthly",
        };
        format!("usage:{identity}:{name}:{}", self.label(now))
    }
}
