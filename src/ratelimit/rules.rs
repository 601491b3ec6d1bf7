//! Bucket rules and path matching.
//!
//! A bucket is a named `(limit, window)` pair selected by request path. Rules
//! are matched by longest `path_prefix`; when two prefixes have the same
//! length the one listed first in configuration wins. Paths no rule covers
//! fall into the synthetic `_default` bucket.

use std::cmp::Reverse;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::window::{GRACE_SECS, MICROS_PER_SEC};
use crate::error::{Result, TollgateError};

/// Name of the bucket used when no rule matches.
pub const DEFAULT_BUCKET: &str = "_default";

/// Longest window whose span in microseconds, plus the idle grace, still fits
/// in an `i64` timestamp.
pub const MAX_WINDOW_SECONDS: u64 = (i64::MAX / MICROS_PER_SEC) as u64 - GRACE_SECS;

/// A rate limit rule bound to a path prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRule {
    /// Requests whose path starts with this prefix use this rule
    pub path_prefix: String,
    /// Number of requests admitted per window
    pub limit: u64,
    /// Length of the sliding window
    pub window_seconds: u64,
    /// Free-form note for operators
    #[serde(default)]
    pub description: String,
}

impl BucketRule {
    pub fn new(path_prefix: &str, limit: u64, window_seconds: u64) -> Self {
        Self {
            path_prefix: path_prefix.to_string(),
            limit,
            window_seconds,
            description: String::new(),
        }
    }

    /// Bucket name reported in decisions and used in window keys.
    pub fn name(&self) -> &str {
        &self.path_prefix
    }

    /// Reject rules that could never admit anything.
    pub fn validate(&self) -> Result<()> {
        if self.path_prefix.is_empty() {
            return Err(TollgateError::Config(
                "rate limit rule has an empty path_prefix".to_string(),
            ));
        }
        if self.limit == 0 {
            return Err(TollgateError::Config(format!(
                "rate limit rule '{}' must have limit > 0",
                self.path_prefix
            )));
        }
        check_window(&self.path_prefix, self.window_seconds)
    }
}

fn check_window(name: &str, window_seconds: u64) -> Result<()> {
    if window_seconds == 0 || window_seconds > MAX_WINDOW_SECONDS {
        return Err(TollgateError::Config(format!(
            "rate limit rule '{}' must have window_seconds in 1..={}",
            name, MAX_WINDOW_SECONDS
        )));
    }
    Ok(())
}

/// Maps request paths to bucket rules.
#[derive(Debug, Clone)]
pub struct BucketResolver {
    /// Rules sorted by descending prefix length, ties in configuration order
    rules: Vec<BucketRule>,
    default_rule: BucketRule,
}

impl BucketResolver {
    /// Build a resolver, validating every rule and the default.
    pub fn new(
        rules: Vec<BucketRule>,
        default_limit: u64,
        default_window_seconds: u64,
    ) -> Result<Self> {
        let default_rule = BucketRule {
            path_prefix: DEFAULT_BUCKET.to_string(),
            limit: default_limit,
            window_seconds: default_window_seconds,
            description: "fallback for paths without a rule".to_string(),
        };
        if default_limit == 0 {
            return Err(TollgateError::Config("default_limit must be > 0".to_string()));
        }
        check_window(DEFAULT_BUCKET, default_window_seconds)?;

        let mut rules = rules;
        for rule in &rules {
            rule.validate()?;
        }
        // sort_by_key is stable, which keeps configuration order for ties.
        rules.sort_by_key(|rule| Reverse(rule.path_prefix.len()));

        debug!(rules = rules.len(), "Bucket resolver built");
        Ok(Self {
            rules,
            default_rule,
        })
    }

    /// Find the rule for `path`.
    pub fn resolve(&self, path: &str) -> &BucketRule {
        self.rules
            .iter()
            .find(|rule| path.starts_with(&rule.path_prefix))
            .unwrap_or(&self.default_rule)
    }

    /// Rules in match order.
    pub fn rules(&self) -> &[BucketRule] {
        &self.rules
    }

    pub fn default_rule(&self) -> &BucketRule {
        &self.default_rule
    }
}
