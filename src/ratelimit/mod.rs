//! Sliding-window rate limiting.

mod key;
mod limiter;
mod rules;
mod window;

pub use key::WindowKey;
pub use limiter::{AdmissionDecision, RateLimiter};
pub use rules::{BucketResolver, BucketRule, DEFAULT_BUCKET, MAX_WINDOW_SECONDS};
pub use window::{LocalWindows, Tally};
