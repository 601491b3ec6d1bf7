//! Token and dollar-cost metering for expensive backend calls.
//!
//! Route handlers call [`CostController::check_limits`] before starting a
//! metered operation and [`CostController::record_cost`] once it completes.

mod controller;
mod usage;

pub use controller::CostController;
pub use usage::{CostLimits, LimitCheck, Pricing, UsageBucket, UsageSummary};
