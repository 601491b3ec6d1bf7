//! Built-in route handlers.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    response::Json,
};
use serde::Serialize;
use serde_json::{json, Value};

use super::context::AppContext;
use crate::cost::{LimitCheck, UsageSummary};

/// Liveness probe. Always in the bypass set.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Caller's current spend and whether another metered call would be allowed.
#[derive(Debug, Serialize)]
pub struct UsageResponse {
    #[serde(flatten)]
    pub usage: UsageSummary,
    pub limits: LimitCheck,
}

pub async fn usage(State(ctx): State<Arc<AppContext>>, request: Request) -> Json<UsageResponse> {
    let identity = ctx.identify(&request);
    let usage = ctx.costs.get_usage(&identity).await;
    let limits = ctx.costs.check_limits(&identity).await;
    Json(UsageResponse { usage, limits })
}
