//! HTTP surface: admission middleware, built-in routes and the server.

mod context;
mod handlers;
mod middleware;
mod server;

use std::sync::Arc;

use axum::{routing::get, Router};

pub use context::AppContext;
pub use handlers::{health, usage, UsageResponse};
pub use middleware::{
    admission_middleware, RejectionBody, RejectionDetail, RATE_LIMIT_LIMIT, RATE_LIMIT_REMAINING,
    RATE_LIMIT_RESET, REQUEST_ID_HEADER,
};
pub use server::HttpServer;

/// Routes served by the binary, wrapped in admission control.
///
/// Applications embedding Tollgate can merge their own routes before the
/// layer is applied, or install [`admission_middleware`] on their router
/// directly.
pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/usage", get(usage))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&ctx),
            admission_middleware,
        ))
        .with_state(ctx)
}
