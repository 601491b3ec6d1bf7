//! Admission middleware.
//!
//! Every request outside the bypass set is identified, mapped to a bucket
//! and checked against the rate limiter before the inner handler runs.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::context::AppContext;
use crate::ratelimit::AdmissionDecision;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");
pub const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Body of a 429 response.
#[derive(Debug, Serialize)]
pub struct RejectionBody {
    pub error: RejectionDetail,
}

#[derive(Debug, Serialize)]
pub struct RejectionDetail {
    pub code: &'static str,
    pub message: String,
    pub request_id: String,
    pub retry_after: u64,
}

/// Gate a request on its identity's sliding window.
///
/// Install with `axum::middleware::from_fn_with_state`. Allowed responses get
/// `X-RateLimit-*` headers; rejected requests never reach the inner service.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn admission_middleware(
    State(ctx): State<Arc<AppContext>>,
    mut request: Request,
    next: Next,
) -> Response {
    if !ctx.is_enabled() || ctx.bypasses(request.uri().path()) {
        return next.run(request).await;
    }

    let identity = ctx.identify(&request);
    let rule = ctx.buckets.resolve(request.uri().path());
    let decision = ctx
        .limiter
        .check(&identity, rule.name(), rule.limit, rule.window_seconds)
        .await;

    if !decision.allowed {
        let request_id = request_id(request.headers());
        debug!(
            identity = %decision.identity,
            bucket = %decision.bucket,
            request_id = %request_id,
            "Request rejected"
        );
        return reject(&decision, request_id);
    }

    request.extensions_mut().insert(identity);
    let mut response = next.run(request).await;
    apply_limit_headers(response.headers_mut(), &decision);
    response
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(&REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn apply_limit_headers(headers: &mut HeaderMap, decision: &AdmissionDecision) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(decision.reset_after));
}

fn reject(decision: &AdmissionDecision, request_id: String) -> Response {
    let retry_after = decision.reset_after;
    let request_id_value = HeaderValue::from_str(&request_id).ok();

    let body = RejectionBody {
        error: RejectionDetail {
            code: "RATE_LIMITED",
            message: format!("Rate limit exceeded. Try again in {retry_after} seconds."),
            request_id,
            retry_after,
        },
    };

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    apply_limit_headers(headers, decision);
    if let Some(value) = request_id_value {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{body::Body, extract::ConnectInfo, middleware, routing::get, Router};
    use jsonwebtoken::{Algorithm, EncodingKey, Header};
    use tower::ServiceExt;

    use crate::clock::{Clock, ManualClock};
    use crate::config::TollgateConfig;
    use crate::identity::Claims;
    use crate::ratelimit::BucketRule;
    use crate::store::{DistributedStore, MemoryStore, UnavailableStore};

    const SECRET: &str = "middleware-test-secret";

    struct Harness {
        app: Router,
        hits: Arc<AtomicUsize>,
    }

    fn config() -> TollgateConfig {
        let mut config = TollgateConfig::default();
        config.rate_limiting.default_limit = 3;
        config.rate_limiting.default_window_seconds = 60;
        config.rate_limiting.rules = vec![
            BucketRule::new("/api/v1", 5, 60),
            BucketRule::new("/api/v1/query", 1, 60),
        ];
        config.auth.jwt_secret = Some(SECRET.to_string());
        config
    }

    fn harness_with(config: TollgateConfig, store: Option<Arc<dyn DistributedStore>>) -> Harness {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let store = match store {
            Some(store) => store,
            None => Arc::new(MemoryStore::new(Arc::clone(&clock))),
        };
        let ctx = Arc::new(AppContext::from_parts(&config, store, clock).unwrap());

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let handler = move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                "ok"
            }
        };

        let app = Router::new()
            .route("/api/v1/query", get(handler.clone()))
            .route("/api/v1/items", get(handler.clone()))
            .route("/other", get(handler.clone()))
            .route("/health", get(handler))
            .layer(middleware::from_fn_with_state(ctx, admission_middleware));

        Harness { app, hits }
    }

    fn harness() -> Harness {
        harness_with(config(), None)
    }

    fn get_from(path: &str, peer: &str) -> Request {
        let mut request = Request::builder().uri(path).body(Body::empty()).unwrap();
        let addr: SocketAddr = peer.parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));
        request
    }

    fn bearer(sub: &str) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            token_type: "access".to_string(),
            exp: 9_999_999_999,
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        format!("Bearer {token}")
    }

    async fn send(app: &Router, request: Request) -> Response {
        app.clone().oneshot(request).await.unwrap()
    }

    fn header_u64(response: &Response, name: &HeaderName) -> u64 {
        response.headers()[name].to_str().unwrap().parse().unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_allowed_responses_carry_limit_headers() {
        let h = harness();

        let response = send(&h.app, get_from("/api/v1/items", "10.0.0.1:1000")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_u64(&response, &RATE_LIMIT_LIMIT), 5);
        assert_eq!(header_u64(&response, &RATE_LIMIT_REMAINING), 4);
        assert_eq!(header_u64(&response, &RATE_LIMIT_RESET), 60);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
        assert_eq!(h.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejection_is_well_formed_429() {
        let h = harness();

        let first = send(&h.app, get_from("/api/v1/query", "10.0.0.1:1000")).await;
        assert_eq!(first.status(), StatusCode::OK);

        let mut request = get_from("/api/v1/query", "10.0.0.1:1001");
        request
            .headers_mut()
            .insert(REQUEST_ID_HEADER, HeaderValue::from_static("req-123"));
        let rejected = send(&h.app, request).await;

        assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(h.hits.load(Ordering::SeqCst), 1);

        let retry_after = header_u64(&rejected, &header::RETRY_AFTER);
        assert!((1..=60).contains(&retry_after));
        assert_eq!(header_u64(&rejected, &RATE_LIMIT_LIMIT), 1);
        assert_eq!(header_u64(&rejected, &RATE_LIMIT_REMAINING), 0);
        assert_eq!(header_u64(&rejected, &RATE_LIMIT_RESET), retry_after);
        assert_eq!(rejected.headers()[&REQUEST_ID_HEADER], "req-123");

        let body = json_body(rejected).await;
        assert_eq!(body["error"]["code"], "RATE_LIMITED");
        assert_eq!(body["error"]["request_id"], "req-123");
        assert_eq!(body["error"]["retry_after"], retry_after);
        assert!(body["error"]["message"].as_str().unwrap().contains("Rate limit"));
    }

    #[tokio::test]
    async fn test_missing_request_id_is_generated() {
        let h = harness();

        send(&h.app, get_from("/api/v1/query", "10.0.0.1:1000")).await;
        let rejected = send(&h.app, get_from("/api/v1/query", "10.0.0.1:1000")).await;

        let header_id = rejected.headers()[&REQUEST_ID_HEADER]
            .to_str()
            .unwrap()
            .to_string();
        assert!(Uuid::parse_str(&header_id).is_ok());

        let body = json_body(rejected).await;
        assert_eq!(body["error"]["request_id"], header_id.as_str());
    }

    #[tokio::test]
    async fn test_longest_prefix_rule_applies() {
        let h = harness();

        // `/api/v1/query` allows one request; `/api/v1` allows five.
        assert_eq!(
            send(&h.app, get_from("/api/v1/query", "10.0.0.1:1")).await.status(),
            StatusCode::OK
        );
        assert_eq!(
            send(&h.app, get_from("/api/v1/query", "10.0.0.1:1")).await.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        for _ in 0..5 {
            let response = send(&h.app, get_from("/api/v1/items", "10.0.0.1:1")).await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        let other = send(&h.app, get_from("/other", "10.0.0.1:1")).await;
        assert_eq!(header_u64(&other, &RATE_LIMIT_LIMIT), 3);
    }

    #[tokio::test]
    async fn test_bypass_paths_are_untouched() {
        let h = harness();

        for _ in 0..20 {
            let response = send(&h.app, get_from("/health", "10.0.0.1:1")).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get(&RATE_LIMIT_LIMIT).is_none());
        }
        assert_eq!(h.hits.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_disabled_forwards_without_headers() {
        let mut config = config();
        config.rate_limiting.enabled = false;
        let h = harness_with(config, None);

        for _ in 0..5 {
            let response = send(&h.app, get_from("/api/v1/query", "10.0.0.1:1")).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get(&RATE_LIMIT_LIMIT).is_none());
        }
    }

    #[tokio::test]
    async fn test_users_behind_one_address_are_counted_separately() {
        let h = harness();

        for user in ["alice", "bob"] {
            let mut request = get_from("/api/v1/query", "10.0.0.9:1");
            request
                .headers_mut()
                .insert(header::AUTHORIZATION, bearer(user).parse().unwrap());
            assert_eq!(send(&h.app, request).await.status(), StatusCode::OK);
        }

        // The shared address has its own, still unused, counter.
        let anonymous = send(&h.app, get_from("/api/v1/query", "10.0.0.9:1")).await;
        assert_eq!(anonymous.status(), StatusCode::OK);

        let mut again = get_from("/api/v1/query", "10.0.0.9:1");
        again
            .headers_mut()
            .insert(header::AUTHORIZATION, bearer("alice").parse().unwrap());
        assert_eq!(send(&h.app, again).await.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_store_outage_still_limits() {
        let h = harness_with(config(), Some(Arc::new(UnavailableStore)));

        let first = send(&h.app, get_from("/api/v1/query", "10.0.0.1:1")).await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(header_u64(&first, &RATE_LIMIT_REMAINING), 0);

        let second = send(&h.app, get_from("/api/v1/query", "10.0.0.1:1")).await;
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
