//! Proxy and aggregation routing
//!
//! Translates each public route into one (or, for the user-details route,
//! two concurrent) breaker-guarded upstream calls. The correlation id and
//! the caller's Authorization header travel with every upstream call; the
//! verified subject id is injected into order-creation bodies so callers
//! cannot spoof ownership.

use std::sync::Arc;

use axum::{
    extract::{Path, RawQuery, State},
    http::{HeaderMap, Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::{json, Map, Value};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::auth::{self, AuthUser};
use crate::breaker::{BreakerConfig, CircuitBreaker, FireError, UpstreamRequest, UpstreamResponse};
use crate::config::GatewayConfig;
use crate::context::{self, RequestContext, REQUEST_ID_HEADER};
use crate::envelope::{Envelope, GatewayError, UpstreamBody};
use crate::health::HealthChecker;
use crate::metrics::GatewayMetrics;
use crate::rate_limit::{self, RateLimiter};

/// Application state shared across handlers; the breakers live here for the
/// process lifetime and are never recreated per request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub users_breaker: Arc<CircuitBreaker>,
    pub orders_breaker: Arc<CircuitBreaker>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: Arc<GatewayMetrics>,
    pub health: Arc<HealthChecker>,
}

impl AppState {
    pub fn from_config(config: GatewayConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().build()?;
        let breaker_config = BreakerConfig::from(&config.breaker);

        let users_breaker = Arc::new(CircuitBreaker::new(
            "users",
            breaker_config.clone(),
            client.clone(),
            Envelope::error(
                "service_unavailable",
                "Users service temporarily unavailable",
            ),
        ));
        let orders_breaker = Arc::new(CircuitBreaker::new(
            "orders",
            breaker_config,
            client,
            Envelope::error(
                "service_unavailable",
                "Orders service temporarily unavailable",
            ),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit.window(),
            config.rate_limit.max_requests,
        ));

        Ok(Self {
            config: Arc::new(config),
            users_breaker,
            orders_breaker,
            rate_limiter,
            metrics: Arc::new(GatewayMetrics::new()),
            health: Arc::new(HealthChecker::new()),
        })
    }
}

/// Build the gateway router. Layer order, outermost first: trace, CORS,
/// correlation, rate limiting; authentication applies only to protected
/// routes.
pub fn app(state: AppState) -> Router {
    let public = Router::new()
        .route("/api/v1/auth/register", post(register))
        .route("/api/v1/auth/login", post(login));

    let protected = Router::new()
        .route("/api/v1/users/me", get(users_me))
        .route("/api/v1/users", get(users_list))
        .route("/api/v1/users/:user_id/details", get(user_details))
        .route("/api/v1/orders", post(orders_create).get(orders_list))
        .route(
            "/api/v1/orders/:id",
            get(orders_get).put(orders_update).delete(orders_delete),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .merge(public)
        .merge(protected)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            context::correlation_middleware,
        ))
        .layer(cors_layer(&state.config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(config: &GatewayConfig) -> CorsLayer {
    if config.cors.allowed_origin == "*" {
        return CorsLayer::permissive();
    }
    match config.cors.allowed_origin.parse::<axum::http::HeaderValue>() {
        Ok(origin) => CorsLayer::new()
            .allow_origin(AllowOrigin::exact(origin))
            .allow_methods(Any)
            .allow_headers(Any),
        Err(_) => {
            tracing::warn!(
                origin = %config.cors.allowed_origin,
                "invalid CORS origin, falling back to permissive"
            );
            CorsLayer::permissive()
        }
    }
}

/// Join an upstream base URL and a path, tolerating a trailing slash on the
/// base.
fn upstream_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

/// Append a caller-supplied query string verbatim
fn with_query(url: String, query: Option<String>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{}?{}", url, q),
        _ => url,
    }
}

/// Attach the headers every upstream call carries: the correlation id and,
/// when present, the caller's bearer credential.
fn forwarded(request: UpstreamRequest, ctx: &RequestContext, headers: &HeaderMap) -> UpstreamRequest {
    let mut request = request.header(REQUEST_ID_HEADER, ctx.request_id.clone());
    if let Some(authorization) = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
    {
        request = request.header("authorization", authorization.to_string());
    }
    request
}

/// Map a breaker outcome to the response the caller sees:
/// - enveloped upstream bodies pass through with the upstream's status
/// - raw success bodies are wrapped in a success envelope
/// - open circuit, timeouts, transport errors and unenveloped upstream
///   failures yield the breaker's fallback with 503
fn upstream_reply(
    result: Result<UpstreamResponse, FireError>,
    fallback: &Envelope,
    request_id: &str,
) -> (StatusCode, Value) {
    match result {
        Ok(response) => {
            let status = StatusCode::from_u16(response.status)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            match response.body {
                body @ UpstreamBody::Enveloped { .. } => (status, body.into_wire()),
                UpstreamBody::Raw(value) => {
                    if response.status >= 400 && response.status != 404 {
                        (StatusCode::SERVICE_UNAVAILABLE, fallback.to_value())
                    } else {
                        (status, Envelope::success(value).to_value())
                    }
                }
            }
        }
        Err(FireError::Open(upstream)) => {
            tracing::warn!(req_id = %request_id, %upstream, "circuit open, returning fallback");
            (StatusCode::SERVICE_UNAVAILABLE, fallback.to_value())
        }
        // A request that never made it onto the wire is a gateway fault,
        // not an upstream one.
        Err(FireError::Transport(err)) if err.is_builder() => {
            tracing::error!(req_id = %request_id, error = %err, "internal proxy fault");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Envelope::error("internal_error", "Internal server error").to_value(),
            )
        }
        Err(err) => {
            tracing::error!(req_id = %request_id, error = %err, "proxy error");
            (StatusCode::SERVICE_UNAVAILABLE, fallback.to_value())
        }
    }
}

async fn proxy_to(
    breaker: &CircuitBreaker,
    request: UpstreamRequest,
    ctx: &RequestContext,
) -> Response {
    let fallback = breaker.fallback();
    let (status, body) = upstream_reply(breaker.fire(request).await, &fallback, &ctx.request_id);
    (status, Json(body)).into_response()
}

/* --- Public identity routes --- */

async fn register(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Response {
    let url = upstream_url(&state.config.upstream.users_url, "/users");
    let request = UpstreamRequest::new(Method::POST, url)
        .json(body.map(|Json(value)| value).unwrap_or(Value::Null));
    proxy_to(&state.users_breaker, forwarded(request, &ctx, &headers), &ctx).await
}

async fn login(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Response {
    let url = upstream_url(&state.config.upstream.users_url, "/auth/login");
    let request = UpstreamRequest::new(Method::POST, url)
        .json(body.map(|Json(value)| value).unwrap_or(Value::Null));
    proxy_to(&state.users_breaker, forwarded(request, &ctx, &headers), &ctx).await
}

/* --- Protected identity routes --- */

async fn users_me(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Extension(user): Extension<AuthUser>,
    headers: HeaderMap,
) -> Response {
    let url = upstream_url(
        &state.config.upstream.users_url,
        &format!("/users/{}", user.subject),
    );
    let request = UpstreamRequest::get(url);
    proxy_to(&state.users_breaker, forwarded(request, &ctx, &headers), &ctx).await
}

async fn users_list(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Extension(user): Extension<AuthUser>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    if !user.is_admin() {
        return GatewayError::Forbidden("Admin only".to_string()).into_response();
    }
    let url = with_query(
        upstream_url(&state.config.upstream.users_url, "/users"),
        query,
    );
    let request = UpstreamRequest::get(url);
    proxy_to(&state.users_breaker, forwarded(request, &ctx, &headers), &ctx).await
}

/* --- Order routes --- */

async fn orders_create(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Extension(user): Extension<AuthUser>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Response {
    // The verified subject owns the order, whatever the caller claimed.
    let mut payload = match body {
        Some(Json(Value::Object(map))) => map,
        _ => Map::new(),
    };
    payload.insert("userId".to_string(), Value::String(user.subject.clone()));

    let url = upstream_url(&state.config.upstream.orders_url, "/orders");
    let request = UpstreamRequest::new(Method::POST, url).json(Value::Object(payload));
    proxy_to(&state.orders_breaker, forwarded(request, &ctx, &headers), &ctx).await
}

async fn orders_get(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let url = upstream_url(&state.config.upstream.orders_url, &format!("/orders/{}", id));
    let request = UpstreamRequest::get(url);
    proxy_to(&state.orders_breaker, forwarded(request, &ctx, &headers), &ctx).await
}

async fn orders_list(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let url = with_query(
        upstream_url(&state.config.upstream.orders_url, "/orders"),
        query,
    );
    let request = UpstreamRequest::get(url);
    proxy_to(&state.orders_breaker, forwarded(request, &ctx, &headers), &ctx).await
}

async fn orders_update(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<Json<Value>>,
) -> Response {
    let url = upstream_url(&state.config.upstream.orders_url, &format!("/orders/{}", id));
    let request = UpstreamRequest::new(Method::PUT, url)
        .json(body.map(|Json(value)| value).unwrap_or(Value::Null));
    proxy_to(&state.orders_breaker, forwarded(request, &ctx, &headers), &ctx).await
}

async fn orders_delete(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let url = upstream_url(&state.config.upstream.orders_url, &format!("/orders/{}", id));
    let request = UpstreamRequest::new(Method::DELETE, url);
    proxy_to(&state.orders_breaker, forwarded(request, &ctx, &headers), &ctx).await
}

/* --- Aggregation --- */

async fn user_details(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Response {
    let user_url = upstream_url(
        &state.config.upstream.users_url,
        &format!("/users/{}", user_id),
    );
    let orders_url = upstream_url(
        &state.config.upstream.orders_url,
        &format!("/orders?userId={}", user_id),
    );

    // Both calls start before either is awaited; join semantics.
    let (user_reply, orders_reply) = tokio::join!(
        state
            .users_breaker
            .fire(forwarded(UpstreamRequest::get(user_url), &ctx, &headers)),
        state
            .orders_breaker
            .fire(forwarded(UpstreamRequest::get(orders_url), &ctx, &headers)),
    );

    let (status, body) = merge_user_details(
        user_reply,
        orders_reply,
        &state.users_breaker.fallback(),
        &state.orders_breaker.fallback(),
        &ctx.request_id,
    );
    (status, Json(body)).into_response()
}

/// Merge the two upstream replies. An identity error short-circuits to 404
/// carrying the identity body, discarding the orders result; otherwise both
/// payloads are merged into one `{user, orders}` envelope. A failed orders
/// call degrades to the orders fallback inside the merge.
fn merge_user_details(
    user_reply: Result<UpstreamResponse, FireError>,
    orders_reply: Result<UpstreamResponse, FireError>,
    users_fallback: &Envelope,
    orders_fallback: &Envelope,
    request_id: &str,
) -> (StatusCode, Value) {
    let user = match user_reply {
        Ok(response) if response.body.is_error() || response.status == 404 => {
            return (StatusCode::NOT_FOUND, response.body.into_wire());
        }
        Ok(response) => response.body.into_data(),
        Err(err) => {
            tracing::error!(req_id = %request_id, error = %err, "identity call failed");
            return (StatusCode::SERVICE_UNAVAILABLE, users_fallback.to_value());
        }
    };

    let orders = match orders_reply {
        Ok(response) if response.body.is_error() => response.body.into_wire(),
        Ok(response) => response.body.into_data(),
        Err(err) => {
            tracing::error!(req_id = %request_id, error = %err, "orders call failed");
            orders_fallback.to_value()
        }
    };

    (
        StatusCode::OK,
        Envelope::success(json!({ "user": user, "orders": orders })).to_value(),
    )
}

/* --- Operational endpoints --- */

async fn health_handler(State(state): State<AppState>) -> Response {
    let report = state.health.report(
        state.users_breaker.snapshot(),
        state.orders_breaker.snapshot(),
    );
    let body = serde_json::to_value(&report).unwrap_or(Value::Null);
    Json(Envelope::success(body)).into_response()
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    (StatusCode::OK, state.metrics.prometheus_output()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enveloped(status: u16, body: Value) -> Result<UpstreamResponse, FireError> {
        Ok(UpstreamResponse {
            status,
            body: UpstreamBody::classify(body),
        })
    }

    fn fallback(message: &str) -> Envelope {
        Envelope::error("service_unavailable", message)
    }

    #[test]
    fn test_upstream_url_join() {
        assert_eq!(
            upstream_url("http://localhost:8001", "/users"),
            "http://localhost:8001/users"
        );
        assert_eq!(
            upstream_url("http://localhost:8001/", "/users/u1"),
            "http://localhost:8001/users/u1"
        );
    }

    #[test]
    fn test_with_query_passthrough() {
        let base = "http://localhost:8002/orders".to_string();
        assert_eq!(
            with_query(base.clone(), Some("page=2&limit=5".to_string())),
            "http://localhost:8002/orders?page=2&limit=5"
        );
        assert_eq!(with_query(base.clone(), Some(String::new())), base);
        assert_eq!(with_query(base.clone(), None), base);
    }

    #[test]
    fn test_reply_passes_enveloped_body_through() {
        let upstream = json!({"success": true, "data": {"id": "u1"}});
        let (status, body) = upstream_reply(enveloped(201, upstream.clone()), &fallback("f"), "rid");
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body, upstream);
    }

    #[test]
    fn test_reply_keeps_upstream_error_status() {
        let upstream = json!({"success": false, "error": {"code": "validation", "message": "items required"}});
        let (status, body) = upstream_reply(enveloped(400, upstream.clone()), &fallback("f"), "rid");
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, upstream);
    }

    #[test]
    fn test_reply_wraps_raw_success() {
        let (status, body) = upstream_reply(enveloped(200, json!({"id": "u1"})), &fallback("f"), "rid");
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["data"]["id"], json!("u1"));
    }

    #[test]
    fn test_reply_open_circuit_returns_fallback() {
        let (status, body) = upstream_reply(
            Err(FireError::Open("users".to_string())),
            &fallback("Users service temporarily unavailable"),
            "rid",
        );
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["code"], json!("service_unavailable"));
    }

    #[test]
    fn test_reply_timeout_returns_fallback() {
        let (status, body) = upstream_reply(
            Err(FireError::Timeout(std::time::Duration::from_secs(3))),
            &fallback("f"),
            "rid",
        );
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["success"], json!(false));
    }

    #[test]
    fn test_merge_success() {
        let (status, body) = merge_user_details(
            enveloped(200, json!({"success": true, "data": {"id": "u1", "name": "A"}})),
            enveloped(200, json!({"success": true, "data": {"items": [{"id": "o1"}]}})),
            &fallback("users"),
            &fallback("orders"),
            "rid",
        );
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["data"]["user"]["id"], json!("u1"));
        assert_eq!(body["data"]["orders"]["items"][0]["id"], json!("o1"));
    }

    #[test]
    fn test_merge_identity_not_found_short_circuits() {
        let not_found = json!({"success": false, "error": {"code": "not_found", "message": "User not found"}});
        let (status, body) = merge_user_details(
            enveloped(404, not_found.clone()),
            enveloped(200, json!({"success": true, "data": {"items": []}})),
            &fallback("users"),
            &fallback("orders"),
            "rid",
        );
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, not_found);
        assert!(body.get("data").is_none(), "orders result must be discarded");
    }

    #[test]
    fn test_merge_orders_failure_degrades_to_fallback() {
        let (status, body) = merge_user_details(
            enveloped(200, json!({"success": true, "data": {"id": "u1"}})),
            Err(FireError::Open("orders".to_string())),
            &fallback("users"),
            &fallback("Orders service temporarily unavailable"),
            "rid",
        );
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["user"]["id"], json!("u1"));
        assert_eq!(
            body["data"]["orders"]["error"]["code"],
            json!("service_unavailable")
        );
    }

    #[test]
    fn test_merge_identity_failure_is_unavailable() {
        let (status, body) = merge_user_details(
            Err(FireError::Timeout(std::time::Duration::from_secs(3))),
            enveloped(200, json!({"success": true, "data": {"items": []}})),
            &fallback("Users service temporarily unavailable"),
            &fallback("orders"),
            "rid",
        );
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["code"], json!("service_unavailable"));
    }
}
