//! Correlation context
//!
//! Assigns each inbound request an id under `x-request-id`: a caller-supplied
//! value is adopted verbatim, otherwise a fresh UUID is generated. The id is
//! attached to the request extensions, echoed on the response header, and
//! forwarded on every upstream call. Request start/end log lines carry it so
//! a request can be traced across the gateway and both backends.

use std::time::Instant;

use axum::{
    extract::{Request, State},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::proxy::AppState;

/// Header carrying the correlation id, inbound and outbound
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request processing context, immutable once assigned
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
}

impl RequestContext {
    fn from_request(req: &Request) -> Self {
        let request_id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self { request_id }
    }
}

/// Correlation middleware; also the request log and metrics tap, since it is
/// the outermost layer that knows the final status.
pub async fn correlation_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let ctx = RequestContext::from_request(&req);
    let request_id = ctx.request_id.clone();
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    req.extensions_mut().insert(ctx);
    tracing::info!(req_id = %request_id, method = %method, path = %path, "req:start");

    let mut response = next.run(req).await;

    let status = response.status();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    state
        .metrics
        .record_request(method.as_str(), &path, status.as_u16(), started.elapsed());
    tracing::info!(req_id = %request_id, status = status.as_u16(), "req:end");

    response
}
