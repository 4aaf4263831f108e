//! Per-client rate limiting
//!
//! Fixed-window counters keyed by client origin: a window admits up to
//! `max_requests`, then rejects with `rate_limited` until the window elapses.
//! The count resets to zero at the boundary rather than sliding, so a burst
//! straddling two windows can briefly exceed the limit; that trade is
//! accepted in exchange for a counter per client instead of a log.
//!
//! Runs before authentication and proxying, so rejected requests never touch
//! an upstream. Responses carry the draft `RateLimit-*` headers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::envelope::GatewayError;
use crate::proxy::AppState;

/// Entries above this trigger a sweep of expired windows on insert
const SWEEP_THRESHOLD: usize = 1024;

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

/// Outcome of a rate-limit check, with everything the response headers need
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Usage {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the client's window resets
    pub reset_secs: u64,
}

/// Fixed-window request counter, one entry per client key
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Check and count one request for `key`
    pub fn check(&self, key: &str) -> Usage {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");

        if windows.len() > SWEEP_THRESHOLD {
            let window = self.window;
            windows.retain(|_, w| now.duration_since(w.started) < window);
        }

        let entry = windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });

        // Fixed-window reset: the count returns to zero once the window
        // has fully elapsed.
        if now.duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.count = 0;
        }

        let allowed = entry.count < self.max_requests;
        if allowed {
            entry.count += 1;
        }

        let elapsed = now.duration_since(entry.started);
        Usage {
            allowed,
            limit: self.max_requests,
            remaining: self.max_requests.saturating_sub(entry.count),
            reset_secs: self.window.saturating_sub(elapsed).as_secs().max(1),
        }
    }
}

/// Derive the client key: the first hop in `x-forwarded-for` when present,
/// else the peer address.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return forwarded.to_string();
    }
    match peer {
        Some(addr) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}

/// Rate-limit middleware, applied to every route
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if !state.config.rate_limit.enabled {
        return next.run(req).await;
    }

    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let key = client_key(req.headers(), peer);
    let usage = state.rate_limiter.check(&key);

    let mut response = if usage.allowed {
        next.run(req).await
    } else {
        tracing::warn!(client = %key, "rate limit exceeded");
        GatewayError::RateLimited("Too many requests, please try again later".to_string())
            .into_response()
    };

    apply_headers(response.headers_mut(), usage);
    response
}

fn apply_headers(headers: &mut HeaderMap, usage: Usage) {
    headers.insert("ratelimit-limit", int_header(usage.limit as u64));
    headers.insert("ratelimit-remaining", int_header(usage.remaining as u64));
    headers.insert("ratelimit-reset", int_header(usage.reset_secs));
}

fn int_header(value: u64) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).unwrap_or(HeaderValue::from_static("0"))
}
