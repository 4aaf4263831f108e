//! Per-upstream circuit breaker
//!
//! One breaker per backend service, created at startup and shared by every
//! request to that backend. Each outbound call is a single attempt, bounded
//! by a fixed timeout; call outcomes feed a rolling failure percentage that
//! drives the state machine:
//!
//! - `Closed`: calls pass through. When the failure percentage over the
//!   rolling window reaches the threshold (after a minimum sample count),
//!   the circuit opens.
//! - `Open`: calls are rejected without touching the upstream until the
//!   cooldown elapses, then the circuit goes half-open.
//! - `HalfOpen`: exactly one probe call is admitted. Probe success closes
//!   the circuit and clears the statistics; probe failure reopens it and
//!   restarts the cooldown.
//!
//! A 404 from the upstream is application data, not an infrastructure
//! failure, and counts as a success. Timeouts and connection errors count as
//! failures. State transitions are published on a broadcast channel for
//! logging and metrics; health reporting reads a point-in-time snapshot.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::envelope::{Envelope, UpstreamBody};

/// Circuit state, reported under `/health`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker tuning, shared by both upstreams
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub call_timeout: Duration,
    pub error_threshold_pct: u8,
    pub rolling_window: Duration,
    pub min_samples: u32,
    pub open_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_millis(3000),
            error_threshold_pct: 50,
            rolling_window: Duration::from_secs(10),
            min_samples: 5,
            open_cooldown: Duration::from_secs(30),
        }
    }
}

impl From<&crate::config::BreakerSettings> for BreakerConfig {
    fn from(settings: &crate::config::BreakerSettings) -> Self {
        Self {
            call_timeout: Duration::from_millis(settings.call_timeout_ms),
            error_threshold_pct: settings.error_threshold_pct,
            rolling_window: Duration::from_secs(settings.rolling_window_secs),
            min_samples: settings.min_samples,
            open_cooldown: Duration::from_secs(settings.open_cooldown_secs),
        }
    }
}

/// A state transition, published on the breaker's event channel
#[derive(Debug, Clone)]
pub struct StateChange {
    pub upstream: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Point-in-time view of a breaker for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub requests: u32,
    pub successes: u32,
    pub failures: u32,
    pub error_rate_pct: u32,
    /// Seconds since the last state transition
    pub since_last_change_secs: u64,
    /// Remaining cooldown when the circuit is open
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_remaining_secs: Option<u64>,
}

struct RollingStats {
    requests: u32,
    successes: u32,
    failures: u32,
    window_start: Instant,
}

impl RollingStats {
    fn new() -> Self {
        Self {
            requests: 0,
            successes: 0,
            failures: 0,
            window_start: Instant::now(),
        }
    }

    /// Reset counters once the rolling window has elapsed
    fn roll(&mut self, window: Duration) {
        if self.window_start.elapsed() >= window {
            *self = Self::new();
        }
    }

    fn error_rate_pct(&self) -> u32 {
        if self.requests == 0 {
            0
        } else {
            self.failures * 100 / self.requests
        }
    }
}

struct Inner {
    state: CircuitState,
    stats: RollingStats,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    last_state_change: Instant,
}

enum Admit {
    Allow,
    Reject,
}

/// Request to an upstream, constructed per call and never retried
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl UpstreamRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Response from an upstream call that made it onto the wire
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: UpstreamBody,
}

/// Why a `fire` call produced no upstream response
#[derive(Debug, Error)]
pub enum FireError {
    #[error("circuit for {0} is open")]
    Open(String),
    #[error("upstream call timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    client: reqwest::Client,
    fallback: Envelope,
    inner: Mutex<Inner>,
    events: broadcast::Sender<StateChange>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: BreakerConfig,
        client: reqwest::Client,
        fallback: Envelope,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            name: name.into(),
            config,
            client,
            fallback,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                stats: RollingStats::new(),
                opened_at: None,
                probe_in_flight: false,
                last_state_change: Instant::now(),
            }),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The substitute response returned while the circuit rejects calls
    pub fn fallback(&self) -> Envelope {
        self.fallback.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    /// Issue one guarded call to the upstream. No retries: the outcome of
    /// this single attempt is what feeds the state machine.
    pub async fn fire(&self, request: UpstreamRequest) -> Result<UpstreamResponse, FireError> {
        if let Admit::Reject = self.try_acquire() {
            return Err(FireError::Open(self.name.clone()));
        }

        match tokio::time::timeout(self.config.call_timeout, self.send(request)).await {
            Err(_elapsed) => {
                self.on_failure();
                Err(FireError::Timeout(self.config.call_timeout))
            }
            Ok(Err(err)) => {
                self.on_failure();
                Err(FireError::Transport(err))
            }
            Ok(Ok(response)) => {
                // 2xx and 404 are successful outcomes; everything else
                // degrades the breaker but is still returned so the caller
                // can pass the upstream's error body through.
                if (200..300).contains(&response.status) || response.status == 404 {
                    self.on_success();
                } else {
                    self.on_failure();
                }
                Ok(response)
            }
        }
    }

    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, reqwest::Error> {
        let UpstreamRequest {
            method,
            url,
            headers,
            body,
        } = request;
        let mut builder = self.client.request(method, url.as_str());
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await?;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };

        Ok(UpstreamResponse {
            status,
            body: UpstreamBody::classify(value),
        })
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        let open_remaining_secs = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => Some(
                self.config
                    .open_cooldown
                    .saturating_sub(opened_at.elapsed())
                    .as_secs(),
            ),
            _ => None,
        };
        BreakerSnapshot {
            state: inner.state,
            requests: inner.stats.requests,
            successes: inner.stats.successes,
            failures: inner.stats.failures,
            error_rate_pct: inner.stats.error_rate_pct(),
            since_last_change_secs: inner.last_state_change.elapsed().as_secs(),
            open_remaining_secs,
        }
    }

    /// Gate a call on the current state, transitioning Open -> HalfOpen when
    /// the cooldown has elapsed. In HalfOpen only a single probe is admitted.
    fn try_acquire(&self) -> Admit {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => Admit::Allow,
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.open_cooldown)
                    .unwrap_or(true);
                if cooled_down {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.probe_in_flight = true;
                    Admit::Allow
                } else {
                    Admit::Reject
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Admit::Reject
                } else {
                    inner.probe_in_flight = true;
                    Admit::Allow
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.opened_at = None;
                inner.stats = RollingStats::new();
                self.transition(&mut inner, CircuitState::Closed);
            }
            _ => {
                inner.stats.roll(self.config.rolling_window);
                inner.stats.requests += 1;
                inner.stats.successes += 1;
            }
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed => {
                inner.stats.roll(self.config.rolling_window);
                inner.stats.requests += 1;
                inner.stats.failures += 1;
                if inner.stats.requests >= self.config.min_samples
                    && inner.stats.error_rate_pct() >= u32::from(self.config.error_threshold_pct)
                {
                    inner.opened_at = Some(Instant::now());
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            // A call admitted before the circuit opened settled late; the
            // circuit is already protecting the upstream.
            CircuitState::Open => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        inner.last_state_change = Instant::now();
        let _ = self.events.send(StateChange {
            upstream: self.name.clone(),
            from,
            to,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config() -> BreakerConfig {
        BreakerConfig {
            call_timeout: Duration::from_millis(200),
            error_threshold_pct: 50,
            rolling_window: Duration::from_secs(10),
            min_samples: 4,
            open_cooldown: Duration::from_millis(50),
        }
    }

    fn test_breaker(config: BreakerConfig) -> CircuitBreaker {
        CircuitBreaker::new(
            "users",
            config,
            reqwest::Client::new(),
            Envelope::error("service_unavailable", "Users service temporarily unavailable"),
        )
    }

    #[test]
    fn stays_closed_below_threshold() {
        let breaker = test_breaker(test_config());
        // 1 failure out of 4 = 25%, below the 50% threshold
        breaker.on_failure();
        breaker.on_success();
        breaker.on_success();
        breaker.on_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn opens_at_threshold_after_min_samples() {
        let breaker = test_breaker(test_config());
        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Closed, "below min samples");
        breaker.on_success();
        breaker.on_failure();
        // 3 failures out of 4 = 75% over min_samples
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn open_rejects_until_cooldown() {
        let breaker = test_breaker(test_config());
        for _ in 0..4 {
            breaker.on_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(breaker.try_acquire(), Admit::Reject));

        std::thread::sleep(Duration::from_millis(60));
        assert!(matches!(breaker.try_acquire(), Admit::Allow));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_admits_single_probe() {
        let breaker = test_breaker(test_config());
        for _ in 0..4 {
            breaker.on_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(matches!(breaker.try_acquire(), Admit::Allow));
        // Second caller racing the probe is rejected
        assert!(matches!(breaker.try_acquire(), Admit::Reject));
    }

    #[test]
    fn probe_success_closes_and_clears_stats() {
        let breaker = test_breaker(test_config());
        for _ in 0..4 {
            breaker.on_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(matches!(breaker.try_acquire(), Admit::Allow));
        breaker.on_success();

        assert_eq!(breaker.state(), CircuitState::Closed);
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.requests, 0);
        assert_eq!(snapshot.failures, 0);
        assert_eq!(snapshot.open_remaining_secs, None);
    }

    #[test]
    fn probe_failure_reopens() {
        let breaker = test_breaker(test_config());
        for _ in 0..4 {
            breaker.on_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(matches!(breaker.try_acquire(), Admit::Allow));
        breaker.on_failure();

        assert_eq!(breaker.state(), CircuitState::Open);
        // Cooldown restarted: immediately rejected again
        assert!(matches!(breaker.try_acquire(), Admit::Reject));
    }

    #[test]
    fn stats_reset_when_window_elapses() {
        let mut config = test_config();
        config.rolling_window = Duration::from_millis(30);
        let breaker = test_breaker(config);

        breaker.on_failure();
        breaker.on_failure();
        std::thread::sleep(Duration::from_millis(40));
        breaker.on_success();

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.requests, 1);
        assert_eq!(snapshot.failures, 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn transitions_are_published() {
        let breaker = test_breaker(test_config());
        let mut events = breaker.subscribe();
        for _ in 0..4 {
            breaker.on_failure();
        }
        let change = events.try_recv().unwrap();
        assert_eq!(change.upstream, "users");
        assert_eq!(change.from, CircuitState::Closed);
        assert_eq!(change.to, CircuitState::Open);
    }

    #[test]
    fn snapshot_reports_error_rate() {
        let breaker = test_breaker(test_config());
        breaker.on_success();
        breaker.on_failure();
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.error_rate_pct, 50);
        assert_eq!(snapshot.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn fire_counts_transport_error_as_failure() {
        let mut config = test_config();
        config.min_samples = 1;
        let breaker = test_breaker(config);

        // Nothing listens on this port
        let result = breaker
            .fire(UpstreamRequest::get("http://127.0.0.1:9/users"))
            .await;
        assert!(result.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn fire_rejects_while_open_without_network() {
        let mut config = test_config();
        config.open_cooldown = Duration::from_secs(60);
        let breaker = test_breaker(config);
        for _ in 0..4 {
            breaker.on_failure();
        }

        let result = breaker
            .fire(UpstreamRequest::get("http://127.0.0.1:9/users"))
            .await;
        assert!(matches!(result, Err(FireError::Open(_))));
    }

    #[test]
    fn upstream_request_builder() {
        let request = UpstreamRequest::new(Method::POST, "http://localhost:8001/orders")
            .header("x-request-id", "rid-1")
            .json(json!({"items": [1]}));
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.headers.len(), 1);
        assert_eq!(request.body.as_ref().unwrap()["items"][0], json!(1));
    }
}
