//! Metrics module for Prometheus
//!
//! This module provides metrics collection for the gateway service:
//! - Request count by method, path, and status
//! - Request latency histogram
//! - Circuit breaker transition counter

use std::time::Duration;

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use uuid::Uuid;

use crate::breaker::CircuitState;

/// Gateway metrics collector
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    request_counter: CounterVec,
    request_latency: HistogramVec,
    breaker_transitions: CounterVec,
}

impl GatewayMetrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        let registry = Registry::new();

        let request_counter = CounterVec::new(
            Opts::new("gateway_requests_total", "Total number of requests"),
            &["method", "path", "status"],
        )
        .expect("Failed to create request counter");

        let request_latency = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_latency_seconds",
                "Request latency in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["method", "path"],
        )
        .expect("Failed to create latency histogram");

        let breaker_transitions = CounterVec::new(
            Opts::new(
                "gateway_breaker_transitions_total",
                "Circuit breaker state transitions",
            ),
            &["upstream", "to_state"],
        )
        .expect("Failed to create breaker transition counter");

        registry
            .register(Box::new(request_counter.clone()))
            .expect("Failed to register request counter");
        registry
            .register(Box::new(request_latency.clone()))
            .expect("Failed to register latency histogram");
        registry
            .register(Box::new(breaker_transitions.clone()))
            .expect("Failed to register breaker transition counter");

        Self {
            registry,
            request_counter,
            request_latency,
            breaker_transitions,
        }
    }

    /// Record a request with its status and latency
    pub fn record_request(&self, method: &str, path: &str, status: u16, latency: Duration) {
        let status_str = status.to_string();

        // Normalize path for metrics (to avoid high cardinality)
        let normalized_path = Self::normalize_path(path);

        self.request_counter
            .with_label_values(&[method, &normalized_path, &status_str])
            .inc();

        self.request_latency
            .with_label_values(&[method, &normalized_path])
            .observe(latency.as_secs_f64());
    }

    /// Record a circuit breaker state transition
    pub fn record_breaker_transition(&self, upstream: &str, to: CircuitState) {
        let to_state = match to {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        self.breaker_transitions
            .with_label_values(&[upstream, to_state])
            .inc();
    }

    /// Get the Prometheus metrics output
    pub fn prometheus_output(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Normalize path to reduce cardinality: path segments that look like
    /// ids (UUIDs or plain numbers) become a placeholder.
    fn normalize_path(path: &str) -> String {
        let normalized: Vec<String> = path
            .split('/')
            .map(|part| {
                let is_numeric = !part.is_empty() && part.chars().all(|c| c.is_ascii_digit());
                if is_numeric || Uuid::parse_str(part).is_ok() {
                    ":id".to_string()
                } else {
                    part.to_string()
                }
            })
            .collect();
        normalized.join("/")
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_request() {
        let metrics = GatewayMetrics::new();

        metrics.record_request("GET", "/api/v1/users", 200, Duration::from_millis(10));
        metrics.record_request("POST", "/api/v1/orders", 503, Duration::from_millis(50));

        let output = metrics.prometheus_output();
        assert!(output.contains("gateway_requests_total"));
        assert!(output.contains("gateway_request_latency_seconds"));
        assert!(output.contains("status=\"503\""));
    }

    #[test]
    fn test_breaker_transition_counter() {
        let metrics = GatewayMetrics::new();

        metrics.record_breaker_transition("orders", CircuitState::Open);
        metrics.record_breaker_transition("orders", CircuitState::HalfOpen);

        let output = metrics.prometheus_output();
        assert!(output.contains("gateway_breaker_transitions_total"));
        assert!(output.contains("upstream=\"orders\""));
        assert!(output.contains("to_state=\"half_open\""));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            GatewayMetrics::normalize_path("/api/v1/orders/123"),
            "/api/v1/orders/:id"
        );
        assert_eq!(
            GatewayMetrics::normalize_path(
                "/api/v1/users/550e8400-e29b-41d4-a716-446655440000/details"
            ),
            "/api/v1/users/:id/details"
        );
        assert_eq!(
            GatewayMetrics::normalize_path("/api/v1/users"),
            "/api/v1/users"
        );
    }
}
