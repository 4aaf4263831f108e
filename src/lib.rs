//! Edge Gateway - an API gateway for the identity and order services
//!
//! This is a gateway service that provides:
//! - Request routing and aggregation across backend services
//! - Bearer-token authentication with role checks
//! - Per-client rate limiting
//! - Per-upstream circuit breakers with fallback responses
//! - Prometheus metrics
//! - Health checks with circuit state reporting

pub mod auth;
pub mod breaker;
pub mod config;
pub mod context;
pub mod envelope;
pub mod health;
pub mod metrics;
pub mod proxy;
pub mod rate_limit;

pub use config::GatewayConfig;
pub use proxy::{app, AppState};

/// Application result type
pub type Result<T> = anyhow::Result<T>;
