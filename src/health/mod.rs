//! Health check module
//!
//! Reports the gateway's own liveness plus a snapshot of each upstream's
//! circuit state. No upstream call is made: the snapshot reflects what the
//! breakers already know.

use std::time::Instant;

use serde::Serialize;

use crate::breaker::{BreakerSnapshot, CircuitState};

/// Health status
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
        }
    }
}

/// Health check payload
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub circuits: Circuits,
}

#[derive(Debug, Clone, Serialize)]
pub struct Circuits {
    pub users: BreakerSnapshot,
    pub orders: BreakerSnapshot,
}

/// Health reporter service
#[derive(Clone)]
pub struct HealthChecker {
    start_time: Instant,
    version: String,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Build the health report; the gateway is degraded while any circuit
    /// is not closed.
    pub fn report(&self, users: BreakerSnapshot, orders: BreakerSnapshot) -> HealthReport {
        let status = if users.state == CircuitState::Closed && orders.state == CircuitState::Closed
        {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        HealthReport {
            status,
            version: self.version.clone(),
            uptime_seconds: self.uptime_seconds(),
            timestamp: chrono::Utc::now(),
            circuits: Circuits { users, orders },
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}
