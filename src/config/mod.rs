//! Configuration module for the gateway service
//!
//! Configuration is loaded from a TOML file and finished with environment
//! overrides, so deployments can point the gateway at different backends (or
//! rotate the signing secret) without editing the file.

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Upstream service locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the identity service
    #[serde(default = "default_users_url")]
    pub users_url: String,
    /// Base URL of the order service
    #[serde(default = "default_orders_url")]
    pub orders_url: String,
}

fn default_users_url() -> String {
    "http://service_users:8000".to_string()
}

fn default_orders_url() -> String {
    "http://service_orders:8000".to_string()
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            users_url: default_users_url(),
            orders_url: default_orders_url(),
        }
    }
}

/// Bearer-token verification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared HMAC secret the identity service signs tokens with
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
}

fn default_jwt_secret() -> String {
    "changeme".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
        }
    }
}

/// Rate limiter settings (fixed window per client key)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Window length in seconds
    #[serde(default = "default_rate_window_secs")]
    pub window_secs: u64,
    /// Maximum requests per client key per window
    #[serde(default = "default_rate_max")]
    pub max_requests: u32,
}

fn default_enabled() -> bool {
    true
}

fn default_rate_window_secs() -> u64 {
    15 * 60
}

fn default_rate_max() -> u32 {
    200
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            window_secs: default_rate_window_secs(),
            max_requests: default_rate_max(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Circuit breaker settings, shared by both upstream breakers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Per-call timeout in milliseconds; exceeding it counts as a failure
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Failure percentage over the rolling window that trips the breaker
    #[serde(default = "default_error_threshold_pct")]
    pub error_threshold_pct: u8,
    /// Rolling statistics window in seconds
    #[serde(default = "default_rolling_window_secs")]
    pub rolling_window_secs: u64,
    /// Minimum calls in the window before the threshold can trip
    #[serde(default = "default_min_samples")]
    pub min_samples: u32,
    /// How long an opened circuit rejects calls before probing, in seconds
    #[serde(default = "default_open_cooldown_secs")]
    pub open_cooldown_secs: u64,
}

fn default_call_timeout_ms() -> u64 {
    3000
}

fn default_error_threshold_pct() -> u8 {
    50
}

fn default_rolling_window_secs() -> u64 {
    10
}

fn default_min_samples() -> u32 {
    5
}

fn default_open_cooldown_secs() -> u64 {
    30
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            error_threshold_pct: default_error_threshold_pct(),
            rolling_window_secs: default_rolling_window_secs(),
            min_samples: default_min_samples(),
            open_cooldown_secs: default_open_cooldown_secs(),
        }
    }
}

/// CORS settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origin; "*" allows any
    #[serde(default = "default_cors_origin")]
    pub allowed_origin: String,
}

fn default_cors_origin() -> String {
    "*".to_string()
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origin: default_cors_origin(),
        }
    }
}

/// Main gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub breaker: BreakerSettings,
    #[serde(default)]
    pub cors: CorsConfig,
}

impl GatewayConfig {
    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: GatewayConfig = toml::from_str(&contents)?;
        let config = config.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let config: GatewayConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file if it exists, else start from defaults; environment
    /// overrides apply either way. This is the `start` entry point, so the
    /// gateway can run from environment alone.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let config = if path.as_ref().exists() {
            let contents = fs::read_to_string(path)?;
            toml::from_str(&contents)?
        } else {
            GatewayConfig::default()
        };
        let config = config.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = env::var("GATEWAY_PORT") {
            self.server.port = v.parse().unwrap_or(self.server.port);
        }
        if let Ok(v) = env::var("GATEWAY_USERS_URL") {
            self.upstream.users_url = v;
        }
        if let Ok(v) = env::var("GATEWAY_ORDERS_URL") {
            self.upstream.orders_url = v;
        }
        if let Ok(v) = env::var("GATEWAY_JWT_SECRET") {
            self.auth.jwt_secret = v;
        }
        if let Ok(v) = env::var("GATEWAY_RATE_LIMIT_WINDOW_SECS") {
            self.rate_limit.window_secs = v.parse().unwrap_or(self.rate_limit.window_secs);
        }
        if let Ok(v) = env::var("GATEWAY_RATE_LIMIT_MAX") {
            self.rate_limit.max_requests = v.parse().unwrap_or(self.rate_limit.max_requests);
        }
        if let Ok(v) = env::var("GATEWAY_CORS_ORIGIN") {
            self.cors.allowed_origin = v;
        }
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.auth.jwt_secret.is_empty() {
            anyhow::bail!("auth.jwt_secret must not be empty");
        }
        for (name, url) in [
            ("upstream.users_url", &self.upstream.users_url),
            ("upstream.orders_url", &self.upstream.orders_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("{} must be an http(s) URL, got '{}'", name, url);
            }
        }
        if self.rate_limit.max_requests == 0 {
            anyhow::bail!("rate_limit.max_requests must be at least 1");
        }
        if self.breaker.error_threshold_pct == 0 || self.breaker.error_threshold_pct > 100 {
            anyhow::bail!(
                "breaker.error_threshold_pct must be in 1..=100, got {}",
                self.breaker.error_threshold_pct
            );
        }
        Ok(())
    }

    /// Get server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.rate_limit.window_secs, 900);
        assert_eq!(config.rate_limit.max_requests, 200);
        assert_eq!(config.breaker.call_timeout_ms, 3000);
        assert_eq!(config.breaker.error_threshold_pct, 50);
        assert_eq!(config.breaker.open_cooldown_secs, 30);
        assert!(config.rate_limit.enabled);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
host = "127.0.0.1"
port = 9000

[upstream]
users_url = "http://localhost:8001"
orders_url = "http://localhost:8002"

[auth]
jwt_secret = "s3cret"

[rate_limit]
window_secs = 60
max_requests = 50

[breaker]
error_threshold_pct = 40
open_cooldown_secs = 10
"#;

        let config = GatewayConfig::parse(toml).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.upstream.users_url, "http://localhost:8001");
        assert_eq!(config.auth.jwt_secret, "s3cret");
        assert_eq!(config.rate_limit.max_requests, 50);
        assert_eq!(config.breaker.error_threshold_pct, 40);
        // Unspecified fields keep their defaults
        assert_eq!(config.breaker.call_timeout_ms, 3000);
    }

    #[test]
    fn test_empty_secret_rejected() {
        let toml = r#"
[auth]
jwt_secret = ""
"#;
        assert!(GatewayConfig::parse(toml).is_err());
    }

    #[test]
    fn test_bad_upstream_url_rejected() {
        let toml = r#"
[upstream]
users_url = "service_users:8000"
"#;
        assert!(GatewayConfig::parse(toml).is_err());
    }

    #[test]
    fn test_zero_rate_limit_rejected() {
        let toml = r#"
[rate_limit]
max_requests = 0
"#;
        assert!(GatewayConfig::parse(toml).is_err());
    }

    #[test]
    fn test_threshold_bounds() {
        let toml = r#"
[breaker]
error_threshold_pct = 0
"#;
        assert!(GatewayConfig::parse(toml).is_err());
    }

    #[test]
    fn test_env_overrides() {
        env::set_var("GATEWAY_USERS_URL", "http://identity.internal:9001");
        env::set_var("GATEWAY_RATE_LIMIT_MAX", "7");

        let config = GatewayConfig::default().with_env_overrides();
        assert_eq!(config.upstream.users_url, "http://identity.internal:9001");
        assert_eq!(config.rate_limit.max_requests, 7);

        env::remove_var("GATEWAY_USERS_URL");
        env::remove_var("GATEWAY_RATE_LIMIT_MAX");
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = GatewayConfig::load("/nonexistent/gateway.toml").unwrap();
        assert_eq!(config.server.port, 8000);
    }

    #[test]
    fn test_from_file() {
        let file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        std::fs::write(
            file.path(),
            r#"
[server]
port = 8123
"#,
        )
        .unwrap();

        let config = GatewayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server.port, 8123);
        assert_eq!(config.server_addr(), "0.0.0.0:8123");
    }
}
