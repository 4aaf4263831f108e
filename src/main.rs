//! Edge Gateway - CLI Application
//!
//! An API gateway fronting the identity and order services with:
//! - Bearer-token authentication and role checks
//! - Per-client rate limiting
//! - Per-upstream circuit breakers with fallback responses
//! - Prometheus metrics and health reporting

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use edge_gateway::{
    breaker::{CircuitBreaker, CircuitState},
    config::GatewayConfig,
    metrics::GatewayMetrics,
    proxy::AppState,
};
use tracing_subscriber::EnvFilter;

/// Edge Gateway - API gateway for the identity and order services
#[derive(Parser)]
#[command(name = "edge-gateway")]
#[command(version, about = "API gateway for the identity and order services", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Start {
        /// Configuration file path; missing file falls back to defaults
        /// plus environment overrides
        #[arg(short, long, default_value = "gateway.toml")]
        config: String,
    },
    /// Validate the configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long, default_value = "gateway.toml")]
        config: String,
    },
    /// Generate a sample configuration file
    Init {
        /// Output file path
        #[arg(short, long, default_value = "gateway.toml")]
        output: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => start_server(&config).await?,
        Commands::Validate { config } => validate_config(&config)?,
        Commands::Init { output } => generate_sample_config(&output)?,
    }

    Ok(())
}

/// Start the gateway server
async fn start_server(config_path: &str) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = GatewayConfig::load(config_path)?;
    tracing::info!(
        users_url = %config.upstream.users_url,
        orders_url = %config.upstream.orders_url,
        "loaded configuration"
    );

    let addr: SocketAddr = config.server_addr().parse()?;
    let state = AppState::from_config(config)?;

    watch_breaker(&state.users_breaker, state.metrics.clone());
    watch_breaker(&state.orders_breaker, state.metrics.clone());

    let app = edge_gateway::app(state);

    tracing::info!(%addr, "starting gateway server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Log and count circuit transitions for an upstream
fn watch_breaker(breaker: &Arc<CircuitBreaker>, metrics: Arc<GatewayMetrics>) {
    let mut events = breaker.subscribe();
    let upstream = breaker.name().to_string();
    tokio::spawn(async move {
        while let Ok(change) = events.recv().await {
            match change.to {
                CircuitState::Open => {
                    tracing::warn!(upstream = %change.upstream, "circuit opened")
                }
                CircuitState::HalfOpen => {
                    tracing::info!(upstream = %change.upstream, "circuit half-open, probing")
                }
                CircuitState::Closed => {
                    tracing::info!(upstream = %change.upstream, "circuit closed")
                }
            }
            metrics.record_breaker_transition(&upstream, change.to);
        }
    });
}

/// Validate configuration file
fn validate_config(config_path: &str) -> anyhow::Result<()> {
    match GatewayConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid!");
            println!();
            println!("Server: {}", config.server_addr());
            println!("Users service: {}", config.upstream.users_url);
            println!("Orders service: {}", config.upstream.orders_url);
            println!(
                "Rate limit: {} requests / {}s (enabled: {})",
                config.rate_limit.max_requests,
                config.rate_limit.window_secs,
                config.rate_limit.enabled
            );
            println!(
                "Breaker: {}% over {}s, cooldown {}s, timeout {}ms",
                config.breaker.error_threshold_pct,
                config.breaker.rolling_window_secs,
                config.breaker.open_cooldown_secs,
                config.breaker.call_timeout_ms
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration is invalid:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}

/// Generate sample configuration file
fn generate_sample_config(output_path: &str) -> anyhow::Result<()> {
    let sample_config = r#"# Edge Gateway Configuration

[server]
host = "0.0.0.0"
port = 8000

[upstream]
users_url = "http://service_users:8000"
orders_url = "http://service_orders:8000"

[auth]
# Shared secret the identity service signs tokens with.
# Override with GATEWAY_JWT_SECRET in production.
jwt_secret = "changeme"

[rate_limit]
enabled = true
window_secs = 900
max_requests = 200

[breaker]
call_timeout_ms = 3000
error_threshold_pct = 50
rolling_window_secs = 10
min_samples = 5
open_cooldown_secs = 30

[cors]
allowed_origin = "*"
"#;

    std::fs::write(output_path, sample_config)?;
    println!("Sample configuration written to {}", output_path);
    Ok(())
}
