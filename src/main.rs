//! proxy-gateway binary.
//!
//! ```text
//!     Client Request
//!     ─────────────▶ axum server ─▶ route table ─▶ Gateway::forward
//!                                                     │
//!                    ┌────────────────────────────────┘
//!                    ▼
//!        pool (resolver + health checker)
//!          → load balancer → circuit breaker
//!          → forwarder ─────────────────────────────▶ Upstream
//!          → retry executor (backoff, deadline)
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use proxy_gateway::config::loader::load_config;
use proxy_gateway::lifecycle::signals::spawn_signal_handler;
use proxy_gateway::observability::{logging, metrics};
use proxy_gateway::{Gateway, HttpServer};

#[derive(Debug, Parser)]
#[command(name = "proxy-gateway", version, about = "Request-forwarding gateway")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "gateway.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    logging::init(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "proxy-gateway starting");
    tracing::info!(
        config = %args.config.display(),
        bind_address = %config.listener.bind_address,
        routes = config.routes.len(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let gateway = Arc::new(Gateway::new());
    let signals = spawn_signal_handler(gateway.shutdown_handle().clone());

    let server = HttpServer::new(&config, gateway.clone()).await?;
    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    server.run(listener).await?;
    gateway.shutdown();
    signals.abort();

    tracing::info!("Shutdown complete");
    Ok(())
}
