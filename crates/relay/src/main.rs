//! Relay service entry point.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use relay::{create_router, AppState, RelayConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting relay");

    let config = RelayConfig::from_env()?;
    config.log();

    if let Some(metrics_port) = config.metrics_port {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], metrics_port))
            .install()
            .context("failed to start Prometheus exporter")?;
        info!("Prometheus metrics server started on port {}", metrics_port);
    }

    info!("Connecting to broker at {}", config.broker_url);
    let broker = broker_client::connect(&config.broker_url)
        .await
        .with_context(|| format!("failed to connect to broker at {}", config.broker_url))?;
    info!("Connected to broker");

    if tokio::fs::metadata(&config.static_page).await.is_err() {
        warn!(
            "Static page {} not found; plain HTTP requests will get 404",
            config.static_page.display()
        );
    }

    let state = Arc::new(AppState::new(broker, &config));
    let app = create_router(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Relay listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(
        "Relay stopped with {} channels and {} connections open",
        state.registry.channel_count(),
        state.registry.connection_count()
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
