//! plfm-vt Balancer
//!
//! L4 TCP load balancer.
//!
//! This service:
//! - Keeps a persistent watchdog connection to every configured backend
//! - Accepts TCP clients on the configured interface and port
//! - Binds each client to an alive backend and forwards bytes both ways
//! - Moves a client to another backend when its backend fails mid-stream

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use plfm_balancer::{Config, Server};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to BALANCER_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting plfm-vt balancer");
    info!(
        listen_interface = %config.listen_interface,
        listen_port = config.listen_port,
        backend_count = config.backends.len(),
        "Configuration loaded"
    );

    config.validate().context("invalid balancer configuration")?;

    let server = Server::bind(&config).await.with_context(|| {
        format!(
            "failed to bind {}:{}",
            config.listen_interface, config.listen_port
        )
    })?;
    let server = Arc::new(server);

    let shutdown = CancellationToken::new();
    let mut run_handle = tokio::spawn({
        let server = Arc::clone(&server);
        let shutdown = shutdown.clone();
        async move { server.run(shutdown).await }
    });

    let finished = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Received shutdown signal");
            None
        }
        result = &mut run_handle => Some(result),
    };

    shutdown.cancel();
    server.dispose().await;

    let result = match finished {
        Some(result) => result,
        None => run_handle.await,
    };
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Server error"),
        Err(e) => error!(error = %e, "Server task failed"),
    }

    info!("Balancer stopped");
    Ok(())
}
