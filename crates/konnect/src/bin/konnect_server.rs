//! konnect server
//!
//! Serves the annotate and state endpoints against the cluster the process
//! has credentials for.

use anyhow::{Context, Result};
use konnect::k8s::{self, KubeBackend};
use konnect::telemetry::init_tracing;
use konnect::{build_router, AppState, Config, Coordinator};
use std::sync::Arc;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    init_tracing(config.log_format);
    config.log_fallbacks();
    config.validate().context("invalid configuration")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        timeout_ms = config.timeout.as_millis(),
        mode = ?config.confirmation_mode,
        "Starting konnect"
    );

    let client = k8s::connect(config.credentials)
        .await
        .context("failed to connect to Kubernetes")?;
    let backend = Arc::new(KubeBackend::new(client));

    let coordinator = Coordinator::new(backend.clone(), backend.clone(), backend.clone())
        .with_timeout(config.timeout)
        .with_mode(config.confirmation_mode);

    let app = build_router(AppState {
        coordinator: Arc::new(coordinator),
        resources: backend,
    });

    let address = config.listen_address();
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    info!(%address, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("konnect stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
