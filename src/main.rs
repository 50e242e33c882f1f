use agentjobs::api;
use agentjobs::tracing::{init_tracing, shutdown_tracing};
use agentjobs::{AppContext, ServiceConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = ServiceConfig::load()?;
    init_tracing(env!("CARGO_PKG_NAME"), &config.telemetry)?;

    let addr = config.bind_addr()?;
    let app = AppContext::build(config)?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "job API listening");

    axum::serve(listener, api::router(app.api_state()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    app.shutdown().await;
    shutdown_tracing();
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
