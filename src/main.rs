use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use scribe::api;
use scribe::config::Settings;
use scribe::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("scribe=info,tower_http=info")),
        )
        .init();

    let state = Arc::new(AppState::from_settings(&settings).await?);
    tracing::info!("Loaded {} API tokens", state.auth.len());

    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&settings.server.bind).await?;
    tracing::info!("Scribe listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Scribe stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
