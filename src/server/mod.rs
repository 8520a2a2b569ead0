pub mod handlers;
pub mod hdhr;
pub mod m3u;
pub mod metrics;
pub mod routes;
pub mod state;

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;

pub use state::AppState;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),

    #[error("server runtime error: {0}")]
    RuntimeError(String),
}

/// Serves the tuner-compatible HTTP surface until `shutdown` is cancelled,
/// bound to the operator-configured `server.host`/`server.port` (no
/// loopback-only restriction: SPEC_FULL.md's HDHomeRun surface must be
/// reachable from other devices on the network).
pub async fn start_server(state: AppState, shutdown: CancellationToken) -> Result<(), ServerError> {
    let addr = SocketAddr::from((state.config.server.host, state.config.server.port));
    let app = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "http server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| ServerError::RuntimeError(e.to_string()))?;

    Ok(())
}
