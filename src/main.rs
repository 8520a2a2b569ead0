use clap::Parser;
use tracing_subscriber::EnvFilter;

use exstreamtv_core::config::{Cli, Config};
use exstreamtv_core::db;
use exstreamtv_core::engine::Engine;
use exstreamtv_core::server;

/// Database connections the pool keeps open; the process never needs more
/// than a handful at once (one per in-flight HTTP request plus the
/// background ChannelStream/EPG/healing tasks), matching the teacher's
/// desktop-app pool sizing.
const DB_POOL_MAX_SIZE: u32 = 16;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;
    config.apply_cli(&cli);

    let database_url = config.database.path.to_string_lossy().to_string();
    db::run_migrations(&config.database.path)?;
    let pool = db::build_pool(&database_url, DB_POOL_MAX_SIZE)?;

    let engine = Engine::new(config, pool);
    let shutdown = engine.shutdown.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    server::start_server(engine.clone(), engine.shutdown.clone()).await?;

    tracing::info!("server stopped");
    Ok(())
}
