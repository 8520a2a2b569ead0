//! Composition root. Built once in `main`, held as `axum::extract::State`,
//! and cloned (cheaply — every field is an `Arc`) into every background
//! task, so nothing downstream of `main` reaches for a global singleton
//! (SPEC_FULL.md §9).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::channel_manager::{ChannelManager, ChannelManagerConfig};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::credentials::CredentialManager;
use crate::datasource::DieselPlayoutDataSource;
use crate::db::DbPool;
use crate::epg::EpgProjector;
use crate::fallback::StaticFillerSource;
use crate::ffmpeg::FfmpegPool;
use crate::healing::HealingLoop;
use crate::session::SessionManager;

#[derive(Clone)]
pub struct Engine {
    pub config: Arc<Config>,
    pub db: DbPool,
    pub ffmpeg_pool: Arc<FfmpegPool>,
    pub channels: Arc<ChannelManager>,
    pub sessions: Arc<SessionManager>,
    pub epg: Arc<EpgProjector>,
    pub healing: Arc<HealingLoop>,
    pub shutdown: CancellationToken,
}

impl Engine {
    pub fn new(config: Config, db: DbPool) -> Self {
        let config = Arc::new(config);
        let shutdown = CancellationToken::new();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let ffmpeg_pool = Arc::new(FfmpegPool::new(
            config.ffmpeg.path.clone(),
            config.process_pool.max_processes,
            config.process_pool.memory_budget_bytes,
            config.process_pool.fd_budget,
            config.process_pool.max_age_seconds,
        ));

        let credentials = CredentialManager::new(config.data_dir());
        let data: Arc<dyn crate::channel_stream::PlayoutDataSource> =
            Arc::new(DieselPlayoutDataSource::new(db.clone(), credentials, config.clone()));

        let fallback = StaticFillerSource::load(None, config.self_heal.use_error_screen_fallback);

        let (stderr_tx, stderr_rx) = tokio::sync::mpsc::unbounded_channel();

        let channel_manager_config = ChannelManagerConfig {
            ring_capacity_bytes: 8 * 1024 * 1024,
            timeline_horizon: chrono::Duration::days(config.playout.build_days.max(1) as i64),
            max_consecutive_failures: config.self_heal.max_consecutive_failures,
            startup_timeout: std::time::Duration::from_secs(config.ffmpeg.startup_timeout_secs),
            stall_timeout: std::time::Duration::from_secs(config.ffmpeg.stall_timeout_secs),
        };

        let channels = ChannelManager::new(
            ffmpeg_pool.clone(),
            data.clone(),
            clock.clone(),
            channel_manager_config,
            Some(fallback as Arc<dyn crate::capability::FallbackSource>),
            Some(stderr_tx),
        );

        let (sessions, session_events_rx) = SessionManager::new(
            config.session_manager.max_sessions_per_channel,
            config.session_manager.idle_timeout(),
            config.session_manager.channel_idle_grace(),
        );
        // The sweeper only needs to react to idle sessions, not inspect each
        // event individually; drop the receiver's remaining lifetime into a
        // task that just drains it so the unbounded channel never backs up.
        tokio::spawn(drain_session_events(session_events_rx));

        let epg = EpgProjector::new(db.clone(), data.clone(), clock.clone(), config.clone());

        let channel_control = channels.clone() as Arc<dyn crate::capability::ChannelControl>;
        let healing = HealingLoop::new(config.self_heal.clone(), channel_control.clone());
        tokio::spawn(healing.clone().run(stderr_rx, shutdown.clone()));

        tokio::spawn(sessions.clone().run_sweeper(channel_control, shutdown.clone()));

        info!("engine constructed");

        Self {
            config,
            db,
            ffmpeg_pool,
            channels,
            sessions,
            epg,
            healing,
            shutdown,
        }
    }
}

async fn drain_session_events(mut rx: tokio::sync::mpsc::UnboundedReceiver<crate::session::SessionEvent>) {
    while let Some(event) = rx.recv().await {
        tracing::debug!(channel_id = event.channel_id, reason = ?event.reason, "session closed");
    }
}
