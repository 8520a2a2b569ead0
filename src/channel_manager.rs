//! C8: owns the set of live [`crate::channel_stream::ChannelStreamHandle`]s,
//! spawning one lazily on first subscriber and tearing it down once
//! [`crate::session::SessionManager`]'s sweeper asks.
//!
//! Generalizes the teacher's `server::stream::StreamManager` (a flat
//! `DashMap<String, StreamSession>` keyed by a synthetic session id, with no
//! per-channel supervisor task) into a registry keyed by channel id, each
//! entry owning the one long-lived [`crate::channel_stream::ChannelStream`]
//! task that channel's subscribers share.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::info;

use crate::buffer::RingReader;
use crate::capability::{BoxFuture, ChannelControl, ChannelId, FallbackSource};
use crate::channel_stream::{self, ChannelStreamError, ChannelStreamHandle, PlayoutDataSource, StderrEvent};
use crate::clock::Clock;
use crate::ffmpeg::FfmpegPool;

/// Tuning knobs shared by every channel's supervisor task; lifted out of
/// `ChannelManager::new`'s signature to keep it from growing an ever-longer
/// parameter list as SPEC_FULL.md's process-pool/timeline knobs evolve.
#[derive(Debug, Clone, Copy)]
pub struct ChannelManagerConfig {
    pub ring_capacity_bytes: usize,
    pub timeline_horizon: chrono::Duration,
    pub max_consecutive_failures: u32,
    pub startup_timeout: Duration,
    pub stall_timeout: Duration,
}

pub struct ChannelManager {
    channels: DashMap<ChannelId, Arc<ChannelStreamHandle>>,
    pool: Arc<FfmpegPool>,
    data: Arc<dyn PlayoutDataSource>,
    clock: Arc<dyn Clock>,
    config: ChannelManagerConfig,
    fallback: Option<Arc<dyn FallbackSource>>,
    stderr_tx: Option<mpsc::UnboundedSender<StderrEvent>>,
}

impl ChannelManager {
    pub fn new(
        pool: Arc<FfmpegPool>,
        data: Arc<dyn PlayoutDataSource>,
        clock: Arc<dyn Clock>,
        config: ChannelManagerConfig,
        fallback: Option<Arc<dyn FallbackSource>>,
        stderr_tx: Option<mpsc::UnboundedSender<StderrEvent>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            channels: DashMap::new(),
            pool,
            data,
            clock,
            config,
            fallback,
            stderr_tx,
        })
    }

    /// Returns the channel's supervisor handle, spawning it if this is the
    /// first caller to ask for it. `dashmap::Entry` serializes concurrent
    /// first-subscriber races onto a single spawn.
    fn get_or_spawn(&self, channel_id: ChannelId) -> Arc<ChannelStreamHandle> {
        match self.channels.entry(channel_id) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                info!(channel_id, "spawning channel stream");
                let handle = Arc::new(channel_stream::spawn(
                    channel_id,
                    self.pool.clone(),
                    self.data.clone(),
                    self.clock.clone(),
                    self.config.ring_capacity_bytes,
                    self.config.timeline_horizon,
                    self.config.max_consecutive_failures,
                    self.config.startup_timeout,
                    self.config.stall_timeout,
                    self.fallback.clone(),
                    self.stderr_tx.clone(),
                ));
                entry.insert(handle.clone());
                handle
            }
        }
    }

    /// Subscribe a new reader to `channel_id`, spawning its supervisor task
    /// on demand.
    pub async fn get_channel_stream(
        &self,
        channel_id: ChannelId,
    ) -> Result<RingReader, ChannelStreamError> {
        let handle = self.get_or_spawn(channel_id);
        handle.subscribe().await
    }

    /// Spawn supervisors for channels expected to be watched imminently
    /// (e.g. on startup, for channels with `always_on` schedules) without
    /// waiting for a subscriber.
    pub fn pre_warm(&self, channel_ids: &[ChannelId]) {
        for &channel_id in channel_ids {
            self.get_or_spawn(channel_id);
        }
    }

    pub fn subscriber_count(&self, channel_id: ChannelId) -> i32 {
        self.channels
            .get(&channel_id)
            .map(|h| h.subscriber_count())
            .unwrap_or(0)
    }

    pub fn is_running(&self, channel_id: ChannelId) -> bool {
        self.channels.contains_key(&channel_id)
    }

    pub fn channel_state(&self, channel_id: ChannelId) -> Option<channel_stream::ChannelState> {
        self.channels.get(&channel_id).map(|h| h.state())
    }

    pub fn active_channel_ids(&self) -> Vec<ChannelId> {
        self.channels.iter().map(|entry| *entry.key()).collect()
    }

    async fn stop_channel_inner(&self, channel_id: ChannelId) {
        if let Some((_, handle)) = self.channels.remove(&channel_id) {
            handle.stop();
            if let Ok(handle) = Arc::try_unwrap(handle) {
                handle.join().await;
            }
        }
    }
}

impl ChannelControl for ChannelManager {
    fn stop_channel(&self, channel_id: ChannelId) -> BoxFuture<'_, ()> {
        Box::pin(self.stop_channel_inner(channel_id))
    }

    fn restart_channel(&self, channel_id: ChannelId) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.stop_channel_inner(channel_id).await;
            self.get_or_spawn(channel_id);
        })
    }
}
