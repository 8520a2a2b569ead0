//! C7: tracks client subscriptions to ChannelStreams.
//!
//! Generalizes the teacher's `server::stream::StreamManager` (a flat
//! `DashMap<String, StreamSession>` plus a single `AtomicU32` global cap,
//! with no notion of a channel owning its sessions) into a per-channel-aware
//! registry: a `DashMap<SessionId, SessionRecord>` plus a per-channel count,
//! an idle sweeper analogous in shape to the teacher's
//! `StreamHealthMonitor::start_monitoring` loop, and a zero-subscriber grace
//! period before asking the [`crate::capability::ChannelControl`]
//! implementation to stop the channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::capability::{BoxFuture, ChannelControl, ChannelId, SessionControl};

pub type SessionId = Uuid;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("channel {channel_id} has reached its session cap ({max})")]
    ChannelFull { channel_id: ChannelId, max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCloseReason {
    Idle,
    SlowReader,
    ChannelStopped,
    ClientDisconnected,
}

#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub session_id: SessionId,
    pub channel_id: ChannelId,
    pub reason: SessionCloseReason,
}

struct SessionRecord {
    channel_id: ChannelId,
    started_at: Instant,
    last_read_at: Instant,
}

pub struct SessionManager {
    sessions: DashMap<SessionId, SessionRecord>,
    channel_counts: DashMap<ChannelId, Arc<AtomicUsize>>,
    max_sessions_per_channel: usize,
    idle_timeout: Duration,
    channel_idle_grace: Duration,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionManager {
    pub fn new(
        max_sessions_per_channel: usize,
        idle_timeout: Duration,
        channel_idle_grace: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                sessions: DashMap::new(),
                channel_counts: DashMap::new(),
                max_sessions_per_channel,
                idle_timeout,
                channel_idle_grace,
                events_tx,
            }),
            events_rx,
        )
    }

    pub fn open_session(&self, channel_id: ChannelId) -> Result<SessionId, SessionError> {
        let count = self
            .channel_counts
            .entry(channel_id)
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();

        // Compare-and-increment loop so two concurrent opens can't both pass
        // the check and overshoot the cap.
        loop {
            let current = count.load(Ordering::SeqCst);
            if current >= self.max_sessions_per_channel {
                return Err(SessionError::ChannelFull {
                    channel_id,
                    max: self.max_sessions_per_channel,
                });
            }
            if count
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }

        let id = Uuid::new_v4();
        let now = Instant::now();
        self.sessions.insert(
            id,
            SessionRecord {
                channel_id,
                started_at: now,
                last_read_at: now,
            },
        );
        info!(%id, channel_id, "session opened");
        Ok(id)
    }

    /// Call on every successful read batch to keep the idle sweeper from
    /// closing an active session.
    pub fn record_read(&self, session_id: SessionId) {
        if let Some(mut record) = self.sessions.get_mut(&session_id) {
            record.last_read_at = Instant::now();
        }
    }

    pub fn close_session(&self, session_id: SessionId, reason: SessionCloseReason) {
        if let Some((_, record)) = self.sessions.remove(&session_id) {
            if let Some(count) = self.channel_counts.get(&record.channel_id) {
                count.fetch_sub(1, Ordering::SeqCst);
            }
            let _ = self.events_tx.send(SessionEvent {
                session_id,
                channel_id: record.channel_id,
                reason,
            });
        }
    }

    pub fn session_count(&self, channel_id: ChannelId) -> usize {
        self.channel_counts
            .get(&channel_id)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Runs until `shutdown` is cancelled. Closes sessions idle for longer
    /// than `idle_timeout`; when a channel's count drops to zero, waits
    /// `channel_idle_grace` and then, if still zero, asks `channels` to stop
    /// that channel.
    pub async fn run_sweeper(
        self: Arc<Self>,
        channels: Arc<dyn ChannelControl>,
        shutdown: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let now = Instant::now();
            let idle: Vec<SessionId> = self
                .sessions
                .iter()
                .filter(|entry| now.duration_since(entry.last_read_at) > self.idle_timeout)
                .map(|entry| *entry.key())
                .collect();
            for session_id in idle {
                warn!(%session_id, "closing idle session");
                self.close_session(session_id, SessionCloseReason::Idle);
            }

            let empty_channels: Vec<ChannelId> = self
                .channel_counts
                .iter()
                .filter(|entry| entry.value().load(Ordering::SeqCst) == 0)
                .map(|entry| *entry.key())
                .collect();

            for channel_id in empty_channels {
                let channels = channels.clone();
                let manager = self.clone();
                let grace = self.channel_idle_grace;
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    if manager.session_count(channel_id) == 0 {
                        channels.stop_channel(channel_id).await;
                    }
                });
            }
        }
    }
}

impl SessionControl for SessionManager {
    fn close_all(&self, channel_id: ChannelId) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let ids: Vec<SessionId> = self
                .sessions
                .iter()
                .filter(|entry| entry.channel_id == channel_id)
                .map(|entry| *entry.key())
                .collect();
            for id in ids {
                self.close_session(id, SessionCloseReason::ChannelStopped);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_session_respects_per_channel_cap() {
        let (manager, _rx) = SessionManager::new(2, Duration::from_secs(30), Duration::from_secs(5));
        assert!(manager.open_session(1).is_ok());
        assert!(manager.open_session(1).is_ok());
        let err = manager.open_session(1).unwrap_err();
        assert!(matches!(err, SessionError::ChannelFull { channel_id: 1, max: 2 }));
    }

    #[test]
    fn closing_a_session_frees_capacity() {
        let (manager, _rx) = SessionManager::new(1, Duration::from_secs(30), Duration::from_secs(5));
        let id = manager.open_session(5).unwrap();
        manager.close_session(id, SessionCloseReason::ClientDisconnected);
        assert_eq!(manager.session_count(5), 0);
        assert!(manager.open_session(5).is_ok());
    }

    #[test]
    fn different_channels_have_independent_caps() {
        let (manager, _rx) = SessionManager::new(1, Duration::from_secs(30), Duration::from_secs(5));
        assert!(manager.open_session(1).is_ok());
        assert!(manager.open_session(2).is_ok());
    }

    #[tokio::test]
    async fn close_all_only_closes_sessions_on_that_channel() {
        let (manager, _rx) = SessionManager::new(4, Duration::from_secs(30), Duration::from_secs(5));
        manager.open_session(1).unwrap();
        manager.open_session(2).unwrap();
        manager.close_all(1).await;
        assert_eq!(manager.session_count(1), 0);
        assert_eq!(manager.session_count(2), 1);
    }
}
