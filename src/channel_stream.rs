//! C6: per-channel supervisor. Owns the FFmpeg process pool handle, the
//! timeline cursor, and the ring buffer; advances between items and
//! recovers from process failure.
//!
//! Generalizes the teacher's `BufferedStream` (a reader + stderr task pair
//! hand-spawned per stream-proxy request) into a long-lived state machine
//! task: one `ChannelStream` per channel, driven by an internal `mpsc`
//! command channel plus a `tokio::time::interval` tick, with state exposed
//! read-only via `watch::Receiver<ChannelState>` so C7/C8/C10/C11 and
//! `/metrics` can observe it without touching the task's internals.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::buffer::{RingBuffer, RingReader};
use crate::capability::{ChannelId, FallbackSource};
use crate::clock::Clock;
use crate::ffmpeg::{peek_sync_bytes, FfmpegPool, ProcessTags};
use crate::timeline::{Anchor, BuildOutcome, Candidate, PlayoutItem, TimelineBuilder};

const SYNC_BYTE: u8 = 0x47;
const SYNC_PROBE_BYTES: usize = 188 * 3;
const RECOVERY_BACKOFFS_SECS: [u64; 5] = [1, 2, 4, 8, 16];

/// A classified-elsewhere stderr line, forwarded to whoever is consuming
/// them (the self-healing loop) without this module depending on
/// `crate::healing` itself — the same arm's-length shape `capability`
/// traits give the resolver/channel-manager/session-manager split.
pub type StderrEvent = (ChannelId, String);

#[derive(Debug, Error)]
pub enum ChannelStreamError {
    #[error("data source error: {0}")]
    DataSource(String),
    #[error("no schedule configured for channel {0}")]
    NoSchedule(ChannelId),
    #[error("ffmpeg pool rejected spawn: {0}")]
    Pool(#[from] crate::ffmpeg::PoolError),
    #[error("channel reached max consecutive recovery failures")]
    Escalated,
}

/// Read-only snapshot of a ChannelStream's state, published via `watch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Starting,
    Running,
    Advancing,
    Recovering,
    Stopping,
    Stopped,
}

/// Hands the builder what it needs without requiring this module to know
/// about Diesel directly; a Diesel-backed implementation is wired in by the
/// `Engine` at construction time.
pub trait PlayoutDataSource: Send + Sync {
    fn load_schedule_items(&self, channel_id: ChannelId) -> Result<Vec<crate::db::models::ScheduleItem>, ChannelStreamError>;
    fn load_anchor(&self, channel_id: ChannelId) -> Result<Anchor, ChannelStreamError>;
    fn save_anchor_and_items(
        &self,
        channel_id: ChannelId,
        anchor: &Anchor,
        items: &[PlayoutItem],
    ) -> Result<(), ChannelStreamError>;
    fn resolve_collection(&self, collection_type: &str, collection_ref: &str) -> Vec<Candidate>;
    fn resolve_filler(&self, media_item_id: i32) -> Option<Candidate>;

    /// Async because server-library sources (Plex/Jellyfin/Emby) require an
    /// HTTP round trip (see `crate::resolver`); boxed so the trait stays
    /// object-safe without an `async-trait` dependency, same as
    /// `crate::capability`.
    fn resolve_ffmpeg_input(
        &self,
        media_item_id: i32,
    ) -> crate::capability::BoxFuture<'_, Result<String, ChannelStreamError>>;

    fn save_position(&self, channel_id: ChannelId, item_index: i32, media_item_id: Option<i32>);
    fn ffmpeg_args(&self, channel_id: ChannelId, input_url: &str) -> Vec<String>;

    /// Already-committed items in `[after, before)`, used by the EPG
    /// projector (C9) to stitch the previously materialized prefix onto
    /// what a fresh `TimelineBuilder::build` call produces from the anchor
    /// forward, without re-deriving them.
    fn load_materialized_items(
        &self,
        channel_id: ChannelId,
        after: chrono::DateTime<chrono::Utc>,
        before: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<PlayoutItem>, ChannelStreamError>;

    fn media_metadata(&self, media_item_id: i32) -> Option<crate::db::models::MediaItemRow>;
}

enum Command {
    Subscribe(mpsc::Sender<RingReader>),
    Stop,
}

/// Handle returned to callers (the ChannelManager) for a running
/// ChannelStream's supervisor task.
pub struct ChannelStreamHandle {
    channel_id: ChannelId,
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ChannelState>,
    subscriber_count: Arc<AtomicI32>,
    task: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
}

impl ChannelStreamHandle {
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    pub fn subscriber_count(&self) -> i32 {
        self.subscriber_count.load(Ordering::Relaxed)
    }

    pub async fn subscribe(&self) -> Result<RingReader, ChannelStreamError> {
        let (tx, mut rx) = mpsc::channel(1);
        self.commands
            .send(Command::Subscribe(tx))
            .map_err(|_| ChannelStreamError::DataSource("channel stream task gone".to_string()))?;
        rx.recv()
            .await
            .ok_or_else(|| ChannelStreamError::DataSource("subscribe reply dropped".to_string()))
    }

    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
        self.cancel.cancel();
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Spawn the long-lived supervisor task for `channel_id` and return a handle
/// to it. `horizon` bounds how far ahead the timeline builder materializes
/// on each refill.
#[allow(clippy::too_many_arguments)]
pub fn spawn(
    channel_id: ChannelId,
    pool: Arc<FfmpegPool>,
    data: Arc<dyn PlayoutDataSource>,
    clock: Arc<dyn Clock>,
    ring_capacity_bytes: usize,
    horizon: chrono::Duration,
    max_consecutive_failures: u32,
    startup_timeout: Duration,
    stall_timeout: Duration,
    fallback: Option<Arc<dyn FallbackSource>>,
    stderr_tx: Option<mpsc::UnboundedSender<StderrEvent>>,
) -> ChannelStreamHandle {
    let (state_tx, state_rx) = watch::channel(ChannelState::Idle);
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let subscriber_count = Arc::new(AtomicI32::new(0));

    let task = tokio::spawn(run(
        channel_id,
        pool,
        data,
        clock,
        ring_capacity_bytes,
        horizon,
        max_consecutive_failures,
        startup_timeout,
        stall_timeout,
        fallback,
        stderr_tx,
        state_tx,
        commands_rx,
        cancel.clone(),
        subscriber_count.clone(),
    ));

    ChannelStreamHandle {
        channel_id,
        commands: commands_tx,
        state_rx,
        subscriber_count,
        task,
        cancel,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    channel_id: ChannelId,
    pool: Arc<FfmpegPool>,
    data: Arc<dyn PlayoutDataSource>,
    clock: Arc<dyn Clock>,
    ring_capacity_bytes: usize,
    horizon: chrono::Duration,
    max_consecutive_failures: u32,
    startup_timeout: Duration,
    stall_timeout: Duration,
    fallback: Option<Arc<dyn FallbackSource>>,
    stderr_tx: Option<mpsc::UnboundedSender<StderrEvent>>,
    state_tx: watch::Sender<ChannelState>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    subscriber_count: Arc<AtomicI32>,
) {
    let _ = state_tx.send(ChannelState::Starting);

    let ring = RingBuffer::new(ring_capacity_bytes);
    let mut consecutive_failures: u32 = 0;
    let mut backoff_index = 0usize;
    let mut pending_items: Vec<PlayoutItem> = Vec::new();
    let mut item_index: i32 = 0;

    'supervisor: loop {
        if cancel.is_cancelled() {
            break;
        }

        if pending_items.is_empty() {
            match refill(&*data, channel_id, horizon, &*clock) {
                Ok(items) => pending_items = items,
                Err(err) => {
                    error!(channel_id, %err, "failed to build timeline, entering recovery");
                    if recover_after_failure(
                        channel_id,
                        &state_tx,
                        &ring,
                        &fallback,
                        &mut consecutive_failures,
                        max_consecutive_failures,
                        &mut backoff_index,
                        &mut commands,
                        &subscriber_count,
                        &cancel,
                    )
                    .await
                    {
                        break 'supervisor;
                    }
                    continue;
                }
            }
        }

        let Some(item) = pending_items.first().cloned() else {
            // Builder produced nothing at all; back off and retry, still
            // answering subscribers with whatever fallback is in the ring.
            if recover_after_failure(
                channel_id,
                &state_tx,
                &ring,
                &fallback,
                &mut consecutive_failures,
                max_consecutive_failures,
                &mut backoff_index,
                &mut commands,
                &subscriber_count,
                &cancel,
            )
            .await
            {
                break 'supervisor;
            }
            continue;
        };

        let input_url = match item.media_item_id {
            Some(id) => match data.resolve_ffmpeg_input(id).await {
                Ok(url) => Some(url),
                Err(err) => {
                    warn!(channel_id, %err, "could not resolve media url, skipping item");
                    pending_items.remove(0);
                    continue;
                }
            },
            None => None,
        };

        let Some(input_url) = input_url else {
            // A filler/offline item with no media ref: just wait out its
            // duration rather than spawning ffmpeg.
            pending_items.remove(0);
            item_index += 1;
            continue;
        };

        let args = data.ffmpeg_args(channel_id, &input_url);
        let tags = ProcessTags {
            channel_id,
            purpose: "playout",
        };

        let mut handle = match pool
            .try_spawn(&args, tags, false, Duration::from_secs(5))
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                warn!(channel_id, %err, "ffmpeg pool refused spawn, recovering");
                if recover_after_failure(
                    channel_id,
                    &state_tx,
                    &ring,
                    &fallback,
                    &mut consecutive_failures,
                    max_consecutive_failures,
                    &mut backoff_index,
                    &mut commands,
                    &subscriber_count,
                    &cancel,
                )
                .await
                {
                    break 'supervisor;
                }
                continue;
            }
        };

        let Some(mut stdout) = handle.take_stdout() else {
            consecutive_failures += 1;
            continue;
        };

        let probe = match tokio::time::timeout(
            startup_timeout,
            peek_sync_bytes(&mut stdout, SYNC_PROBE_BYTES),
        )
        .await
        {
            Ok(Ok(bytes)) if has_sync_byte(&bytes) => bytes,
            Ok(_) => {
                warn!(channel_id, "ffmpeg produced no valid mpeg-ts sync byte, recovering");
                pool.stop(handle, Duration::from_secs(2)).await;
                if recover_after_failure(
                    channel_id,
                    &state_tx,
                    &ring,
                    &fallback,
                    &mut consecutive_failures,
                    max_consecutive_failures,
                    &mut backoff_index,
                    &mut commands,
                    &subscriber_count,
                    &cancel,
                )
                .await
                {
                    break 'supervisor;
                }
                continue;
            }
            Err(_) => {
                warn!(channel_id, ?startup_timeout, "ffmpeg produced no stdout within startup_timeout, recovering");
                pool.stop(handle, Duration::from_secs(2)).await;
                if recover_after_failure(
                    channel_id,
                    &state_tx,
                    &ring,
                    &fallback,
                    &mut consecutive_failures,
                    max_consecutive_failures,
                    &mut backoff_index,
                    &mut commands,
                    &subscriber_count,
                    &cancel,
                )
                .await
                {
                    break 'supervisor;
                }
                continue;
            }
        };

        consecutive_failures = 0;
        backoff_index = 0;
        let _ = state_tx.send(ChannelState::Running);
        ring.push(Bytes::from(probe));
        data.save_position(channel_id, item_index, item.media_item_id);

        let item_deadline = tokio::time::Instant::now()
            + (item.finish_time - Utc::now())
                .to_std()
                .unwrap_or(Duration::from_secs(0));

        let mut buf = vec![0u8; 188 * 1000];
        let mut item_finished_naturally = false;
        let mut stalled = false;

        let stall_timer = tokio::time::sleep(stall_timeout);
        tokio::pin!(stall_timer);

        'item: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'supervisor;
                }
                cmd = commands.recv() => {
                    match cmd {
                        Some(Command::Subscribe(reply)) => {
                            subscriber_count.fetch_add(1, Ordering::Relaxed);
                            let _ = reply.send(ring.subscribe()).await;
                        }
                        Some(Command::Stop) | None => {
                            break 'supervisor;
                        }
                    }
                }
                _ = tokio::time::sleep_until(item_deadline) => {
                    item_finished_naturally = true;
                    break 'item;
                }
                _ = &mut stall_timer => {
                    warn!(channel_id, ?stall_timeout, "no ffmpeg output within stall_timeout, recovering");
                    stalled = true;
                    break 'item;
                }
                read = read_chunk(&mut stdout, &mut buf) => {
                    match read {
                        Ok(Some(chunk)) => {
                            ring.push(chunk);
                            stall_timer.as_mut().reset(tokio::time::Instant::now() + stall_timeout);
                        }
                        Ok(None) => {
                            // EOF: ffmpeg exited on its own, treat as item end.
                            item_finished_naturally = true;
                            break 'item;
                        }
                        Err(err) => {
                            warn!(channel_id, %err, "ffmpeg read error, recovering");
                            break 'item;
                        }
                    }
                }
                line = handle.stderr_lines.recv() => {
                    if let (Some(line), Some(tx)) = (line, &stderr_tx) {
                        let _ = tx.send((channel_id, line));
                    }
                }
            }
        }

        let _ = state_tx.send(ChannelState::Advancing);
        pool.stop(handle, Duration::from_secs(2)).await;
        if item_finished_naturally {
            pending_items.remove(0);
            item_index += 1;
            consecutive_failures = 0;
            backoff_index = 0;
        } else {
            if stalled {
                warn!(channel_id, "ffmpeg stalled mid-item, restarting same item");
            }
            if recover_after_failure(
                channel_id,
                &state_tx,
                &ring,
                &fallback,
                &mut consecutive_failures,
                max_consecutive_failures,
                &mut backoff_index,
                &mut commands,
                &subscriber_count,
                &cancel,
            )
            .await
            {
                break 'supervisor;
            }
        }
    }

    let _ = state_tx.send(ChannelState::Stopping);
    ring.close();
    let _ = state_tx.send(ChannelState::Stopped);
}

async fn read_chunk(
    stdout: &mut tokio::process::ChildStdout,
    buf: &mut [u8],
) -> std::io::Result<Option<Bytes>> {
    use tokio::io::AsyncReadExt;
    let n = stdout.read(buf).await?;
    if n == 0 {
        Ok(None)
    } else {
        Ok(Some(Bytes::copy_from_slice(&buf[..n])))
    }
}

fn has_sync_byte(bytes: &[u8]) -> bool {
    if bytes.len() < 188 {
        return false;
    }
    (0..bytes.len().saturating_sub(187)).step_by(188).any(|offset| bytes[offset] == SYNC_BYTE)
}

/// Attach whatever the configured [`FallbackSource`] has on hand to the
/// ring buffer the instant a channel enters `Recovering`, so subscribers
/// already attached keep receiving bytes while the supervisor retries
/// (SPEC_FULL.md §8 scenario 2: "within 2s a fallback filler begins
/// filling the ring buffer").
async fn push_fallback(ring: &Arc<RingBuffer>, fallback: &Option<Arc<dyn FallbackSource>>, channel_id: ChannelId) {
    if let Some(fallback) = fallback {
        if let Some(bytes) = fallback.stream(channel_id).await {
            ring.push(bytes);
        }
    }
}

/// Backs off between recovery attempts while still servicing `Subscribe`
/// commands, so a client joining mid-recovery gets `ring.subscribe()`
/// immediately instead of waiting for the next spawn attempt to reach the
/// `'item` select (the only place that used to answer them). Returns `true`
/// if the supervisor loop should stop entirely (cancelled or told to stop).
async fn wait_backoff_servicing_commands(
    backoff_index: &mut usize,
    ring: &Arc<RingBuffer>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    subscriber_count: &Arc<AtomicI32>,
    cancel: &CancellationToken,
) -> bool {
    let secs = RECOVERY_BACKOFFS_SECS[(*backoff_index).min(RECOVERY_BACKOFFS_SECS.len() - 1)];
    *backoff_index += 1;
    let sleep = tokio::time::sleep(Duration::from_secs(secs));
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return true,
            _ = &mut sleep => return false,
            cmd = commands.recv() => {
                match cmd {
                    Some(Command::Subscribe(reply)) => {
                        subscriber_count.fetch_add(1, Ordering::Relaxed);
                        let _ = reply.send(ring.subscribe()).await;
                    }
                    Some(Command::Stop) | None => return true,
                }
            }
        }
    }
}

/// Common "enter Recovering, push fallback, count the failure, maybe
/// escalate, back off" sequence shared by every post-spawn failure path.
/// Returns `true` if the supervisor loop should stop entirely.
#[allow(clippy::too_many_arguments)]
async fn recover_after_failure(
    channel_id: ChannelId,
    state_tx: &watch::Sender<ChannelState>,
    ring: &Arc<RingBuffer>,
    fallback: &Option<Arc<dyn FallbackSource>>,
    consecutive_failures: &mut u32,
    max_consecutive_failures: u32,
    backoff_index: &mut usize,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    subscriber_count: &Arc<AtomicI32>,
    cancel: &CancellationToken,
) -> bool {
    let _ = state_tx.send(ChannelState::Recovering);
    push_fallback(ring, fallback, channel_id).await;
    *consecutive_failures += 1;
    if *consecutive_failures > max_consecutive_failures {
        error!(channel_id, "escalating after repeated recovery failures");
        return true;
    }
    wait_backoff_servicing_commands(backoff_index, ring, commands, subscriber_count, cancel).await
}

fn refill(
    data: &dyn PlayoutDataSource,
    channel_id: ChannelId,
    horizon: chrono::Duration,
    clock: &dyn Clock,
) -> Result<Vec<PlayoutItem>, ChannelStreamError> {
    let schedule_items = data.load_schedule_items(channel_id)?;
    if schedule_items.is_empty() {
        return Err(ChannelStreamError::NoSchedule(channel_id));
    }
    let anchor = data.load_anchor(channel_id)?;

    let mut resolve_collection = |collection_type: &str, collection_ref: &str| {
        data.resolve_collection(collection_type, collection_ref)
    };
    let mut resolve_filler = |media_item_id: i32| data.resolve_filler(media_item_id);

    let outcome = TimelineBuilder::build(
        channel_id,
        &schedule_items,
        &anchor,
        horizon,
        clock,
        &mut resolve_collection,
        &mut resolve_filler,
    );

    match outcome {
        BuildOutcome::Fail(reason) => Err(ChannelStreamError::DataSource(reason)),
        BuildOutcome::Ok(items, new_anchor) | BuildOutcome::Warn(items, new_anchor, _) => {
            data.save_anchor_and_items(channel_id, &new_anchor, &items)?;
            Ok(items)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_byte_detection_requires_188_aligned_0x47() {
        let mut bytes = vec![0u8; 188 * 3];
        assert!(!has_sync_byte(&bytes));
        bytes[0] = SYNC_BYTE;
        assert!(has_sync_byte(&bytes));
    }

    #[test]
    fn sync_byte_at_second_packet_boundary_is_detected() {
        let mut bytes = vec![0u8; 188 * 3];
        bytes[188] = SYNC_BYTE;
        assert!(has_sync_byte(&bytes));
    }

    #[test]
    fn short_buffer_never_has_sync_byte() {
        let bytes = vec![SYNC_BYTE; 10];
        assert!(!has_sync_byte(&bytes));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_services_a_subscribe_without_waiting_out_the_sleep() {
        let ring = RingBuffer::new(1024);
        let (commands_tx, mut commands_rx) = mpsc::unbounded_channel();
        let subscriber_count = Arc::new(AtomicI32::new(0));
        let cancel = CancellationToken::new();

        let ring_clone = ring.clone();
        let subscriber_count_clone = subscriber_count.clone();
        let cancel_clone = cancel.clone();
        let task = tokio::spawn(async move {
            // index 3 -> an 8s backoff; the test would hang waiting on a
            // paused clock if the command were not serviced independently
            // of the sleep.
            let mut backoff_index = 3usize;
            wait_backoff_servicing_commands(
                &mut backoff_index,
                &ring_clone,
                &mut commands_rx,
                &subscriber_count_clone,
                &cancel_clone,
            )
            .await
        });

        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        commands_tx.send(Command::Subscribe(reply_tx)).unwrap();

        let _reader = reply_rx.recv().await.expect("subscribe should be answered mid-backoff");
        assert_eq!(subscriber_count.load(Ordering::Relaxed), 1);

        cancel.cancel();
        assert!(task.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_elapses_normally_when_nothing_is_pending() {
        let ring = RingBuffer::new(1024);
        let (_commands_tx, mut commands_rx) = mpsc::unbounded_channel();
        let subscriber_count = Arc::new(AtomicI32::new(0));
        let cancel = CancellationToken::new();
        let mut backoff_index = 0usize;

        let stopped = wait_backoff_servicing_commands(
            &mut backoff_index,
            &ring,
            &mut commands_rx,
            &subscriber_count,
            &cancel,
        )
        .await;

        assert!(!stopped);
        assert_eq!(backoff_index, 1);
    }
}
