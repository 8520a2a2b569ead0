//! C11: the self-healing loop.
//!
//! Consumes the [`crate::channel_stream::StderrEvent`] stream every
//! `ChannelStream` supervisor forwards its FFmpeg stderr through, classifies
//! each error line, and — within the rate and risk limits configured in
//! [`crate::config::SelfHealConfig`] — drives a restart through the
//! [`crate::capability::ChannelControl`] capability. It never depends on the
//! concrete `ChannelManager`, only the trait, so it can be wired up (or
//! swapped for a no-op during tests) independently of the channel registry.

pub mod classify;
pub mod resolver;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capability::{ChannelControl, ChannelId};
use crate::channel_stream::StderrEvent;
use crate::config::SelfHealConfig;

use classify::classify;
use resolver::{resolve, ResolutionRisk, ResolutionStrategy};

pub struct HealingLoop {
    config: SelfHealConfig,
    channels: Arc<dyn ChannelControl>,
}

impl HealingLoop {
    pub fn new(config: SelfHealConfig, channels: Arc<dyn ChannelControl>) -> Arc<Self> {
        Arc::new(Self { config, channels })
    }

    /// Runs until `shutdown` is cancelled or the stderr channel closes
    /// (meaning every `ChannelManager` it was wired to has been dropped).
    /// Takes `self` behind an `Arc` so the `Engine` can hold the same
    /// instance it handed to `tokio::spawn`.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<StderrEvent>, shutdown: CancellationToken) {
        let mut tracker = HealthTracker::new(self.config.max_auto_fixes_per_hour);
        let mut consecutive_failures: HashMap<ChannelId, u32> = HashMap::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => {
                    match event {
                        Some((channel_id, line)) => {
                            self.handle_line(channel_id, &line, &mut tracker, &mut consecutive_failures).await;
                        }
                        None => break,
                    }
                }
            }
        }
    }

    async fn handle_line(
        &self,
        channel_id: ChannelId,
        line: &str,
        tracker: &mut HealthTracker,
        consecutive_failures: &mut HashMap<ChannelId, u32>,
    ) {
        if !self.config.enabled {
            return;
        }

        let Some(classified) = classify(line) else {
            return;
        };
        if !classified.requires_restart {
            return;
        }

        if !tracker.try_consume() {
            warn!(channel_id, "self-heal rate limit reached, not applying any more fixes this hour");
            return;
        }

        let failures = consecutive_failures.entry(channel_id).or_insert(0);
        if *failures >= self.config.max_consecutive_failures {
            warn!(
                channel_id,
                failures = *failures,
                "channel exceeded consecutive self-heal attempts, escalating instead of retrying"
            );
            return;
        }

        let max_risk = ResolutionRisk::from_level(self.config.require_approval_above_risk);
        let fix = resolve(classified.error_type, max_risk);

        match fix.strategy {
            ResolutionStrategy::Restart if fix.risk <= max_risk => {
                info!(channel_id, error = ?classified.error_type, risk = ?fix.risk, "applying automatic restart");
                self.channels.restart_channel(channel_id).await;
                *failures += 1;
            }
            ResolutionStrategy::Restart => {
                warn!(channel_id, risk = ?fix.risk, "fix exceeds configured risk threshold, requires manual approval");
            }
            ResolutionStrategy::Fallback => {
                debug!(channel_id, "relying on the channel's configured fallback source during recovery");
            }
            ResolutionStrategy::Ignore => {
                debug!(channel_id, message = %classified.message, "transient error, taking no action");
            }
        }
    }
}

/// Sliding-hour token bucket for `max_auto_fixes_per_hour`. A fixed window
/// rather than a true sliding one — simple, and matches the prototype's
/// `_hour_start`/`_fixes_this_hour` reset-on-expiry behavior.
struct HealthTracker {
    max_per_hour: u32,
    used: u32,
    window_start: Instant,
}

impl HealthTracker {
    fn new(max_per_hour: u32) -> Self {
        Self { max_per_hour, used: 0, window_start: Instant::now() }
    }

    fn try_consume(&mut self) -> bool {
        if self.window_start.elapsed() >= Duration::from_secs(3600) {
            self.used = 0;
            self.window_start = Instant::now();
        }
        if self.used >= self.max_per_hour {
            return false;
        }
        self.used += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::BoxFuture;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingControl {
        restarts: AtomicU32,
    }

    impl ChannelControl for CountingControl {
        fn stop_channel(&self, _channel_id: ChannelId) -> BoxFuture<'_, ()> {
            Box::pin(async {})
        }

        fn restart_channel(&self, _channel_id: ChannelId) -> BoxFuture<'_, ()> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    #[tokio::test]
    async fn critical_error_triggers_restart() {
        let control = Arc::new(CountingControl { restarts: AtomicU32::new(0) });
        let healing = HealingLoop::new(SelfHealConfig::default(), control.clone());
        let mut tracker = HealthTracker::new(10);
        let mut failures = HashMap::new();

        healing
            .handle_line(1, "Decoder (codec h265) not found", &mut tracker, &mut failures)
            .await;

        assert_eq!(control.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn progress_lines_never_trigger_a_restart() {
        let control = Arc::new(CountingControl { restarts: AtomicU32::new(0) });
        let healing = HealingLoop::new(SelfHealConfig::default(), control.clone());
        let mut tracker = HealthTracker::new(10);
        let mut failures = HashMap::new();

        healing
            .handle_line(1, "frame=100 fps=30 bitrate=1000kbits/s speed=1.0x", &mut tracker, &mut failures)
            .await;

        assert_eq!(control.restarts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disabled_healing_never_restarts() {
        let control = Arc::new(CountingControl { restarts: AtomicU32::new(0) });
        let mut config = SelfHealConfig::default();
        config.enabled = false;
        let healing = HealingLoop::new(config, control.clone());
        let mut tracker = HealthTracker::new(10);
        let mut failures = HashMap::new();

        healing
            .handle_line(1, "Decoder (codec h265) not found", &mut tracker, &mut failures)
            .await;

        assert_eq!(control.restarts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn consecutive_failure_cap_stops_further_restarts() {
        let control = Arc::new(CountingControl { restarts: AtomicU32::new(0) });
        let mut config = SelfHealConfig::default();
        config.max_consecutive_failures = 2;
        let healing = HealingLoop::new(config, control.clone());
        let mut tracker = HealthTracker::new(100);
        let mut failures = HashMap::new();

        for _ in 0..5 {
            healing
                .handle_line(1, "Decoder (codec h265) not found", &mut tracker, &mut failures)
                .await;
        }

        assert_eq!(control.restarts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn tracker_resets_after_expiry() {
        let mut tracker = HealthTracker::new(1);
        assert!(tracker.try_consume());
        assert!(!tracker.try_consume());
        tracker.window_start = Instant::now() - Duration::from_secs(3601);
        assert!(tracker.try_consume());
    }
}
