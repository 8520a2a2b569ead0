//! `GET /metrics`: Prometheus text exposition.
//!
//! Combines FFmpeg process-pool counters, per-channel subscriber/state
//! gauges, DB pool occupancy, and event-loop lag into one text response —
//! the same composition an earlier Python prototype's
//! `monitoring/prometheus_exporter.py` did, just gathered directly from the
//! `Engine` instead of through callback indirection.

use std::fmt::Write as _;
use std::sync::atomic::Ordering;
use std::time::Instant;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;

use crate::channel_stream::ChannelState;
use crate::engine::Engine;

pub async fn metrics(State(engine): State<Engine>) -> impl IntoResponse {
    let body = render(&engine).await;
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
}

async fn render(engine: &Engine) -> String {
    let mut out = String::new();

    let pool_metrics = &engine.ffmpeg_pool.metrics;
    push_gauge(&mut out, "exstreamtv_ffmpeg_processes_active", "Number of FFmpeg child processes currently running", pool_metrics.active.load(Ordering::Relaxed));
    push_counter(&mut out, "exstreamtv_ffmpeg_spawn_rejected_memory_total", "FFmpeg spawns rejected by the memory budget", pool_metrics.rejected_memory.load(Ordering::Relaxed));
    push_counter(&mut out, "exstreamtv_ffmpeg_spawn_rejected_fd_total", "FFmpeg spawns rejected by the file-descriptor budget", pool_metrics.rejected_fd.load(Ordering::Relaxed));
    push_counter(&mut out, "exstreamtv_ffmpeg_spawn_rejected_capacity_total", "FFmpeg spawns rejected because the pool was at capacity", pool_metrics.rejected_capacity.load(Ordering::Relaxed));

    let db_state = engine.db.state();
    push_gauge(&mut out, "exstreamtv_db_pool_checked_out", "Database connections currently checked out", (db_state.connections - db_state.idle_connections) as u64);
    push_gauge(&mut out, "exstreamtv_db_pool_size", "Total database connections in the pool", db_state.connections as u64);

    write_help_type(&mut out, "exstreamtv_channel_subscribers", "gauge", "Active subscribers for a channel");
    write_help_type(&mut out, "exstreamtv_channel_state", "gauge", "ChannelStream state (0=Idle 1=Starting 2=Running 3=Advancing 4=Recovering 5=Stopping 6=Stopped)");
    for channel_id in engine.channels.active_channel_ids() {
        let subscribers = engine.channels.subscriber_count(channel_id);
        let _ = writeln!(out, "exstreamtv_channel_subscribers{{channel=\"{channel_id}\"}} {subscribers}");
        if let Some(state) = engine.channels.channel_state(channel_id) {
            let _ = writeln!(out, "exstreamtv_channel_state{{channel=\"{channel_id}\"}} {}", channel_state_code(state));
        }
    }

    let t0 = Instant::now();
    tokio::task::yield_now().await;
    let lag = t0.elapsed().as_secs_f64();
    push_gauge_f64(&mut out, "exstreamtv_event_loop_lag_seconds", "Time a yield to the scheduler took to come back", lag);

    out
}

fn channel_state_code(state: ChannelState) -> u8 {
    match state {
        ChannelState::Idle => 0,
        ChannelState::Starting => 1,
        ChannelState::Running => 2,
        ChannelState::Advancing => 3,
        ChannelState::Recovering => 4,
        ChannelState::Stopping => 5,
        ChannelState::Stopped => 6,
    }
}

fn write_help_type(out: &mut String, name: &str, kind: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

fn push_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    write_help_type(out, name, "gauge", help);
    let _ = writeln!(out, "{name} {value}");
}

fn push_gauge_f64(out: &mut String, name: &str, help: &str, value: f64) {
    write_help_type(out, name, "gauge", help);
    let _ = writeln!(out, "{name} {value}");
}

fn push_counter(out: &mut String, name: &str, help: &str, value: u64) {
    write_help_type(out, name, "counter", help);
    let _ = writeln!(out, "{name} {value}");
}
