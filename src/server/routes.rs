use axum::{routing::get, Router};

use super::handlers::{
    discover_json, epg_xml, fallback_handler, health_check, lineup_json, lineup_status_json,
    playlist_m3u, stream_by_auto_number, stream_by_iptv_channel,
};
use super::metrics::metrics;
use super::state::AppState;

/// Router for the tuner-compatible HTTP surface (SPEC_FULL.md §4.6). Every
/// stream-serving alias — the HDHomeRun-prefixed path and the two IPTV
/// aliases — resolves to the same handler (§9: "exactly one stream-serving
/// path").
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/playlist.m3u", get(playlist_m3u))
        .route("/epg.xml", get(epg_xml))
        .route("/iptv/xmltv.xml", get(epg_xml))
        .route("/hdhomerun/epg", get(epg_xml))
        .route("/discover.json", get(discover_json))
        .route("/lineup.json", get(lineup_json))
        .route("/lineup_status.json", get(lineup_status_json))
        .route("/{prefix}/auto/{v_number}", get(stream_by_auto_number))
        .route("/iptv/channel/{filename}", get(stream_by_iptv_channel))
        .route("/metrics", get(metrics))
        .fallback(fallback_handler)
        .with_state(state)
}
