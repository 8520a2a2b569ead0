//! Axum application state: the `Engine` composition root, plus the one
//! request-scoped computation ([`base_url`]) none of its fields alone can
//! answer because it depends on how the client actually reached the server.

use axum::http::HeaderMap;

use crate::engine::Engine;

pub type AppState = Engine;

/// SPEC_FULL.md §4.6: prefer the operator-configured public URL; otherwise
/// derive scheme+host from the inbound request, replacing a loopback host
/// with a best-effort LAN IP so HDHomeRun clients on the network can reach
/// stream/EPG URLs advertised in discovery, lineup, and XMLTV documents.
pub fn base_url(state: &AppState, headers: &HeaderMap) -> String {
    if let Some(public_url) = &state.config.server.public_url {
        return public_url.trim_end_matches('/').to_string();
    }

    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.to_string())
        .unwrap_or_else(|| format!("{}:{}", state.config.server.host, state.config.server.port));

    let host = if is_loopback_host(&host) {
        let ip = super::hdhr::get_local_ip();
        format!("{ip}:{}", state.config.server.port)
    } else {
        host
    };

    format!("http://{host}")
}

fn is_loopback_host(host: &str) -> bool {
    let addr = host.rsplit_once(':').map(|(addr, _)| addr).unwrap_or(host);
    addr == "localhost" || addr == "127.0.0.1" || addr == "::1" || addr == "0.0.0.0"
}
