//! HTTP handlers for the tuner-compatible surface (SPEC_FULL.md §4.6): one
//! handler per endpoint family, all reached through the `Engine` state
//! instead of the teacher's Xtream/XMLTV-account schema and accounts-based
//! failover. ETag/cache-control conventions for the EPG and M3U endpoints,
//! and the stream handler's cleanup-on-drop wrapper, are kept from the
//! teacher's `server::handlers` as-is.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, Response, StatusCode},
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use diesel::prelude::*;
use futures_util::{Stream, StreamExt};
use serde::Serialize;

use super::hdhr;
use super::m3u;
use super::state::{base_url, AppState};
use crate::db::models::Channel;
use crate::db::schema::channels;
use crate::session::SessionCloseReason;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

pub async fn health_check() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
        }),
    )
}

pub async fn fallback_handler() -> StatusCode {
    StatusCode::NOT_FOUND
}

fn generate_etag(content: &str) -> String {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// Shared by every cacheable text endpoint (M3U, XMLTV): honors
/// `If-None-Match`, otherwise serves the body with a 5-minute
/// `Cache-Control` and a strong `ETag`.
fn cached_text_response(content: String, content_type: &'static str, headers: &HeaderMap) -> impl IntoResponse {
    let etag = format!("\"{}\"", generate_etag(&content));

    if let Some(client_etag) = headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
        if client_etag == etag {
            let mut response_headers = HeaderMap::new();
            response_headers.insert(header::ETAG, HeaderValue::from_str(&etag).unwrap());
            response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("public, max-age=300"));
            return (StatusCode::NOT_MODIFIED, response_headers, String::new());
        }
    }

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response_headers.insert(header::ETAG, HeaderValue::from_str(&etag).unwrap());
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("public, max-age=300"));
    (StatusCode::OK, response_headers, content)
}

pub async fn playlist_m3u(
    State(engine): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let mut conn = engine.db.get().map_err(|e| {
        tracing::error!(error = %e, "m3u playlist: database connection failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "Service temporarily unavailable".to_string())
    })?;

    let base = base_url(&engine, &headers);
    let content = m3u::generate_m3u_playlist(&mut conn, &base).map_err(|e| {
        tracing::error!(error = %e, "m3u playlist: generation failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "Unable to generate playlist".to_string())
    })?;

    Ok(cached_text_response(content, "audio/x-mpegurl", &headers))
}

pub async fn epg_xml(
    State(engine): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let content = engine.epg.generate_xmltv("exstreamtv-core").map_err(|e| {
        tracing::error!(error = %e, "xmltv epg: generation failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
    })?;

    Ok(cached_text_response(content, "application/xml; charset=utf-8", &headers))
}

pub async fn discover_json(
    State(engine): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let base = base_url(&engine, &headers);
    let device_id = hdhr::generate_device_id(engine.config.hdhomerun.device_id.as_deref());
    let response = hdhr::generate_discover_response(
        &base,
        &engine.config.hdhomerun.friendly_name,
        &device_id,
        engine.config.hdhomerun.tuner_count,
    );

    Ok(Json(response))
}

pub async fn lineup_json(
    State(engine): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let mut conn = engine.db.get().map_err(|e| {
        tracing::error!(error = %e, "lineup: database connection failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
    })?;

    let base = base_url(&engine, &headers);
    let lineup = hdhr::generate_lineup(&mut conn, &base).map_err(|e| {
        tracing::error!(error = %e, "lineup: generation failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
    })?;

    Ok(Json(lineup))
}

pub async fn lineup_status_json() -> impl IntoResponse {
    Json(hdhr::generate_lineup_status())
}

fn lookup_channel_by_number(conn: &mut crate::db::DbPooledConnection, channel_number: &str) -> Result<Option<Channel>, diesel::result::Error> {
    channels::table
        .filter(channels::channel_number.eq(channel_number))
        .filter(channels::enabled.eq(1))
        .first::<Channel>(conn)
        .optional()
}

/// Strips a trailing `.ts`/`.m3u8` extension, if any, leaving the channel
/// number the same way `/<prefix>/auto/v<number>` already does.
fn channel_number_from_filename(filename: &str) -> &str {
    filename
        .strip_suffix(".m3u8")
        .or_else(|| filename.strip_suffix(".ts"))
        .unwrap_or(filename)
}

/// The one stream-serving path every tuner-surface alias resolves to
/// (SPEC_FULL.md §9): `/<prefix>/auto/v<number>`.
pub async fn stream_by_auto_number(
    Path((_prefix, v_number)): Path<(String, String)>,
    State(engine): State<AppState>,
) -> Result<impl IntoResponse, StatusCode> {
    let number = v_number.strip_prefix('v').unwrap_or(&v_number);
    serve_stream(engine, number).await
}

/// `/iptv/channel/<number>.ts` and `/iptv/channel/<number>.m3u8`.
pub async fn stream_by_iptv_channel(
    Path(filename): Path<String>,
    State(engine): State<AppState>,
) -> Result<impl IntoResponse, StatusCode> {
    serve_stream(engine, channel_number_from_filename(&filename)).await
}

async fn serve_stream(engine: AppState, channel_number: &str) -> Result<Response<Body>, StatusCode> {
    let channel = {
        let mut conn = engine.db.get().map_err(|e| {
            tracing::error!(error = %e, "stream: database connection failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
        lookup_channel_by_number(&mut conn, channel_number).map_err(|e| {
            tracing::error!(error = %e, "stream: channel lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
    };

    // SPEC_FULL.md §7 taxonomy, kind 6: unknown/disabled channel is the only
    // client-visible failure this surface produces; everything else either
    // streams filler or ends the connection cleanly.
    let Some(channel) = channel else {
        return Err(StatusCode::NOT_FOUND);
    };

    let session_id = engine.sessions.open_session(channel.id).map_err(|e| {
        tracing::warn!(channel_id = channel.id, error = %e, "stream: session admission refused");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    let reader = engine.channels.get_channel_stream(channel.id).await.map_err(|e| {
        tracing::error!(channel_id = channel.id, error = %e, "stream: channel stream unavailable");
        engine.sessions.close_session(session_id, SessionCloseReason::ClientDisconnected);
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    // A `CloseReason` is the end of the stream, not an error worth
    // forwarding to the client's byte stream — drop it and let the body end.
    let body_stream = reader
        .take_while(|item| futures_util::future::ready(item.is_ok()))
        .map(|item| Ok::<Bytes, std::io::Error>(item.expect("take_while stops at the first Err")));

    let body = Body::from_stream(SessionCleanupStream {
        inner: Box::pin(body_stream),
        sessions: engine.sessions.clone(),
        session_id,
    });

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let resp_headers = response.headers_mut();
    resp_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp2t"));
    resp_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache, no-store, must-revalidate, private"));
    resp_headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    resp_headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    resp_headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));

    Ok(response)
}

/// Closes the session the moment the client disconnects or the body is
/// otherwise dropped, mirroring the teacher's `SessionCleanupStream`.
struct SessionCleanupStream<S> {
    inner: Pin<Box<S>>,
    sessions: std::sync::Arc<crate::session::SessionManager>,
    session_id: crate::session::SessionId,
}

impl<S, T, E> Stream for SessionCleanupStream<S>
where
    S: Stream<Item = Result<T, E>> + Unpin,
{
    type Item = Result<T, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let poll = self.inner.as_mut().poll_next(cx);
        if let Poll::Ready(Some(Ok(_))) = &poll {
            self.sessions.record_read(self.session_id);
        }
        poll
    }
}

impl<S> Drop for SessionCleanupStream<S> {
    fn drop(&mut self) {
        self.sessions.close_session(self.session_id, SessionCloseReason::ClientDisconnected);
    }
}
