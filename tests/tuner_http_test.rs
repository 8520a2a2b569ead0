//! End-to-end coverage of the tuner-compatible HTTP surface (SPEC_FULL.md
//! §8): boots the real axum router against a temp-file SQLite database and
//! asserts discovery/lineup/EPG shapes and stream-endpoint behavior,
//! generalizing the teacher's `tests/http_server_test.rs`.

use std::net::SocketAddr;
use std::time::Duration;

use diesel::prelude::*;
use tokio::net::TcpListener;

use exstreamtv_core::config::Config;
use exstreamtv_core::db;
use exstreamtv_core::engine::Engine;
use exstreamtv_core::server::routes::create_router;

fn seed_channel(pool: &db::DbPool, number: &str, name: &str) {
    let mut conn = pool.get().expect("get connection");
    diesel::sql_query(
        "INSERT INTO channels (channel_number, name, enabled, playout_mode, created_at, updated_at) \
         VALUES (?, ?, 1, 'continuous', datetime('now'), datetime('now'))",
    )
    .bind::<diesel::sql_types::Text, _>(number)
    .bind::<diesel::sql_types::Text, _>(name)
    .execute(&mut conn)
    .expect("seed channel");
}

fn build_engine() -> (Engine, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("test.db");
    db::run_migrations(&db_path).expect("run migrations");
    let pool = db::build_pool(&db_path.to_string_lossy(), 4).expect("build pool");

    seed_channel(&pool, "7", "7 News");
    seed_channel(&pool, "12", "Cartoons");

    let config = Config::default();
    (Engine::new(config, pool), dir)
}

async fn start_test_server(engine: Engine) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let app = create_router(engine);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    (addr, handle)
}

#[tokio::test]
async fn health_endpoint_returns_200_and_json() {
    let (engine, _dir) = build_engine();
    let (addr, _handle) = start_test_server(engine).await;

    let client = reqwest::Client::new();
    let response = client.get(format!("http://{addr}/health")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let (engine, _dir) = build_engine();
    let (addr, _handle) = start_test_server(engine).await;

    let client = reqwest::Client::new();
    let response = client.get(format!("http://{addr}/nonexistent")).send().await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn discover_json_has_hdhomerun_shape() {
    let (engine, _dir) = build_engine();
    let (addr, _handle) = start_test_server(engine).await;

    let client = reqwest::Client::new();
    let body: serde_json::Value = client
        .get(format!("http://{addr}/discover.json"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert!(body["DeviceID"].is_string());
    assert!(body["BaseURL"].as_str().unwrap().starts_with("http://"));
    assert!(body["LineupURL"].as_str().unwrap().ends_with("/lineup.json"));
    assert!(body["GuideURL"].as_str().unwrap().ends_with("/hdhomerun/epg"));
}

#[tokio::test]
async fn lineup_json_strips_guide_number_prefix() {
    let (engine, _dir) = build_engine();
    let (addr, _handle) = start_test_server(engine).await;

    let client = reqwest::Client::new();
    let body: serde_json::Value = client
        .get(format!("http://{addr}/lineup.json"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let entries = body.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    let channel_seven = entries.iter().find(|e| e["GuideNumber"] == "7").unwrap();
    assert_eq!(channel_seven["GuideName"], "News");
    assert!(channel_seven["URL"].as_str().unwrap().contains("/iptv/channel/7.ts"));
}

#[tokio::test]
async fn epg_xml_lists_every_enabled_channel() {
    let (engine, _dir) = build_engine();
    let (addr, _handle) = start_test_server(engine).await;

    let client = reqwest::Client::new();
    let response = client.get(format!("http://{addr}/iptv/xmltv.xml")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap().to_str().unwrap(),
        "application/xml; charset=utf-8"
    );

    let xml = response.text().await.unwrap();
    assert!(xml.contains("<tv generator-info-name"));
    assert!(xml.contains("id=\"7\""));
    assert!(xml.contains("id=\"12\""));
}

#[tokio::test]
async fn stream_endpoint_404s_for_unknown_channel() {
    let (engine, _dir) = build_engine();
    let (addr, _handle) = start_test_server(engine).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/iptv/channel/999.ts"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn metrics_endpoint_exposes_prometheus_text() {
    let (engine, _dir) = build_engine();
    let (addr, _handle) = start_test_server(engine).await;

    let client = reqwest::Client::new();
    let response = client.get(format!("http://{addr}/metrics")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    let body = response.text().await.unwrap();
    assert!(body.contains("exstreamtv_ffmpeg_processes_active"));
    assert!(body.contains("exstreamtv_db_pool_size"));
}
