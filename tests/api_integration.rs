//! Integration tests for Streamgauge API endpoints.
//!
//! These tests verify the full request/response cycle through the HTTP API.

use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::json;

use streamgauge::api::{AppState, router};
use streamgauge::config::Config;
use streamgauge::controller::AutoAdjustHandle;
use streamgauge::model::NetworkHint;
use streamgauge::storage::{MemoryStore, SqliteStore};

const SETTLE_DELAY: Duration = Duration::from_millis(20);

fn test_config() -> Config {
    Config {
        settle_delay: SETTLE_DELAY,
        // Nothing listens here, so speed tests report the fallback estimate.
        probe_base_url: "http://127.0.0.1:9".to_string(),
        probe_timeout: Duration::from_secs(2),
        ..Config::default()
    }
}

async fn create_test_server() -> TestServer {
    let state = AppState::load(MemoryStore::new(), &test_config()).await;
    TestServer::new(router(state)).unwrap()
}

/// Server with the auto-adjust loop running, as `main` wires it.
async fn create_adjusting_server(hint: NetworkHint) -> (TestServer, AutoAdjustHandle) {
    let state = AppState::load(MemoryStore::new(), &test_config()).await;
    state.monitor.update(Some(&hint));
    let handle = state.controller.spawn_auto_adjust();

    (TestServer::new(router(state)).unwrap(), handle)
}

fn fast_4g() -> NetworkHint {
    NetworkHint {
        effective_type: Some("4g".to_string()),
        downlink: Some(7.0),
        rtt: Some(60.0),
        save_data: Some(false),
    }
}

async fn settle() {
    tokio::time::sleep(SETTLE_DELAY * 3).await;
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = create_test_server().await;

    server.get("/health").await.assert_status_ok();
}

#[tokio::test]
async fn test_bandwidth_defaults_without_hint() {
    let server = create_test_server().await;

    let response = server.get("/bandwidth").await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();
    assert_eq!(body["connectionType"], "wifi");
    assert_eq!(body["downlinkMbps"], 10.0);
    assert_eq!(body["roundTripTimeMs"], 50.0);
    assert_eq!(body["dataSaverRequested"], false);
    assert_eq!(body["recommendedQuality"], "1080p");
}

#[tokio::test]
async fn test_network_hint_updates_recommendation() {
    let server = create_test_server().await;

    let response = server
        .post("/bandwidth/hint")
        .json(&json!({
            "effectiveType": "4g",
            "downlink": 3.2,
            "rtt": 120,
            "saveData": false
        }))
        .await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();
    assert_eq!(body["connectionType"], "4g");
    assert_eq!(body["recommendedQuality"], "480p");

    let body: serde_json::Value = server
        .post("/bandwidth/hint")
        .json(&json!({ "saveData": true }))
        .await
        .json();
    assert_eq!(body["recommendedQuality"], "240p");

    let body: serde_json::Value = server.post("/bandwidth/hint").json(&json!(null)).await.json();
    assert_eq!(body["recommendedQuality"], "1080p");
}

#[tokio::test]
async fn test_playback_initial_state() {
    let server = create_test_server().await;

    let body: serde_json::Value = server.get("/playback").await.json();
    assert_eq!(body["currentQuality"], "360p");
    assert_eq!(body["autoMode"], true);
    assert_eq!(body["bufferHealth"], 100.0);
    assert_eq!(body["isTransitioning"], false);
    assert_eq!(body["targetQuality"], "1080p");
}

#[tokio::test]
async fn test_manual_quality_selection() {
    let server = create_test_server().await;

    let body: serde_json::Value = server
        .post("/playback/quality")
        .json(&json!({ "quality": "720p" }))
        .await
        .json();
    assert_eq!(body["currentQuality"], "720p");
    assert_eq!(body["autoMode"], false);
    assert_eq!(body["isTransitioning"], true);

    settle().await;
    let body: serde_json::Value = server.get("/playback").await.json();
    assert_eq!(body["isTransitioning"], false);

    let body: serde_json::Value = server.post("/playback/auto-mode").await.json();
    assert_eq!(body["autoMode"], true);
    assert_eq!(body["currentQuality"], "720p");
}

#[tokio::test]
async fn test_invalid_quality_rejected() {
    let server = create_test_server().await;

    server
        .post("/playback/quality")
        .json(&json!({ "quality": "4k" }))
        .await
        .assert_status(StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_buffer_starvation_steps_down() {
    let server = create_test_server().await;

    server
        .post("/playback/quality")
        .json(&json!({ "quality": "720p", "auto": true }))
        .await
        .assert_status_ok();
    settle().await;

    let body: serde_json::Value = server
        .post("/playback/buffer")
        .json(&json!({ "health": 10 }))
        .await
        .json();
    assert_eq!(body["currentQuality"], "480p");
    assert_eq!(body["bufferHealth"], 10.0);

    settle().await;
    let body: serde_json::Value = server.get("/playback").await.json();
    assert_eq!(body["currentQuality"], "480p");
    assert_eq!(body["isTransitioning"], false);
}

#[tokio::test]
async fn test_starvation_holds_with_auto_adjust_running() {
    let (server, _auto_adjust) = create_adjusting_server(fast_4g()).await;
    settle().await;

    let body: serde_json::Value = server.get("/playback").await.json();
    assert_eq!(body["currentQuality"], "720p");
    assert_eq!(body["isTransitioning"], false);

    let body: serde_json::Value = server
        .post("/playback/buffer")
        .json(&json!({ "health": 10 }))
        .await
        .json();
    assert_eq!(body["currentQuality"], "480p");

    for _ in 0..3 {
        settle().await;
    }
    let body: serde_json::Value = server.get("/playback").await.json();
    assert_eq!(body["currentQuality"], "480p");
    assert_eq!(body["bufferHealth"], 10.0);
    assert_eq!(body["isTransitioning"], false);
    assert_eq!(body["targetQuality"], "720p");
}

#[tokio::test]
async fn test_new_session_resets_playback_and_session_usage() {
    let (server, _auto_adjust) = create_adjusting_server(fast_4g()).await;
    settle().await;

    server
        .post("/usage/track")
        .json(&json!({ "quality": "720p", "durationSeconds": 600 }))
        .await
        .assert_status_ok();
    server
        .post("/playback/quality")
        .json(&json!({ "quality": "1080p" }))
        .await
        .assert_status_ok();
    server
        .post("/playback/buffer")
        .json(&json!({ "health": 50 }))
        .await
        .assert_status_ok();

    let body: serde_json::Value = server.post("/playback/session").await.json();
    assert_eq!(body["currentQuality"], "360p");
    assert_eq!(body["autoMode"], true);
    assert_eq!(body["bufferHealth"], 100.0);

    settle().await;
    let body: serde_json::Value = server.get("/playback").await.json();
    assert_eq!(body["currentQuality"], "720p");
    assert_eq!(body["isTransitioning"], false);

    let body: serde_json::Value = server.get("/usage").await.json();
    assert_eq!(body["sessionUsage"], 0.0);
    assert_eq!(body["daily"], 225.0);
}

#[tokio::test]
async fn test_low_bandwidth_set_explicitly() {
    let server = create_test_server().await;

    let body: serde_json::Value = server
        .put("/low-bandwidth")
        .json(&json!({ "enabled": true }))
        .await
        .json();
    assert_eq!(body["enabled"], true);

    let body: serde_json::Value = server
        .put("/low-bandwidth")
        .json(&json!({ "enabled": true }))
        .await
        .json();
    assert_eq!(body["enabled"], true);

    let body: serde_json::Value = server.get("/playback").await.json();
    assert_eq!(body["targetQuality"], "240p");

    let body: serde_json::Value = server
        .put("/low-bandwidth")
        .json(&json!({ "enabled": false }))
        .await
        .json();
    assert_eq!(body["enabled"], false);
}

#[tokio::test]
async fn test_low_bandwidth_toggle_and_override() {
    let server = create_test_server().await;

    let body: serde_json::Value = server.post("/low-bandwidth/toggle").await.json();
    assert_eq!(body["enabled"], true);

    let body: serde_json::Value = server.get("/playback").await.json();
    assert_eq!(body["targetQuality"], "240p");

    let body: serde_json::Value = server
        .put("/low-bandwidth/override")
        .json(&json!({ "quality": "480p" }))
        .await
        .json();
    assert_eq!(body["qualityOverride"], "480p");

    let body: serde_json::Value = server.get("/playback").await.json();
    assert_eq!(body["targetQuality"], "480p");

    let body: serde_json::Value = server
        .put("/low-bandwidth/override")
        .json(&json!({ "quality": null }))
        .await
        .json();
    assert!(body["qualityOverride"].is_null());
}

#[tokio::test]
async fn test_settings_update() {
    let server = create_test_server().await;

    let body: serde_json::Value = server.get("/settings").await.json();
    assert_eq!(body["defaultQualityWifi"], "1080p");
    assert_eq!(body["autoplayCellular"], false);

    let body: serde_json::Value = server
        .patch("/settings")
        .json(&json!({ "key": "autoplayCellular", "value": true }))
        .await
        .json();
    assert_eq!(body["autoplayCellular"], true);
    assert_eq!(body["defaultQualityWifi"], "1080p");

    server
        .patch("/settings")
        .json(&json!({ "key": "unknownSetting", "value": true }))
        .await
        .assert_status(StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_connection_settings_follow_monitor() {
    let server = create_test_server().await;

    let body: serde_json::Value = server.get("/settings/connection").await.json();
    assert_eq!(body["connectionType"], "wifi");
    assert_eq!(body["defaultQuality"], "1080p");
    assert_eq!(body["autoplayAllowed"], true);

    server
        .post("/bandwidth/hint")
        .json(&json!({ "effectiveType": "4g", "downlink": 7.0 }))
        .await
        .assert_status_ok();
    let body: serde_json::Value = server.get("/settings/connection").await.json();
    assert_eq!(body["connectionType"], "4g");
    assert_eq!(body["defaultQuality"], "480p");
    assert_eq!(body["autoplayAllowed"], false);

    server
        .patch("/settings")
        .json(&json!({ "key": "autoplayCellular", "value": true }))
        .await
        .assert_status_ok();
    let body: serde_json::Value = server.get("/settings/connection").await.json();
    assert_eq!(body["autoplayAllowed"], true);

    server
        .patch("/settings")
        .json(&json!({ "key": "dataSaverMode", "value": true }))
        .await
        .assert_status_ok();
    let body: serde_json::Value = server.get("/settings/connection").await.json();
    assert_eq!(body["defaultQuality"], "360p");
    assert_eq!(body["autoplayAllowed"], false);
}

#[tokio::test]
async fn test_usage_tracking_and_reset() {
    let server = create_test_server().await;

    let body: serde_json::Value = server
        .post("/usage/track")
        .json(&json!({ "quality": "720p", "durationSeconds": 600 }))
        .await
        .json();
    assert_eq!(body["daily"], 225.0);
    assert_eq!(body["weekly"], 225.0);
    assert_eq!(body["monthly"], 225.0);
    assert_eq!(body["sessionUsage"], 225.0);
    assert_eq!(body["sessions"].as_array().unwrap().len(), 1);

    let body: serde_json::Value = server.post("/usage/reset").await.json();
    assert_eq!(body["daily"], 0.0);
    assert_eq!(body["monthly"], 0.0);
    assert_eq!(body["sessionUsage"], 0.0);
    assert!(body["sessions"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_usage_estimate() {
    let server = create_test_server().await;

    let body: serde_json::Value = server
        .get("/usage/estimate?quality=720p&minutes=10")
        .await
        .json();
    assert_eq!(body[0]["amountMb"], 225.0);
    assert_eq!(body[0]["formatted"], "225.0 MB");
    assert_eq!(body[0]["label"], "720p HD");

    let body: serde_json::Value = server.get("/usage/estimate").await.json();
    assert_eq!(body.as_array().unwrap().len(), 5);
    assert_eq!(body[4]["quality"], "1080p");

    server
        .get("/usage/estimate?quality=720p")
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_speed_test_always_returns_result() {
    let server = create_test_server().await;

    server
        .get("/speed-test")
        .await
        .assert_status(StatusCode::NO_CONTENT);

    let response = server.post("/speed-test").await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();
    assert_eq!(body["downloadSpeedMbps"], 5.0);
    assert_eq!(body["uploadSpeedMbps"], 2.0);
    assert_eq!(body["latencyMs"], 100.0);
    assert_eq!(body["suggestedQuality"], "720p");
    assert!(body["timestamp"].is_string());

    let body: serde_json::Value = server.get("/speed-test").await.json();
    assert_eq!(body["suggestedQuality"], "720p");
}

#[tokio::test]
async fn test_preferences_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!(
        "sqlite:{}?mode=rwc",
        dir.path().join("streamgauge.db").to_string_lossy()
    );

    {
        let store = SqliteStore::connect(&url).await.unwrap();
        let server = TestServer::new(router(AppState::load(store, &test_config()).await)).unwrap();

        server.post("/low-bandwidth/toggle").await.assert_status_ok();
        server
            .patch("/settings")
            .json(&json!({ "key": "defaultQualityCellular", "value": "360p" }))
            .await
            .assert_status_ok();
        server
            .post("/usage/track")
            .json(&json!({ "quality": "480p", "durationSeconds": 120 }))
            .await
            .assert_status_ok();
    }

    let store = SqliteStore::connect(&url).await.unwrap();
    let server = TestServer::new(router(AppState::load(store, &test_config()).await)).unwrap();

    let body: serde_json::Value = server.get("/low-bandwidth").await.json();
    assert_eq!(body["enabled"], true);

    let body: serde_json::Value = server.get("/settings").await.json();
    assert_eq!(body["defaultQualityCellular"], "360p");

    let body: serde_json::Value = server.get("/usage").await.json();
    assert_eq!(body["daily"], 22.5);
    assert_eq!(body["sessionUsage"], 0.0);
}
