//! HTTP API handlers for Streamgauge.
//!
//! The web player talks to this service to report network hints and
//! buffer health, pick qualities, edit settings and read data usage.
//! Handlers are thin: every decision lives in the component they call.
//!
//! All handlers are generic over the storage backend so tests can run the
//! full router against an in-memory store.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post, put},
};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::controller::AdaptiveStreamingController;
use crate::model::{
    BandwidthSettings, BandwidthState, BufferHealthRequest, ConnectionSettings, EstimateQuery,
    LowBandwidthModeState, LowBandwidthRequest, NetworkHint, PlaybackResponse,
    QualityOverrideRequest, SetQualityRequest, SettingUpdate, SpeedTestResponse,
    TrackUsageRequest, UsageEstimate, UsageResponse,
};
use crate::monitor::BandwidthMonitor;
use crate::preferences::{BandwidthSettingsStore, LowBandwidthModeStore};
use crate::speed_test::ConnectionSpeedTest;
use crate::storage::KeyValueStore;
use crate::usage::{DataUsageTracker, estimate, estimate_hourly_usage};

/// Size of the download probe payload.
pub const PROBE_ASSET_BYTES: usize = 1024 * 1024;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState<S> {
    pub monitor: Arc<BandwidthMonitor>,
    pub low_bandwidth: Arc<LowBandwidthModeStore<S>>,
    pub settings: Arc<BandwidthSettingsStore<S>>,
    pub usage: Arc<DataUsageTracker<S>>,
    pub controller: AdaptiveStreamingController,
    pub speed_test: Arc<ConnectionSpeedTest>,
}

impl<S: KeyValueStore> AppState<S> {
    /// Load every store from `store` and wire the controller to them.
    ///
    /// The low-bandwidth toggle starts from the user's
    /// `lowBandwidthDefault` setting when it has never been set.
    pub async fn load(store: S, config: &Config) -> Self {
        let settings = BandwidthSettingsStore::load(store.clone()).await;
        let low_bandwidth = LowBandwidthModeStore::load_with_default(
            store.clone(),
            settings.current().low_bandwidth_default,
        )
        .await;
        let usage = DataUsageTracker::load(store).await;
        let monitor = BandwidthMonitor::new();

        let controller = AdaptiveStreamingController::new(
            monitor.subscribe(),
            low_bandwidth.subscribe(),
            config.settle_delay,
        );

        let speed_test = ConnectionSpeedTest::new(
            &config.download_probe_url(),
            &config.latency_probe_url(),
            config.probe_timeout,
        );

        Self {
            monitor: Arc::new(monitor),
            low_bandwidth: Arc::new(low_bandwidth),
            settings: Arc::new(settings),
            usage: Arc::new(usage),
            controller,
            speed_test: Arc::new(speed_test),
        }
    }
}

/// Build the full router.
pub fn router<S: KeyValueStore>(state: AppState<S>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/bandwidth", get(get_bandwidth::<S>))
        .route("/bandwidth/hint", post(post_network_hint::<S>))
        .route("/playback", get(get_playback::<S>))
        .route("/playback/quality", post(post_quality::<S>))
        .route("/playback/auto-mode", post(post_toggle_auto_mode::<S>))
        .route("/playback/buffer", post(post_buffer_health::<S>))
        .route("/playback/session", post(post_start_session::<S>))
        .route(
            "/low-bandwidth",
            get(get_low_bandwidth::<S>).put(put_low_bandwidth::<S>),
        )
        .route("/low-bandwidth/toggle", post(post_toggle_low_bandwidth::<S>))
        .route("/low-bandwidth/override", put(put_quality_override::<S>))
        .route(
            "/settings",
            get(get_settings::<S>).patch(patch_settings::<S>),
        )
        .route("/settings/connection", get(get_connection_settings::<S>))
        .route("/usage", get(get_usage::<S>))
        .route("/usage/track", post(post_track_usage::<S>))
        .route("/usage/reset", post(post_reset_usage::<S>))
        .route("/usage/estimate", get(get_usage_estimate))
        .route(
            "/speed-test",
            get(get_last_speed_test::<S>).post(post_speed_test::<S>),
        )
        .merge(probe_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Static assets timed by the connection speed test.
pub fn probe_routes<T>() -> Router<T>
where
    T: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/probe/asset", get(probe_asset))
        .route("/probe/ping", get(probe_ping))
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// GET /bandwidth - Current network classification and recommendation.
#[instrument(skip(state))]
pub async fn get_bandwidth<S: KeyValueStore>(
    State(state): State<AppState<S>>,
) -> Json<BandwidthState> {
    Json(state.monitor.current())
}

/// POST /bandwidth/hint - Report the runtime's network information.
///
/// # Request Body
///
/// ```json
/// {
///     "effectiveType": "4g",
///     "downlink": 7.5,
///     "rtt": 60,
///     "saveData": false
/// }
/// ```
///
/// Every field is optional. `null` means the runtime has no
/// network-information facility and resets to the fallback reading.
#[instrument(skip(state))]
pub async fn post_network_hint<S: KeyValueStore>(
    State(state): State<AppState<S>>,
    Json(hint): Json<Option<NetworkHint>>,
) -> Json<BandwidthState> {
    Json(state.monitor.update(hint.as_ref()))
}

/// GET /playback - Controller state plus the quality auto mode targets.
#[instrument(skip(state))]
pub async fn get_playback<S: KeyValueStore>(
    State(state): State<AppState<S>>,
) -> Json<PlaybackResponse> {
    Json(playback_response(&state.controller))
}

/// POST /playback/quality - Select a quality.
///
/// `{"quality": "480p"}` pins the quality; `{"quality": "480p", "auto": true}`
/// applies it without leaving auto mode.
#[instrument(skip(state))]
pub async fn post_quality<S: KeyValueStore>(
    State(state): State<AppState<S>>,
    Json(request): Json<SetQualityRequest>,
) -> Json<PlaybackResponse> {
    state.controller.set_quality(request.quality, request.auto);
    Json(playback_response(&state.controller))
}

/// POST /playback/auto-mode - Toggle auto mode.
#[instrument(skip(state))]
pub async fn post_toggle_auto_mode<S: KeyValueStore>(
    State(state): State<AppState<S>>,
) -> Json<PlaybackResponse> {
    state.controller.toggle_auto_mode();
    Json(playback_response(&state.controller))
}

/// POST /playback/buffer - Report buffer health in percent.
#[instrument(skip(state))]
pub async fn post_buffer_health<S: KeyValueStore>(
    State(state): State<AppState<S>>,
    Json(request): Json<BufferHealthRequest>,
) -> Json<PlaybackResponse> {
    state.controller.update_buffer_health(request.health);
    Json(playback_response(&state.controller))
}

/// POST /playback/session - Start a new playback session.
///
/// The previous session's controller state is discarded and the session
/// data counter restarts from zero. Cumulative usage counters are kept.
#[instrument(skip(state))]
pub async fn post_start_session<S: KeyValueStore>(
    State(state): State<AppState<S>>,
) -> Json<PlaybackResponse> {
    state.usage.start_session();
    state.controller.reset();
    state.controller.reconcile();
    Json(playback_response(&state.controller))
}

/// GET /low-bandwidth - Low-bandwidth toggle and override.
#[instrument(skip(state))]
pub async fn get_low_bandwidth<S: KeyValueStore>(
    State(state): State<AppState<S>>,
) -> Json<LowBandwidthModeState> {
    Json(state.low_bandwidth.current())
}

/// PUT /low-bandwidth - Turn low-bandwidth mode on or off.
#[instrument(skip(state))]
pub async fn put_low_bandwidth<S: KeyValueStore>(
    State(state): State<AppState<S>>,
    Json(request): Json<LowBandwidthRequest>,
) -> Json<LowBandwidthModeState> {
    state.low_bandwidth.set_enabled(request.enabled).await;
    Json(state.low_bandwidth.current())
}

/// POST /low-bandwidth/toggle - Flip low-bandwidth mode.
#[instrument(skip(state))]
pub async fn post_toggle_low_bandwidth<S: KeyValueStore>(
    State(state): State<AppState<S>>,
) -> Json<LowBandwidthModeState> {
    state.low_bandwidth.toggle_mode().await;
    Json(state.low_bandwidth.current())
}

/// PUT /low-bandwidth/override - Pin a quality, or clear with `null`.
#[instrument(skip(state))]
pub async fn put_quality_override<S: KeyValueStore>(
    State(state): State<AppState<S>>,
    Json(request): Json<QualityOverrideRequest>,
) -> Json<LowBandwidthModeState> {
    state
        .low_bandwidth
        .set_quality_override(request.quality)
        .await;
    Json(state.low_bandwidth.current())
}

/// GET /settings - Bandwidth settings.
#[instrument(skip(state))]
pub async fn get_settings<S: KeyValueStore>(
    State(state): State<AppState<S>>,
) -> Json<BandwidthSettings> {
    Json(state.settings.current())
}

/// GET /settings/connection - Starting quality and autoplay for the
/// connection the monitor currently reports.
#[instrument(skip(state))]
pub async fn get_connection_settings<S: KeyValueStore>(
    State(state): State<AppState<S>>,
) -> Json<ConnectionSettings> {
    let settings = state.settings.current();
    let connection_type = state.monitor.current().connection_type;

    Json(ConnectionSettings {
        connection_type,
        default_quality: settings.default_quality_for(connection_type),
        autoplay_allowed: settings.autoplay_allowed(connection_type),
    })
}

/// PATCH /settings - Update one setting.
///
/// # Request Body
///
/// ```json
/// { "key": "autoplayCellular", "value": true }
/// ```
#[instrument(skip(state))]
pub async fn patch_settings<S: KeyValueStore>(
    State(state): State<AppState<S>>,
    Json(update): Json<SettingUpdate>,
) -> Json<BandwidthSettings> {
    Json(state.settings.update_setting(update).await)
}

/// GET /usage - Cumulative counters, session log and current session total.
#[instrument(skip(state))]
pub async fn get_usage<S: KeyValueStore>(State(state): State<AppState<S>>) -> Json<UsageResponse> {
    Json(usage_response(&state.usage))
}

/// POST /usage/track - Record a stretch of playback.
///
/// # Request Body
///
/// ```json
/// { "quality": "720p", "durationSeconds": 30 }
/// ```
#[instrument(skip(state))]
pub async fn post_track_usage<S: KeyValueStore>(
    State(state): State<AppState<S>>,
    Json(request): Json<TrackUsageRequest>,
) -> Json<UsageResponse> {
    state
        .usage
        .track_usage(request.quality, request.duration_seconds)
        .await;
    Json(usage_response(&state.usage))
}

/// POST /usage/reset - Wipe all usage statistics.
#[instrument(skip(state))]
pub async fn post_reset_usage<S: KeyValueStore>(
    State(state): State<AppState<S>>,
) -> Json<UsageResponse> {
    state.usage.reset_stats().await;
    info!("Usage statistics reset by user");
    Json(usage_response(&state.usage))
}

/// GET /usage/estimate - Estimated data cost.
///
/// With `quality` and `minutes`, returns a single row; otherwise returns
/// the one-hour cost of every quality.
#[instrument]
pub async fn get_usage_estimate(
    Query(query): Query<EstimateQuery>,
) -> Result<Json<Vec<UsageEstimate>>, StatusCode> {
    match (query.quality, query.minutes) {
        (Some(quality), Some(minutes)) => {
            if !minutes.is_finite() || minutes < 0.0 {
                warn!(minutes, "Invalid estimate duration");
                return Err(StatusCode::BAD_REQUEST);
            }
            Ok(Json(vec![estimate(quality, minutes)]))
        }
        (None, None) => Ok(Json(estimate_hourly_usage())),
        _ => Err(StatusCode::BAD_REQUEST),
    }
}

/// POST /speed-test - Run the connection speed test.
///
/// The response carries the quality the measured speed can sustain as
/// `suggestedQuality`. Returns `409 Conflict` if a run is already in flight.
#[instrument(skip(state))]
pub async fn post_speed_test<S: KeyValueStore>(
    State(state): State<AppState<S>>,
) -> Result<Json<SpeedTestResponse>, StatusCode> {
    state
        .speed_test
        .run_test()
        .await
        .map(|result| Json(SpeedTestResponse::from(result)))
        .ok_or(StatusCode::CONFLICT)
}

/// GET /speed-test - Most recent speed test result, `204` if none yet.
#[instrument(skip(state))]
pub async fn get_last_speed_test<S: KeyValueStore>(
    State(state): State<AppState<S>>,
) -> Result<Json<SpeedTestResponse>, StatusCode> {
    state
        .speed_test
        .last_result()
        .map(|result| Json(SpeedTestResponse::from(result)))
        .ok_or(StatusCode::NO_CONTENT)
}

/// GET /probe/asset - Fixed-size uncacheable payload.
pub async fn probe_asset() -> impl IntoResponse {
    (
        [
            (header::CACHE_CONTROL, "no-store"),
            (header::CONTENT_TYPE, "application/octet-stream"),
        ],
        vec![0u8; PROBE_ASSET_BYTES],
    )
}

/// GET|HEAD /probe/ping - Tiny uncacheable response for latency checks.
pub async fn probe_ping() -> impl IntoResponse {
    ([(header::CACHE_CONTROL, "no-store")], "pong")
}

fn playback_response(controller: &AdaptiveStreamingController) -> PlaybackResponse {
    PlaybackResponse {
        state: controller.current(),
        target_quality: controller.effective_target(),
    }
}

fn usage_response<S: KeyValueStore>(usage: &DataUsageTracker<S>) -> UsageResponse {
    UsageResponse {
        stats: usage.stats(),
        session_usage: usage.session_usage(),
    }
}
