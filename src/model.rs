//! Data models for Streamgauge.
//!
//! Every type that crosses a persistence or HTTP boundary lives here. JSON
//! field names are camelCase so the web player can consume them directly.
//!
//! # Ordering
//!
//! [`QualityLevel`] is totally ordered (`240p < 360p < 480p < 720p < 1080p`)
//! and doubles as an index into the bitrate table.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of session records retained in [`DataUsageStats`].
pub const MAX_SESSION_RECORDS: usize = 100;

/// Playback resolution tier.
///
/// Variants are declared lowest first so the derived `Ord` matches the
/// resolution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QualityLevel {
    #[serde(rename = "240p")]
    P240,
    #[serde(rename = "360p")]
    P360,
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
}

impl QualityLevel {
    /// All levels, lowest first.
    pub const ALL: [QualityLevel; 5] = [
        QualityLevel::P240,
        QualityLevel::P360,
        QualityLevel::P480,
        QualityLevel::P720,
        QualityLevel::P1080,
    ];

    /// Wire name, e.g. `"720p"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityLevel::P240 => "240p",
            QualityLevel::P360 => "360p",
            QualityLevel::P480 => "480p",
            QualityLevel::P720 => "720p",
            QualityLevel::P1080 => "1080p",
        }
    }

    /// Human-readable label for quality pickers.
    pub fn label(&self) -> &'static str {
        match self {
            QualityLevel::P240 => "240p (Data Saver)",
            QualityLevel::P360 => "360p (Low)",
            QualityLevel::P480 => "480p (Standard)",
            QualityLevel::P720 => "720p HD",
            QualityLevel::P1080 => "1080p Full HD",
        }
    }

    /// Nominal stream bitrate in megabits per second.
    pub fn bitrate_mbps(&self) -> f64 {
        match self {
            QualityLevel::P240 => 0.3,
            QualityLevel::P360 => 0.7,
            QualityLevel::P480 => 1.5,
            QualityLevel::P720 => 3.0,
            QualityLevel::P1080 => 6.0,
        }
    }

    /// One level lower, or `None` at the bottom.
    pub fn step_down(&self) -> Option<QualityLevel> {
        let index = self.index();
        index.checked_sub(1).and_then(|i| Self::ALL.get(i).copied())
    }

    fn index(&self) -> usize {
        match self {
            QualityLevel::P240 => 0,
            QualityLevel::P360 => 1,
            QualityLevel::P480 => 2,
            QualityLevel::P720 => 3,
            QualityLevel::P1080 => 4,
        }
    }
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string is not one of the five quality names.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown quality level: {0:?}")]
pub struct ParseQualityError(pub String);

impl FromStr for QualityLevel {
    type Err = ParseQualityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QualityLevel::ALL
            .into_iter()
            .find(|q| q.as_str() == s.trim())
            .ok_or_else(|| ParseQualityError(s.to_string()))
    }
}

/// Best-effort classification of the active network link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionType {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
    #[serde(rename = "wifi")]
    Wifi,
    #[serde(rename = "unknown")]
    Unknown,
}

impl ConnectionType {
    /// Map a platform `effectiveType` string to a classification.
    ///
    /// Returns `None` for anything outside the four cellular grades; the
    /// caller then falls back to a downlink-based guess.
    pub fn from_effective_type(effective_type: &str) -> Option<Self> {
        match effective_type {
            "slow-2g" => Some(ConnectionType::Slow2g),
            "2g" => Some(ConnectionType::TwoG),
            "3g" => Some(ConnectionType::ThreeG),
            "4g" => Some(ConnectionType::FourG),
            _ => None,
        }
    }

    /// True for the metered cellular grades.
    pub fn is_cellular(&self) -> bool {
        matches!(
            self,
            ConnectionType::Slow2g
                | ConnectionType::TwoG
                | ConnectionType::ThreeG
                | ConnectionType::FourG
        )
    }
}

/// Raw network hints as reported by the runtime's network-information
/// facility. Every field is optional because browsers expose different
/// subsets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkHint {
    #[serde(default)]
    pub effective_type: Option<String>,

    /// Estimated downlink in Mbps.
    #[serde(default)]
    pub downlink: Option<f64>,

    /// Estimated round trip time in milliseconds.
    #[serde(default)]
    pub rtt: Option<f64>,

    #[serde(default)]
    pub save_data: Option<bool>,
}

/// Snapshot of the current network conditions and the quality they call for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandwidthState {
    pub connection_type: ConnectionType,
    pub downlink_mbps: f64,
    pub round_trip_time_ms: f64,
    pub data_saver_requested: bool,
    pub recommended_quality: QualityLevel,
}

/// Persisted low-bandwidth toggle plus optional pinned quality.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LowBandwidthModeState {
    pub enabled: bool,
    pub quality_override: Option<QualityLevel>,
}

/// User preferences for default quality and autoplay behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandwidthSettings {
    pub default_quality_wifi: QualityLevel,
    pub default_quality_cellular: QualityLevel,
    pub autoplay_wifi: bool,
    pub autoplay_cellular: bool,
    pub low_bandwidth_default: bool,
    pub data_saver_mode: bool,
}

impl Default for BandwidthSettings {
    fn default() -> Self {
        Self {
            default_quality_wifi: QualityLevel::P1080,
            default_quality_cellular: QualityLevel::P480,
            autoplay_wifi: true,
            autoplay_cellular: false,
            low_bandwidth_default: false,
            data_saver_mode: false,
        }
    }
}

impl BandwidthSettings {
    /// Starting quality for a connection of the given type.
    ///
    /// Data saver mode caps the result at 360p.
    pub fn default_quality_for(&self, connection: ConnectionType) -> QualityLevel {
        let preferred = if connection.is_cellular() {
            self.default_quality_cellular
        } else {
            self.default_quality_wifi
        };

        if self.data_saver_mode {
            preferred.min(QualityLevel::P360)
        } else {
            preferred
        }
    }

    /// Whether playback may start on its own over the given connection.
    pub fn autoplay_allowed(&self, connection: ConnectionType) -> bool {
        if connection.is_cellular() {
            self.autoplay_cellular && !self.data_saver_mode
        } else {
            self.autoplay_wifi
        }
    }

    /// Apply a single-field update.
    pub fn apply(&mut self, update: SettingUpdate) {
        match update {
            SettingUpdate::DefaultQualityWifi(q) => self.default_quality_wifi = q,
            SettingUpdate::DefaultQualityCellular(q) => self.default_quality_cellular = q,
            SettingUpdate::AutoplayWifi(v) => self.autoplay_wifi = v,
            SettingUpdate::AutoplayCellular(v) => self.autoplay_cellular = v,
            SettingUpdate::LowBandwidthDefault(v) => self.low_bandwidth_default = v,
            SettingUpdate::DataSaverMode(v) => self.data_saver_mode = v,
        }
    }
}

/// One field of [`BandwidthSettings`] with its new value.
///
/// On the wire this is `{"key": "autoplayWifi", "value": true}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "key", content = "value", rename_all = "camelCase")]
pub enum SettingUpdate {
    DefaultQualityWifi(QualityLevel),
    DefaultQualityCellular(QualityLevel),
    AutoplayWifi(bool),
    AutoplayCellular(bool),
    LowBandwidthDefault(bool),
    DataSaverMode(bool),
}

/// Live state of the adaptive streaming controller.
///
/// Never persisted; a fresh controller starts at 360p so the first frame
/// arrives quickly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveStreamingState {
    pub current_quality: QualityLevel,
    pub auto_mode: bool,
    /// Buffer fill in percent, always within `[0, 100]`.
    pub buffer_health: f64,
    pub is_transitioning: bool,
}

impl Default for AdaptiveStreamingState {
    fn default() -> Self {
        Self {
            current_quality: QualityLevel::P360,
            auto_mode: true,
            buffer_health: 100.0,
            is_transitioning: false,
        }
    }
}

/// A single tracked stretch of playback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub date: DateTime<Utc>,
    pub amount_mb: f64,
    pub quality: QualityLevel,
}

/// Cumulative data usage counters, in megabytes.
///
/// `last_reset` is the monthly anchor. The weekly and daily windows carry
/// their own anchors; records written before those existed default them to
/// `last_reset`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataUsageStats {
    pub daily: f64,
    pub weekly: f64,
    pub monthly: f64,
    pub last_reset: DateTime<Utc>,
    #[serde(default)]
    pub last_weekly_reset: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_daily_reset: Option<DateTime<Utc>>,
    /// Most recent sessions, oldest first.
    #[serde(default)]
    pub sessions: VecDeque<SessionRecord>,
}

impl DataUsageStats {
    /// Zeroed counters anchored at `now`.
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            daily: 0.0,
            weekly: 0.0,
            monthly: 0.0,
            last_reset: now,
            last_weekly_reset: Some(now),
            last_daily_reset: Some(now),
            sessions: VecDeque::new(),
        }
    }

    pub fn weekly_anchor(&self) -> DateTime<Utc> {
        self.last_weekly_reset.unwrap_or(self.last_reset)
    }

    pub fn daily_anchor(&self) -> DateTime<Utc> {
        self.last_daily_reset.unwrap_or(self.last_reset)
    }

    /// Format a megabyte amount for display ("850.0 MB", "1.25 GB").
    pub fn format_mb(mb: f64) -> String {
        if mb < 1024.0 {
            format!("{mb:.1} MB")
        } else {
            format!("{:.2} GB", mb / 1024.0)
        }
    }
}

/// Outcome of one connection speed test run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeedTestResult {
    pub download_speed_mbps: f64,
    pub upload_speed_mbps: f64,
    pub latency_ms: f64,
    pub timestamp: DateTime<Utc>,
}

impl SpeedTestResult {
    /// Quality the measured download speed can sustain, using the same
    /// downlink thresholds as the bandwidth monitor.
    pub fn suggested_quality(&self) -> QualityLevel {
        let speed = self.download_speed_mbps;
        if speed < 2.0 {
            QualityLevel::P360
        } else if speed < 5.0 {
            QualityLevel::P480
        } else if speed < 10.0 {
            QualityLevel::P720
        } else {
            QualityLevel::P1080
        }
    }
}

/// Request body for `POST /playback/quality`.
#[derive(Debug, Clone, Deserialize)]
pub struct SetQualityRequest {
    pub quality: QualityLevel,
    #[serde(default)]
    pub auto: bool,
}

/// Request body for `POST /playback/buffer`.
#[derive(Debug, Clone, Deserialize)]
pub struct BufferHealthRequest {
    pub health: f64,
}

/// Request body for `PUT /low-bandwidth`.
#[derive(Debug, Clone, Deserialize)]
pub struct LowBandwidthRequest {
    pub enabled: bool,
}

/// Request body for `PUT /low-bandwidth/override`.
#[derive(Debug, Clone, Deserialize)]
pub struct QualityOverrideRequest {
    pub quality: Option<QualityLevel>,
}

/// Request body for `POST /usage/track`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackUsageRequest {
    pub quality: QualityLevel,
    pub duration_seconds: f64,
}

/// Query parameters for `GET /usage/estimate`.
#[derive(Debug, Deserialize)]
pub struct EstimateQuery {
    pub quality: Option<QualityLevel>,
    pub minutes: Option<f64>,
}

/// Response for `GET /playback`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackResponse {
    #[serde(flatten)]
    pub state: AdaptiveStreamingState,
    pub target_quality: QualityLevel,
}

/// Response for `GET /usage`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageResponse {
    #[serde(flatten)]
    pub stats: DataUsageStats,
    pub session_usage: f64,
}

/// One row of the usage estimate table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEstimate {
    pub quality: QualityLevel,
    pub label: &'static str,
    pub minutes: f64,
    pub amount_mb: f64,
    /// `amount_mb` formatted for display, e.g. "225.0 MB".
    pub formatted: String,
}

/// Response for `GET /settings/connection`: the settings resolved for the
/// connection the monitor currently reports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSettings {
    pub connection_type: ConnectionType,
    pub default_quality: QualityLevel,
    pub autoplay_allowed: bool,
}

/// Response for the speed test endpoints.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeedTestResponse {
    #[serde(flatten)]
    pub result: SpeedTestResult,
    pub suggested_quality: QualityLevel,
}

impl From<SpeedTestResult> for SpeedTestResponse {
    fn from(result: SpeedTestResult) -> Self {
        Self {
            suggested_quality: result.suggested_quality(),
            result,
        }
    }
}
