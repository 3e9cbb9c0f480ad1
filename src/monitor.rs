//! Network condition sensing and quality recommendation.
//!
//! The monitor turns raw [`NetworkHint`]s into a [`BandwidthState`]. It has
//! no persisted state: each hint fully replaces the previous reading, and
//! a missing hint means "assume a reasonable wifi-like link".
//!
//! # Recommendation precedence
//!
//! First match wins:
//!
//! 1. data saver requested, or `slow-2g` / `2g` → 240p
//! 2. `3g`, or downlink below 2 Mbps → 360p
//! 3. downlink below 5 Mbps → 480p
//! 4. downlink below 10 Mbps → 720p
//! 5. otherwise → 1080p

use tokio::sync::watch;
use tracing::{debug, info};

use crate::model::{BandwidthState, ConnectionType, NetworkHint, QualityLevel};

/// Downlink assumed when the runtime gives no estimate.
pub const FALLBACK_DOWNLINK_MBPS: f64 = 10.0;

/// Round trip time assumed when the runtime gives no estimate.
pub const FALLBACK_RTT_MS: f64 = 50.0;

/// Downlink above which an unclassified link is treated as wifi.
const WIFI_DOWNLINK_THRESHOLD_MBPS: f64 = 5.0;

/// Classify a link and pick the quality it can sustain.
///
/// `None` models a runtime with no network-information facility.
pub fn evaluate(hint: Option<&NetworkHint>) -> BandwidthState {
    let Some(hint) = hint else {
        return BandwidthState {
            connection_type: ConnectionType::Wifi,
            downlink_mbps: FALLBACK_DOWNLINK_MBPS,
            round_trip_time_ms: FALLBACK_RTT_MS,
            data_saver_requested: false,
            recommended_quality: recommend_quality(
                ConnectionType::Wifi,
                FALLBACK_DOWNLINK_MBPS,
                false,
            ),
        };
    };

    let downlink_mbps = hint
        .downlink
        .filter(|d| d.is_finite())
        .map_or(FALLBACK_DOWNLINK_MBPS, |d| d.max(0.0));
    let round_trip_time_ms = hint
        .rtt
        .filter(|r| r.is_finite())
        .map_or(FALLBACK_RTT_MS, |r| r.max(0.0));
    let data_saver_requested = hint.save_data.unwrap_or(false);

    let connection_type = hint
        .effective_type
        .as_deref()
        .and_then(ConnectionType::from_effective_type)
        .unwrap_or(if downlink_mbps > WIFI_DOWNLINK_THRESHOLD_MBPS {
            ConnectionType::Wifi
        } else {
            ConnectionType::Unknown
        });

    BandwidthState {
        connection_type,
        downlink_mbps,
        round_trip_time_ms,
        data_saver_requested,
        recommended_quality: recommend_quality(
            connection_type,
            downlink_mbps,
            data_saver_requested,
        ),
    }
}

/// Quality recommendation from an already classified link.
pub fn recommend_quality(
    connection_type: ConnectionType,
    downlink_mbps: f64,
    data_saver_requested: bool,
) -> QualityLevel {
    if data_saver_requested
        || matches!(
            connection_type,
            ConnectionType::Slow2g | ConnectionType::TwoG
        )
    {
        QualityLevel::P240
    } else if connection_type == ConnectionType::ThreeG || downlink_mbps < 2.0 {
        QualityLevel::P360
    } else if downlink_mbps < 5.0 {
        QualityLevel::P480
    } else if downlink_mbps < 10.0 {
        QualityLevel::P720
    } else {
        QualityLevel::P1080
    }
}

/// Observable holder of the latest [`BandwidthState`].
///
/// Starts from the fallback reading; feed it with [`BandwidthMonitor::update`]
/// whenever the runtime signals a network change.
pub struct BandwidthMonitor {
    state: watch::Sender<BandwidthState>,
}

impl Default for BandwidthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl BandwidthMonitor {
    pub fn new() -> Self {
        let (state, _) = watch::channel(evaluate(None));
        Self { state }
    }

    /// Recompute from a fresh hint and notify subscribers if anything moved.
    pub fn update(&self, hint: Option<&NetworkHint>) -> BandwidthState {
        let next = evaluate(hint);

        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });

        if changed {
            info!(
                connection = ?next.connection_type,
                downlink_mbps = next.downlink_mbps,
                rtt_ms = next.round_trip_time_ms,
                save_data = next.data_saver_requested,
                recommended = %next.recommended_quality,
                "Network conditions changed"
            );
        } else {
            debug!("Network hint unchanged");
        }

        next
    }

    pub fn current(&self) -> BandwidthState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BandwidthState> {
        self.state.subscribe()
    }
}
