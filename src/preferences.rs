//! Persisted user preferences: the low-bandwidth toggle and bandwidth
//! settings.
//!
//! Both stores follow the same read-modify-persist cycle: mutate the
//! in-memory value, notify subscribers, then write the whole value back.
//! Writes are serialized per store so the persisted copy never lags behind
//! an older mutation. A failed write is logged and the in-memory value
//! stays authoritative for the rest of the process.

use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

use crate::model::{BandwidthSettings, LowBandwidthModeState, QualityLevel, SettingUpdate};
use crate::storage::{
    BANDWIDTH_SETTINGS_KEY, KeyValueStore, LOW_BANDWIDTH_MODE_KEY, QUALITY_OVERRIDE_KEY,
    load_json, load_raw, save_json,
};

/// Low-bandwidth toggle plus optional manual quality override.
pub struct LowBandwidthModeStore<S> {
    store: S,
    state: watch::Sender<LowBandwidthModeState>,
    write_lock: Mutex<()>,
}

impl<S: KeyValueStore> LowBandwidthModeStore<S> {
    /// Load persisted state, treating missing or malformed entries as off
    /// with no override.
    pub async fn load(store: S) -> Self {
        Self::load_with_default(store, false).await
    }

    /// Like [`load`](Self::load), but an absent toggle starts as
    /// `default_enabled` (the user's "low bandwidth by default" setting).
    pub async fn load_with_default(store: S, default_enabled: bool) -> Self {
        let enabled = match load_raw(&store, LOW_BANDWIDTH_MODE_KEY).await.as_deref() {
            Some("true") => true,
            Some("false") => false,
            Some(other) => {
                warn!(value = other, "Ignoring malformed low-bandwidth flag");
                default_enabled
            }
            None => default_enabled,
        };

        let quality_override = load_raw(&store, QUALITY_OVERRIDE_KEY)
            .await
            .and_then(|raw| match raw.parse::<QualityLevel>() {
                Ok(q) => Some(q),
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed quality override");
                    None
                }
            });

        let (state, _) = watch::channel(LowBandwidthModeState {
            enabled,
            quality_override,
        });

        Self {
            store,
            state,
            write_lock: Mutex::new(()),
        }
    }

    pub fn current(&self) -> LowBandwidthModeState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LowBandwidthModeState> {
        self.state.subscribe()
    }

    /// Flip the toggle and persist it. Returns the new value.
    pub async fn toggle_mode(&self) -> bool {
        let _guard = self.write_lock.lock().await;

        let mut enabled = false;
        self.state.send_modify(|s| {
            s.enabled = !s.enabled;
            enabled = s.enabled;
        });

        info!(enabled, "Low bandwidth mode toggled");
        self.persist_enabled(enabled).await;
        enabled
    }

    /// Set the toggle explicitly.
    pub async fn set_enabled(&self, enabled: bool) {
        let _guard = self.write_lock.lock().await;

        self.state.send_if_modified(|s| {
            let changed = s.enabled != enabled;
            s.enabled = enabled;
            changed
        });
        self.persist_enabled(enabled).await;
    }

    /// Pin a quality, or clear the pin with `None`.
    pub async fn set_quality_override(&self, quality: Option<QualityLevel>) {
        let _guard = self.write_lock.lock().await;

        self.state.send_if_modified(|s| {
            let changed = s.quality_override != quality;
            s.quality_override = quality;
            changed
        });

        let result = match quality {
            Some(q) => self.store.set(QUALITY_OVERRIDE_KEY, q.as_str()).await,
            None => self.store.remove(QUALITY_OVERRIDE_KEY).await,
        };

        match result {
            Ok(()) => info!(quality = ?quality, "Quality override updated"),
            Err(e) => warn!(error = %e, "Failed to persist quality override"),
        }
    }

    async fn persist_enabled(&self, enabled: bool) {
        let value = if enabled { "true" } else { "false" };
        if let Err(e) = self.store.set(LOW_BANDWIDTH_MODE_KEY, value).await {
            warn!(error = %e, "Failed to persist low-bandwidth flag");
        }
    }
}

/// User-editable bandwidth settings.
pub struct BandwidthSettingsStore<S> {
    store: S,
    state: watch::Sender<BandwidthSettings>,
    write_lock: Mutex<()>,
}

impl<S: KeyValueStore> BandwidthSettingsStore<S> {
    /// Load persisted settings, or the defaults when absent or malformed.
    pub async fn load(store: S) -> Self {
        let settings = load_json(&store, BANDWIDTH_SETTINGS_KEY)
            .await
            .unwrap_or_default();

        let (state, _) = watch::channel(settings);

        Self {
            store,
            state,
            write_lock: Mutex::new(()),
        }
    }

    pub fn current(&self) -> BandwidthSettings {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<BandwidthSettings> {
        self.state.subscribe()
    }

    /// Merge one field and persist the whole settings record.
    pub async fn update_setting(&self, update: SettingUpdate) -> BandwidthSettings {
        let _guard = self.write_lock.lock().await;

        let mut settings = self.current();
        settings.apply(update);
        self.state.send_replace(settings);

        match save_json(&self.store, BANDWIDTH_SETTINGS_KEY, &settings).await {
            Ok(()) => info!(update = ?update, "Bandwidth setting updated"),
            Err(e) => warn!(error = %e, "Failed to persist bandwidth settings"),
        }

        settings
    }
}
