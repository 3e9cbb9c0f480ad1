//! Runtime configuration, read from the environment.
//!
//! | Variable                          | Default                          |
//! |-----------------------------------|----------------------------------|
//! | `STREAMGAUGE_PORT`                | `3000`                           |
//! | `STREAMGAUGE_DATABASE_URL`        | `sqlite:streamgauge.db?mode=rwc` |
//! | `STREAMGAUGE_SETTLE_DELAY_MS`     | `500`                            |
//! | `STREAMGAUGE_RESET_SWEEP_SECS`    | `3600`                           |
//! | `STREAMGAUGE_PROBE_BASE_URL`      | `http://127.0.0.1:<port>`        |
//! | `STREAMGAUGE_PROBE_TIMEOUT_SECS`  | `10`                             |
//!
//! Values that fail to parse, and intervals outside one second to 30 days,
//! fall back to the default.

use std::env;
use std::time::Duration;

use crate::controller::DEFAULT_SETTLE_DELAY;
use crate::usage::DEFAULT_SWEEP_INTERVAL;

/// Default port if not specified via environment variable.
pub const DEFAULT_PORT: u16 = 3000;

/// Default database path if not specified via environment variable.
pub const DEFAULT_DB_PATH: &str = "sqlite:streamgauge.db?mode=rwc";

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest accepted sweep interval or probe timeout.
const MAX_INTERVAL_SECS: u64 = 30 * 24 * 60 * 60;

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    /// How long a quality change takes to settle.
    pub settle_delay: Duration,
    /// Interval between data usage reset sweeps.
    pub reset_sweep_interval: Duration,
    /// Base URL serving `/probe/asset` and `/probe/ping`.
    pub probe_base_url: String,
    pub probe_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: DEFAULT_DB_PATH.to_string(),
            settle_delay: DEFAULT_SETTLE_DELAY,
            reset_sweep_interval: DEFAULT_SWEEP_INTERVAL,
            probe_base_url: local_base_url(DEFAULT_PORT),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl Config {
    /// Load configuration from `STREAMGAUGE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let interval_secs = |key: &str| {
            parsed(key)
                .filter(|secs| (1..=MAX_INTERVAL_SECS).contains(secs))
                .map(Duration::from_secs)
        };

        let port = lookup("STREAMGAUGE_PORT")
            .and_then(|p| p.trim().parse().ok())
            .unwrap_or(DEFAULT_PORT);

        Self {
            port,
            database_url: lookup("STREAMGAUGE_DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            settle_delay: parsed("STREAMGAUGE_SETTLE_DELAY_MS")
                .map_or(DEFAULT_SETTLE_DELAY, Duration::from_millis),
            reset_sweep_interval: interval_secs("STREAMGAUGE_RESET_SWEEP_SECS")
                .unwrap_or(DEFAULT_SWEEP_INTERVAL),
            probe_base_url: lookup("STREAMGAUGE_PROBE_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| local_base_url(port)),
            probe_timeout: interval_secs("STREAMGAUGE_PROBE_TIMEOUT_SECS")
                .unwrap_or(DEFAULT_PROBE_TIMEOUT),
        }
    }

    pub fn download_probe_url(&self) -> String {
        format!("{}/probe/asset", self.probe_base_url)
    }

    pub fn latency_probe_url(&self) -> String {
        format!("{}/probe/ping", self.probe_base_url)
    }
}

fn local_base_url(port: u16) -> String {
    format!("http://127.0.0.1:{port}")
}
