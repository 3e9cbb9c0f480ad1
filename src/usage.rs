//! Data usage estimation and tracking.
//!
//! Usage is estimated, not measured: a stretch of playback at a given
//! quality costs `bitrate * seconds / 8` megabytes using the nominal
//! bitrate table on [`QualityLevel`].
//!
//! # Reset windows
//!
//! Counters reset on three cascading windows, each with its own anchor:
//!
//! - 30 days since `last_reset`: everything
//! - 7 days since the weekly anchor: weekly and daily
//! - 1 day since the daily anchor: daily only
//!
//! The sweep runs on a timer (hourly by default) and once at startup.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::model::{
    DataUsageStats, MAX_SESSION_RECORDS, QualityLevel, SessionRecord, UsageEstimate,
};
use crate::storage::{DATA_USAGE_STATS_KEY, KeyValueStore, load_json, save_json};

/// Default interval between reset sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

const MONTHLY_RESET_DAYS: i64 = 30;
const WEEKLY_RESET_DAYS: i64 = 7;
const DAILY_RESET_DAYS: i64 = 1;

/// Estimated megabytes for `duration_minutes` of playback at `quality`,
/// rounded to one decimal.
pub fn estimate_usage_mb(quality: QualityLevel, duration_minutes: f64) -> f64 {
    let mb = quality.bitrate_mbps() * 60.0 * duration_minutes / 8.0;
    (mb * 10.0).round() / 10.0
}

/// One labelled estimate row, as shown by the usage estimator.
pub fn estimate(quality: QualityLevel, duration_minutes: f64) -> UsageEstimate {
    let amount_mb = estimate_usage_mb(quality, duration_minutes);

    UsageEstimate {
        quality,
        label: quality.label(),
        minutes: duration_minutes,
        amount_mb,
        formatted: DataUsageStats::format_mb(amount_mb),
    }
}

/// Estimated cost of one hour at every quality, lowest first.
pub fn estimate_hourly_usage() -> Vec<UsageEstimate> {
    QualityLevel::ALL
        .into_iter()
        .map(|quality| estimate(quality, 60.0))
        .collect()
}

/// Which counters a sweep cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetScope {
    Daily,
    Weekly,
    Monthly,
}

/// Persisted usage counters plus an in-memory per-session total.
pub struct DataUsageTracker<S> {
    store: S,
    stats: watch::Sender<DataUsageStats>,
    session_usage: Mutex<f64>,
    write_lock: tokio::sync::Mutex<()>,
}

impl<S: KeyValueStore> DataUsageTracker<S> {
    /// Load persisted counters, starting fresh when absent or malformed.
    pub async fn load(store: S) -> Self {
        let stats = load_json(&store, DATA_USAGE_STATS_KEY)
            .await
            .unwrap_or_else(|| DataUsageStats::empty(Utc::now()));

        let (stats, _) = watch::channel(stats);

        Self {
            store,
            stats,
            session_usage: Mutex::new(0.0),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn stats(&self) -> DataUsageStats {
        self.stats.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DataUsageStats> {
        self.stats.subscribe()
    }

    /// Megabytes tracked since the current session started.
    pub fn session_usage(&self) -> f64 {
        *self.session_usage.lock()
    }

    /// Begin a new playback session, zeroing the session counter.
    pub fn start_session(&self) {
        *self.session_usage.lock() = 0.0;
        debug!("Data usage session started");
    }

    /// Record `duration_seconds` of playback at `quality`. Returns the
    /// megabytes added.
    pub async fn track_usage(&self, quality: QualityLevel, duration_seconds: f64) -> f64 {
        self.track_usage_at(quality, duration_seconds, Utc::now())
            .await
    }

    /// [`track_usage`](Self::track_usage) with an explicit timestamp for
    /// the session record.
    pub async fn track_usage_at(
        &self,
        quality: QualityLevel,
        duration_seconds: f64,
        now: DateTime<Utc>,
    ) -> f64 {
        if !duration_seconds.is_finite() || duration_seconds <= 0.0 {
            debug!(duration_seconds, "Ignoring empty playback interval");
            return 0.0;
        }

        let amount_mb = estimate_usage_mb(quality, duration_seconds / 60.0);

        let _guard = self.write_lock.lock().await;
        self.stats.send_modify(|stats| {
            stats.daily += amount_mb;
            stats.weekly += amount_mb;
            stats.monthly += amount_mb;

            stats.sessions.push_back(SessionRecord {
                date: now,
                amount_mb,
                quality,
            });
            while stats.sessions.len() > MAX_SESSION_RECORDS {
                stats.sessions.pop_front();
            }
        });
        *self.session_usage.lock() += amount_mb;

        debug!(quality = %quality, duration_seconds, amount_mb, "Data usage tracked");
        self.persist().await;

        amount_mb
    }

    /// Clear whichever windows have elapsed as of `now`.
    pub async fn apply_scheduled_resets(&self, now: DateTime<Utc>) -> Option<ResetScope> {
        let _guard = self.write_lock.lock().await;

        let mut scope = None;
        self.stats.send_if_modified(|stats| {
            let days_since = |anchor: DateTime<Utc>| (now - anchor).num_days();

            if days_since(stats.last_reset) >= MONTHLY_RESET_DAYS {
                stats.monthly = 0.0;
                stats.weekly = 0.0;
                stats.daily = 0.0;
                stats.last_reset = now;
                stats.last_weekly_reset = Some(now);
                stats.last_daily_reset = Some(now);
                scope = Some(ResetScope::Monthly);
            } else if days_since(stats.weekly_anchor()) >= WEEKLY_RESET_DAYS {
                stats.weekly = 0.0;
                stats.daily = 0.0;
                stats.last_weekly_reset = Some(now);
                stats.last_daily_reset = Some(now);
                scope = Some(ResetScope::Weekly);
            } else if days_since(stats.daily_anchor()) >= DAILY_RESET_DAYS {
                stats.daily = 0.0;
                stats.last_daily_reset = Some(now);
                scope = Some(ResetScope::Daily);
            }

            scope.is_some()
        });

        if let Some(scope) = scope {
            info!(scope = ?scope, "Data usage counters reset");
            self.persist().await;
        }

        scope
    }

    /// Wipe every counter, the session log and the session total.
    pub async fn reset_stats(&self) {
        let _guard = self.write_lock.lock().await;

        self.stats.send_replace(DataUsageStats::empty(Utc::now()));
        *self.session_usage.lock() = 0.0;

        info!("Data usage statistics reset");
        self.persist().await;
    }

    /// Run [`apply_scheduled_resets`](Self::apply_scheduled_resets) now and
    /// then every `every`, until the handle is dropped.
    pub fn spawn_reset_sweep(tracker: Arc<Self>, every: Duration) -> ResetSweepHandle {
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                tracker.apply_scheduled_resets(Utc::now()).await;
            }
        });

        ResetSweepHandle { task }
    }

    async fn persist(&self) {
        let stats = self.stats();
        if let Err(e) = save_json(&self.store, DATA_USAGE_STATS_KEY, &stats).await {
            warn!(error = %e, "Failed to persist data usage statistics");
        }
    }
}

/// Running reset sweep. Dropping it stops the timer.
pub struct ResetSweepHandle {
    task: JoinHandle<()>,
}

impl Drop for ResetSweepHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ClosedStore, MemoryStore};

    async fn tracker() -> DataUsageTracker<MemoryStore> {
        DataUsageTracker::load(MemoryStore::new()).await
    }

    #[test]
    fn test_estimate_720p_ten_minutes() {
        assert_eq!(estimate_usage_mb(QualityLevel::P720, 10.0), 225.0);
    }

    #[test]
    fn test_estimate_rounds_to_one_decimal() {
        // 0.3 * 60 / 8 = 2.25
        assert_eq!(estimate_usage_mb(QualityLevel::P240, 1.0), 2.3);
        assert_eq!(estimate_usage_mb(QualityLevel::P1080, 0.0), 0.0);
    }

    #[test]
    fn test_estimate_monotonic() {
        for window in QualityLevel::ALL.windows(2) {
            assert!(estimate_usage_mb(window[0], 5.0) < estimate_usage_mb(window[1], 5.0));
        }

        for quality in QualityLevel::ALL {
            let mut previous = 0.0;
            for minutes in 1..=120 {
                let estimate = estimate_usage_mb(quality, f64::from(minutes));
                assert!(estimate > previous);
                previous = estimate;
            }
        }
    }

    #[test]
    fn test_hourly_table() {
        let table = estimate_hourly_usage();
        assert_eq!(table.len(), 5);
        assert_eq!(table[0].quality, QualityLevel::P240);
        assert_eq!(table[4].amount_mb, 2700.0);
        assert_eq!(table[4].formatted, "2.64 GB");
        assert_eq!(table[3].label, "720p HD");
    }

    #[tokio::test]
    async fn test_track_usage_updates_all_counters() {
        let tracker = tracker().await;

        let added = tracker.track_usage(QualityLevel::P720, 600.0).await;
        assert_eq!(added, 225.0);

        let stats = tracker.stats();
        assert_eq!(stats.daily, 225.0);
        assert_eq!(stats.weekly, 225.0);
        assert_eq!(stats.monthly, 225.0);
        assert_eq!(stats.sessions.len(), 1);
        assert_eq!(stats.sessions[0].quality, QualityLevel::P720);
        assert_eq!(tracker.session_usage(), 225.0);
    }

    #[tokio::test]
    async fn test_track_usage_ignores_empty_intervals() {
        let tracker = tracker().await;

        assert_eq!(tracker.track_usage(QualityLevel::P480, 0.0).await, 0.0);
        assert_eq!(tracker.track_usage(QualityLevel::P480, -3.0).await, 0.0);
        assert!(tracker.stats().sessions.is_empty());
    }

    #[tokio::test]
    async fn test_session_log_capped_fifo() {
        let tracker = tracker().await;
        let base = Utc::now();

        for i in 0..105 {
            let at = base + chrono::Duration::minutes(i);
            tracker.track_usage_at(QualityLevel::P360, 60.0, at).await;
        }

        let sessions = tracker.stats().sessions;
        assert_eq!(sessions.len(), MAX_SESSION_RECORDS);
        assert_eq!(sessions[0].date, base + chrono::Duration::minutes(5));
        assert_eq!(
            sessions[MAX_SESSION_RECORDS - 1].date,
            base + chrono::Duration::minutes(104)
        );
        assert!(sessions.iter().zip(sessions.iter().skip(1)).all(|(a, b)| a.date < b.date));
    }

    #[tokio::test]
    async fn test_reset_stats_clears_everything() {
        let tracker = tracker().await;
        tracker.track_usage(QualityLevel::P1080, 120.0).await;

        tracker.reset_stats().await;

        let stats = tracker.stats();
        assert_eq!(stats.daily, 0.0);
        assert_eq!(stats.weekly, 0.0);
        assert_eq!(stats.monthly, 0.0);
        assert!(stats.sessions.is_empty());
        assert_eq!(tracker.session_usage(), 0.0);
    }

    #[tokio::test]
    async fn test_stats_persist_across_reload() {
        let backend = MemoryStore::new();
        let tracker = DataUsageTracker::load(backend.clone()).await;
        tracker.track_usage(QualityLevel::P480, 120.0).await;

        let reloaded = DataUsageTracker::load(backend).await;
        assert_eq!(reloaded.stats(), tracker.stats());
        assert_eq!(reloaded.session_usage(), 0.0);
    }

    #[tokio::test]
    async fn test_start_session_only_clears_session_counter() {
        let tracker = tracker().await;
        tracker.track_usage(QualityLevel::P480, 60.0).await;

        tracker.start_session();
        assert_eq!(tracker.session_usage(), 0.0);
        assert!(tracker.stats().daily > 0.0);
    }

    #[tokio::test]
    async fn test_tracking_notifies_subscribers() {
        let tracker = tracker().await;
        let mut rx = tracker.subscribe();

        tracker.track_usage(QualityLevel::P360, 60.0).await;
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().sessions.len(), 1);

        tracker.track_usage(QualityLevel::P360, 0.0).await;
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_write_failure_keeps_counters() {
        let tracker = DataUsageTracker::load(ClosedStore).await;

        tracker.track_usage(QualityLevel::P720, 600.0).await;
        assert_eq!(tracker.stats().monthly, 225.0);
        assert_eq!(tracker.session_usage(), 225.0);

        tracker.reset_stats().await;
        assert_eq!(tracker.stats().monthly, 0.0);
    }

    async fn seeded(anchor_days_ago: i64) -> (DataUsageTracker<MemoryStore>, DateTime<Utc>) {
        let now = Utc::now();
        let anchor = now - chrono::Duration::days(anchor_days_ago);
        let backend = MemoryStore::new();

        let stats = DataUsageStats {
            daily: 10.0,
            weekly: 20.0,
            monthly: 30.0,
            ..DataUsageStats::empty(anchor)
        };
        save_json(&backend, DATA_USAGE_STATS_KEY, &stats).await.unwrap();

        (DataUsageTracker::load(backend).await, now)
    }

    #[tokio::test]
    async fn test_daily_reset() {
        let (tracker, now) = seeded(2).await;

        assert_eq!(tracker.apply_scheduled_resets(now).await, Some(ResetScope::Daily));
        let stats = tracker.stats();
        assert_eq!((stats.daily, stats.weekly, stats.monthly), (0.0, 20.0, 30.0));
    }

    #[tokio::test]
    async fn test_weekly_reset_cascades_to_daily() {
        let (tracker, now) = seeded(8).await;

        assert_eq!(tracker.apply_scheduled_resets(now).await, Some(ResetScope::Weekly));
        let stats = tracker.stats();
        assert_eq!((stats.daily, stats.weekly, stats.monthly), (0.0, 0.0, 30.0));
    }

    #[tokio::test]
    async fn test_monthly_reset_clears_all() {
        let (tracker, now) = seeded(31).await;

        assert_eq!(tracker.apply_scheduled_resets(now).await, Some(ResetScope::Monthly));
        let stats = tracker.stats();
        assert_eq!((stats.daily, stats.weekly, stats.monthly), (0.0, 0.0, 0.0));
        assert_eq!(stats.last_reset, now);
    }

    #[tokio::test]
    async fn test_weekly_reset_does_not_repeat_next_sweep() {
        let (tracker, now) = seeded(8).await;
        tracker.apply_scheduled_resets(now).await;

        tracker.track_usage_at(QualityLevel::P720, 600.0, now).await;
        let an_hour_later = now + chrono::Duration::hours(1);
        assert_eq!(tracker.apply_scheduled_resets(an_hour_later).await, None);
        assert_eq!(tracker.stats().weekly, 225.0);
    }

    #[tokio::test]
    async fn test_fresh_stats_need_no_reset() {
        let tracker = tracker().await;
        assert_eq!(tracker.apply_scheduled_resets(Utc::now()).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_sweep_runs_at_startup() {
        let (tracker, _) = seeded(31).await;
        let tracker = Arc::new(tracker);

        let handle = DataUsageTracker::spawn_reset_sweep(Arc::clone(&tracker), DEFAULT_SWEEP_INTERVAL);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(tracker.stats().monthly, 0.0);
        drop(handle);
    }
}
