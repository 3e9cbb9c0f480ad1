//! Adaptive streaming controller.
//!
//! Decides the playback quality from three inputs:
//!
//! - the bandwidth monitor's recommendation
//! - the low-bandwidth store (toggle and manual override)
//! - buffer health reported by the player
//!
//! # State machine
//!
//! The controller is either stable or transitioning, independently of
//! whether it is in auto mode. At most one quality change is in flight:
//! a trigger that arrives while `is_transitioning` is set is dropped, not
//! queued. A dropped auto-adjust trigger waits for the next change of the
//! bandwidth reading or the low-bandwidth store; the controller's own state
//! changes never re-trigger it, so a starvation step-down is not undone
//! while the sensor reading stands still.
//!
//! | Trigger                  | Guarded by transition | Effect                                         |
//! |--------------------------|-----------------------|------------------------------------------------|
//! | auto-adjust              | yes                   | commit target after settle delay               |
//! | `set_quality`            | no                    | commit immediately, clear flag after delay     |
//! | `update_buffer_health`   | yes                   | step down one level when health < 30           |
//! | `toggle_auto_mode`       | no                    | flip mode only                                 |

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::model::{AdaptiveStreamingState, BandwidthState, LowBandwidthModeState, QualityLevel};

/// Time a quality change takes to settle before another may start.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Buffer health (percent) below which the controller steps down.
pub const STARVATION_THRESHOLD: f64 = 30.0;

/// Owns the live [`AdaptiveStreamingState`] for one playback session.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AdaptiveStreamingController {
    inner: Arc<Inner>,
}

struct Inner {
    state: watch::Sender<AdaptiveStreamingState>,
    bandwidth: watch::Receiver<BandwidthState>,
    low_bandwidth: watch::Receiver<LowBandwidthModeState>,
    settle_delay: Duration,
    settle_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.settle_task.get_mut().take() {
            task.abort();
        }
    }
}

impl AdaptiveStreamingController {
    pub fn new(
        bandwidth: watch::Receiver<BandwidthState>,
        low_bandwidth: watch::Receiver<LowBandwidthModeState>,
        settle_delay: Duration,
    ) -> Self {
        let (state, _) = watch::channel(AdaptiveStreamingState::default());

        Self {
            inner: Arc::new(Inner {
                state,
                bandwidth,
                low_bandwidth,
                settle_delay,
                settle_task: Mutex::new(None),
            }),
        }
    }

    pub fn current(&self) -> AdaptiveStreamingState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AdaptiveStreamingState> {
        self.inner.state.subscribe()
    }

    /// Quality auto mode is steering towards: the manual override if set,
    /// else 240p in low-bandwidth mode, else the monitor's recommendation.
    pub fn effective_target(&self) -> QualityLevel {
        let low_bandwidth = *self.inner.low_bandwidth.borrow();

        if let Some(quality) = low_bandwidth.quality_override {
            quality
        } else if low_bandwidth.enabled {
            QualityLevel::P240
        } else {
            self.inner.bandwidth.borrow().recommended_quality
        }
    }

    /// Run one auto-adjust evaluation.
    ///
    /// Starts a transition towards [`effective_target`](Self::effective_target)
    /// when in auto mode, idle, and not already there. Returns whether a
    /// transition was started.
    pub fn reconcile(&self) -> bool {
        let target = self.effective_target();
        let mut from = None;

        self.inner.state.send_if_modified(|s| {
            if !s.auto_mode || s.is_transitioning || s.current_quality == target {
                return false;
            }
            from = Some(s.current_quality);
            s.is_transitioning = true;
            true
        });

        match from {
            Some(from) => {
                info!(from = %from, to = %target, "Adjusting playback quality");
                self.schedule_settle(Some(target));
                true
            }
            None => {
                debug!(target = %target, "No quality adjustment");
                false
            }
        }
    }

    /// Apply a quality immediately.
    ///
    /// `auto = false` pins the quality until auto mode is turned back on.
    /// Any pending settle timer is replaced, so an in-flight automatic
    /// commit cannot overwrite this choice.
    pub fn set_quality(&self, quality: QualityLevel, auto: bool) {
        self.inner.state.send_modify(|s| {
            s.is_transitioning = true;
            s.current_quality = quality;
            s.auto_mode = auto;
        });

        info!(quality = %quality, auto, "Playback quality set");
        self.schedule_settle(None);
    }

    /// Flip auto mode. Returns the new value.
    pub fn toggle_auto_mode(&self) -> bool {
        let mut auto_mode = false;
        self.inner.state.send_modify(|s| {
            s.auto_mode = !s.auto_mode;
            auto_mode = s.auto_mode;
        });

        info!(auto_mode, "Auto quality mode toggled");
        auto_mode
    }

    /// Record buffer health (clamped to `[0, 100]`).
    ///
    /// Below [`STARVATION_THRESHOLD`] in auto mode with no transition in
    /// flight, the quality drops exactly one level. NaN readings are ignored.
    pub fn update_buffer_health(&self, health: f64) -> AdaptiveStreamingState {
        if health.is_nan() {
            debug!("Ignoring NaN buffer health");
            return self.current();
        }

        let health = health.clamp(0.0, 100.0);
        let mut stepped = None;

        self.inner.state.send_if_modified(|s| {
            let mut changed = s.buffer_health != health;
            s.buffer_health = health;

            if health < STARVATION_THRESHOLD && s.auto_mode && !s.is_transitioning {
                if let Some(lower) = s.current_quality.step_down() {
                    stepped = Some((s.current_quality, lower));
                    s.current_quality = lower;
                    s.is_transitioning = true;
                    changed = true;
                }
            }

            changed
        });

        if let Some((from, to)) = stepped {
            warn!(
                buffer_health = health,
                from = %from,
                to = %to,
                "Buffer starving, stepping quality down"
            );
            self.schedule_settle(None);
        }

        self.current()
    }

    /// Start a fresh playback session.
    ///
    /// Cancels a pending settle timer and returns to the initial state
    /// (360p, auto mode, full buffer).
    pub fn reset(&self) {
        if let Some(task) = self.inner.settle_task.lock().take() {
            task.abort();
        }
        self.inner.state.send_replace(AdaptiveStreamingState::default());
        info!("Playback session reset");
    }

    /// Spawn the auto-adjust loop.
    ///
    /// The loop evaluates once on start and again whenever the bandwidth
    /// reading or the low-bandwidth store changes. It stops when the
    /// returned handle is dropped.
    pub fn spawn_auto_adjust(&self) -> AutoAdjustHandle {
        let controller = self.clone();
        let mut bandwidth = self.inner.bandwidth.clone();
        let mut low_bandwidth = self.inner.low_bandwidth.clone();

        let task = tokio::spawn(async move {
            controller.reconcile();

            loop {
                tokio::select! {
                    changed = bandwidth.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        bandwidth.borrow_and_update();
                    }
                    changed = low_bandwidth.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        low_bandwidth.borrow_and_update();
                    }
                }

                controller.reconcile();
            }

            debug!("Auto-adjust loop stopped");
        });

        AutoAdjustHandle { task }
    }

    /// Cancel a pending settle timer, leaving the state as it is.
    pub fn shutdown(&self) {
        if let Some(task) = self.inner.settle_task.lock().take() {
            task.abort();
        }
    }

    fn schedule_settle(&self, commit: Option<QualityLevel>) {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let delay = self.inner.settle_delay;

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(inner) = inner.upgrade() else {
                return;
            };

            inner.state.send_modify(|s| {
                if let Some(quality) = commit {
                    s.current_quality = quality;
                }
                s.is_transitioning = false;
            });
        });

        if let Some(previous) = self.inner.settle_task.lock().replace(task) {
            previous.abort();
        }
    }
}

/// Running auto-adjust loop. Dropping it stops the loop.
pub struct AutoAdjustHandle {
    task: JoinHandle<()>,
}

impl Drop for AutoAdjustHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
