//! Streamgauge - adaptive playback quality and data usage tracking for
//! streaming clients.
//!
//! # Overview
//!
//! Streamgauge decides which resolution a video player should stream at
//! and keeps track of how much data playback costs. Network hints and
//! buffer health come in from the player; a quality decision and usage
//! statistics go out.
//!
//! ```text
//! BandwidthMonitor ──┐
//!                    ├──► AdaptiveStreamingController ──► player
//! LowBandwidthMode ──┘              ▲                       │
//!                                   └──── buffer health ────┘
//!
//! DataUsageTracker   (observes playback, never feeds back)
//! ConnectionSpeedTest (on demand, informs settings)
//! ```
//!
//! # Modules
//!
//! - [`model`]: Quality levels, connection types, persisted records
//! - [`storage`]: Key/value persistence (SQLite or in-memory)
//! - [`monitor`]: Network classification and quality recommendation
//! - [`preferences`]: Low-bandwidth toggle and bandwidth settings stores
//! - [`controller`]: The adaptive streaming state machine
//! - [`usage`]: Data usage estimation and tracking
//! - [`speed_test`]: On-demand connection speed test
//! - [`api`]: HTTP API handlers
//! - [`config`]: Environment configuration

pub mod api;
pub mod config;
pub mod controller;
pub mod model;
pub mod monitor;
pub mod preferences;
pub mod storage;
pub mod usage;
