//! Streamgauge - adaptive playback quality and data usage tracking for
//! streaming clients.
//!
//! Runs the local service the web player reports to.
//!
//! # API Endpoints
//!
//! - `GET /bandwidth`, `POST /bandwidth/hint` - Network conditions
//! - `GET /playback`, `POST /playback/{quality,auto-mode,buffer,session}` - Quality control
//! - `GET|PUT /low-bandwidth`, `POST /low-bandwidth/toggle`, `PUT /low-bandwidth/override`
//! - `GET|PATCH /settings`, `GET /settings/connection` - Bandwidth settings
//! - `GET /usage`, `POST /usage/{track,reset}`, `GET /usage/estimate` - Data usage
//! - `GET|POST /speed-test` - Connection speed test
//! - `GET /health` - Health check

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use streamgauge::api::{AppState, router};
use streamgauge::config::Config;
use streamgauge::storage::Storage;
use streamgauge::usage::DataUsageTracker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("streamgauge=info".parse()?))
        .init();

    let config = Config::from_env();
    info!(
        port = config.port,
        db_url = %config.database_url,
        settle_delay_ms = config.settle_delay.as_millis(),
        "Starting Streamgauge"
    );

    let storage = Storage::connect_or_memory(&config.database_url).await;
    if !storage.is_persistent() {
        warn!("Preferences and usage statistics will not survive a restart");
    }

    let state = AppState::load(storage, &config).await;

    // Both handles stop their tasks when dropped at the end of main.
    let _auto_adjust = state.controller.spawn_auto_adjust();
    let _reset_sweep =
        DataUsageTracker::spawn_reset_sweep(Arc::clone(&state.usage), config.reset_sweep_interval);

    let controller = state.controller.clone();
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Streamgauge is listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    controller.shutdown();
    info!("Streamgauge stopped");

    Ok(())
}
