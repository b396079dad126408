mod state;

use anyhow::Context;
use state::DaemonState;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let state = DaemonState::initialize()
        .await
        .context("failed to initialize harbor daemon state")?;

    let refreshed = state.refresh_stale().await;
    tracing::info!(refreshed, "startup refresh finished");
    state.start_polling().await;

    let mut persist_tick = interval(Duration::from_secs(
        state.config.sync.poll_interval_secs.max(1),
    ));
    let mut cleanup_tick = interval(Duration::from_secs(
        state.config.sync.cleanup_interval_secs.max(1),
    ));
    persist_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    persist_tick.tick().await;
    cleanup_tick.tick().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    tracing::error!("failed to listen for shutdown signal: {err}");
                }
                break;
            }
            _ = persist_tick.tick() => {
                if let Err(err) = state.persist().await {
                    tracing::warn!("snapshot save failed: {err:#}");
                }
            }
            _ = cleanup_tick.tick() => {
                state.cleanup().await;
            }
        }
    }

    tracing::info!("shutting down");
    state.shutdown().await
}
