//! Echo test application
//!
//! Captures the default microphone and plays it straight back through the
//! default speaker until Ctrl+C.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nexus_audio::{
    audio::{CpalBackend, SharedBackend},
    config::AppConfig,
    EchoPump,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Nexus echo pump");

    // Config path from args, else the per-user config file
    let config = match std::env::args().nth(1) {
        Some(path) => AppConfig::load(Path::new(&path))
            .with_context(|| format!("failed to load config from {}", path))?,
        None => AppConfig::load_default().context("failed to load config")?,
    };
    let format = config.format()?;

    let backend: SharedBackend = Arc::new(CpalBackend::with_devices(
        config.capture.device.clone(),
        config.playback.device.clone(),
    ));
    let pump = Arc::new(EchoPump::from_config(backend, &config));

    // Start, health checks and shutdown join threads; keep them off the runtime workers
    {
        let pump = pump.clone();
        tokio::task::spawn_blocking(move || pump.start(format))
            .await
            .context("startup task failed")?
            .context("failed to start audio devices (is a microphone connected?)")?;
    }

    tracing::info!("Echo test running: speak into the microphone and you should hear yourself");
    tracing::info!("Press Ctrl+C to exit");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut health = tokio::time::interval(Duration::from_millis(250));
    let mut stats = tokio::time::interval(Duration::from_secs(5));

    let outcome = loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                if let Err(e) = signal {
                    tracing::warn!("Failed to listen for Ctrl+C: {}", e);
                }
                tracing::info!("Shutting down");
                break Ok(());
            }
            _ = health.tick() => {
                // check_health closes both engines on failure
                let pump = pump.clone();
                match tokio::task::spawn_blocking(move || pump.check_health()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break Err(anyhow::Error::from(e)),
                    Err(e) => break Err(anyhow::Error::from(e).context("health check task failed")),
                }
            }
            _ = stats.tick() => {
                let s = pump.stats();
                tracing::info!(
                    "Stats: {} chunks captured ({} empty reads, {} overflows), {} forwarded, {} played ({} queued, {} underruns)",
                    s.capture.chunks_captured,
                    s.capture.empty_reads,
                    s.capture.device_overflows,
                    s.chunks_forwarded,
                    s.playback.chunks_played,
                    s.playback.queued,
                    s.playback.device_underruns
                );
            }
        }
    };

    {
        let pump = pump.clone();
        tokio::task::spawn_blocking(move || pump.shutdown())
            .await
            .context("shutdown task failed")?;
    }
    outcome.context("audio pump failed")?;
    tracing::info!("Devices released");
    Ok(())
}
