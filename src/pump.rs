//! Echo pump: microphone straight to speaker
//!
//! The forwarding thread is where later processing stages (VAD, STT) will
//! sit. Today it moves every captured chunk into the playback queue.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::capture::{CaptureEngine, CaptureStats};
use crate::audio::device::SharedBackend;
use crate::audio::format::PcmFormat;
use crate::audio::lifecycle::{self, Worker};
use crate::audio::playback::{PlaybackEngine, PlaybackStats};
use crate::config::AppConfig;
use crate::error::Result;

/// How often `stop` re-interrupts the capture queue while waiting for the forwarder
const INTERRUPT_INTERVAL: Duration = Duration::from_millis(10);

/// Combined pump statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub chunks_forwarded: u64,
    pub capture: CaptureStats,
    pub playback: PlaybackStats,
}

#[derive(Default)]
struct Forwarding {
    active: Option<Worker>,
    /// Forwarder abandoned by a timed-out stop
    stale: Option<Worker>,
}

/// Wires a capture engine to a playback engine
pub struct EchoPump {
    capture: Arc<CaptureEngine>,
    playback: Arc<PlaybackEngine>,
    running: AtomicBool,
    forwarder: Mutex<Forwarding>,
    forwarded: Arc<AtomicU64>,
    join_timeout: Duration,
}

impl EchoPump {
    pub fn new(capture: Arc<CaptureEngine>, playback: Arc<PlaybackEngine>) -> Self {
        let join_timeout = Duration::from_millis(crate::constants::JOIN_TIMEOUT_MS);
        Self {
            capture,
            playback,
            running: AtomicBool::new(false),
            forwarder: Mutex::new(Forwarding::default()),
            forwarded: Arc::new(AtomicU64::new(0)),
            join_timeout,
        }
    }

    /// Build both engines from configuration
    pub fn from_config(backend: SharedBackend, config: &AppConfig) -> Self {
        let capture = CaptureEngine::with_settings(backend.clone(), config.capture_settings());
        let playback = PlaybackEngine::with_settings(backend, config.playback_settings());
        let mut pump = Self::new(Arc::new(capture), Arc::new(playback));
        pump.join_timeout = config.lifecycle.join_timeout();
        pump
    }

    /// Initialize and start both engines, then begin forwarding.
    ///
    /// On failure both engines are closed before the error is returned.
    pub fn start(&self, format: PcmFormat) -> Result<()> {
        if let Err(e) = self.bring_up(format) {
            tracing::error!("Audio pump failed to start: {}", e);
            self.shutdown();
            return Err(e);
        }
        Ok(())
    }

    fn bring_up(&self, format: PcmFormat) -> Result<()> {
        tracing::info!("Initializing audio devices ({})", format);
        self.capture.initialize(format)?;
        self.playback.initialize(format)?;

        self.capture.start()?;
        self.playback.start()?;

        let mut forwarding = self.forwarder.lock();
        if forwarding.active.is_some() {
            tracing::warn!("Audio pump already forwarding");
            return Ok(());
        }
        lifecycle::reap_stale(&mut forwarding.stale, self.join_timeout)?;

        let capture = self.capture.clone();
        let playback = self.playback.clone();
        let forwarded = self.forwarded.clone();

        let worker = Worker::spawn("audio-forward", move |running| {
            forward(&capture, &playback, &running, &forwarded)
        })?;
        forwarding.active = Some(worker);
        self.running.store(true, Ordering::SeqCst);

        tracing::info!("Audio pump running");
        Ok(())
    }

    /// Stop forwarding. The engines keep running.
    pub fn stop(&self) {
        let mut forwarding = self.forwarder.lock();
        let Some(worker) = forwarding.active.take() else {
            return;
        };

        self.running.store(false, Ordering::SeqCst);
        worker.signal_stop();

        // The forwarder may enter `take` just after an interrupt, so keep interrupting
        let deadline = Instant::now() + self.join_timeout;
        loop {
            self.capture.queue().interrupt();
            if worker.wait(INTERRUPT_INTERVAL) {
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        if let Err(worker) = worker.try_join(Duration::ZERO) {
            tracing::warn!(
                "Forwarding thread did not exit within {:?}; leaving it to finish",
                self.join_timeout
            );
            forwarding.stale = Some(worker);
        }
        tracing::info!("Audio pump stopped");
    }

    /// Stop forwarding and close both engines. Safe to call repeatedly.
    pub fn shutdown(&self) {
        self.stop();
        self.capture.close();
        self.playback.close();
    }

    /// Check both engines for loop failures.
    ///
    /// On the first error both engines are closed and the error is returned.
    pub fn check_health(&self) -> Result<()> {
        let error = self
            .capture
            .check_errors()
            .map(|e| ("capture", e))
            .or_else(|| self.playback.check_errors().map(|e| ("playback", e)));

        match error {
            Some((engine, e)) => {
                tracing::error!("Audio {} engine failed: {}", engine, e);
                self.shutdown();
                Err(e.into())
            }
            None => Ok(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn capture(&self) -> &Arc<CaptureEngine> {
        &self.capture
    }

    pub fn playback(&self) -> &Arc<PlaybackEngine> {
        &self.playback
    }

    pub fn stats(&self) -> PumpStats {
        PumpStats {
            chunks_forwarded: self.forwarded.load(Ordering::Relaxed),
            capture: self.capture.stats(),
            playback: self.playback.stats(),
        }
    }
}

impl Drop for EchoPump {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn forward(
    capture: &CaptureEngine,
    playback: &PlaybackEngine,
    running: &AtomicBool,
    forwarded: &AtomicU64,
) {
    tracing::info!("Forwarding loop started");
    let queue = capture.queue();

    while running.load(Ordering::Acquire) {
        match queue.take() {
            Ok(chunk) => {
                playback.enqueue_audio(chunk);
                forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => break,
        }
    }

    tracing::info!("Forwarding loop finished");
}
