//! Speaker playback engine
//!
//! Drains an [`AudioQueue`] into an output line on a dedicated thread. The
//! blocking device write paces the loop to real time.

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::audio::device::{SharedBackend, SharedOutputLine};
use crate::audio::format::PcmFormat;
use crate::audio::lifecycle::{self, EngineState, Transition, Worker};
use crate::audio::queue::{AudioChunk, AudioQueue, SharedAudioQueue};
use crate::constants::{JOIN_TIMEOUT_MS, POLL_TIMEOUT_MS};
use crate::error::AudioError;

const ENGINE: &str = "playback";

/// Playback timing and buffering knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackSettings {
    /// Longest the playback thread waits on an empty queue before rechecking its flag
    pub poll_timeout: Duration,
    /// Device-side buffer; `None` uses the backend default
    pub device_buffer: Option<Duration>,
    /// How long `stop` waits for the playback thread
    pub join_timeout: Duration,
    /// Bound on queued chunks; `None` is unbounded
    pub queue_capacity: Option<usize>,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(POLL_TIMEOUT_MS),
            device_buffer: None,
            join_timeout: Duration::from_millis(JOIN_TIMEOUT_MS),
            queue_capacity: None,
        }
    }
}

/// Snapshot of playback counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub chunks_played: u64,
    pub bytes_played: u64,
    /// Chunks dropped by `stop` or rejected by `enqueue_audio`
    pub chunks_discarded: u64,
    /// Chunks waiting in the queue
    pub queued: usize,
    pub device_underruns: usize,
}

#[derive(Default)]
struct Counters {
    chunks: AtomicU64,
    bytes: AtomicU64,
    discarded: AtomicU64,
}

struct Control {
    state: EngineState,
    worker: Option<Worker>,
    /// Loop abandoned by a timed-out stop, still finishing its last write
    stale: Option<Worker>,
}

/// Playback engine owning one output line and one queue
pub struct PlaybackEngine {
    backend: SharedBackend,
    settings: PlaybackSettings,
    queue: SharedAudioQueue,
    format: OnceLock<PcmFormat>,

    running: AtomicBool,
    control: Mutex<Control>,
    line: Mutex<Option<SharedOutputLine>>,
    counters: Arc<Counters>,

    error_tx: Sender<AudioError>,
    error_rx: Receiver<AudioError>,
}

impl PlaybackEngine {
    pub fn new(backend: SharedBackend) -> Self {
        Self::with_settings(backend, PlaybackSettings::default())
    }

    pub fn with_settings(backend: SharedBackend, settings: PlaybackSettings) -> Self {
        let queue = match settings.queue_capacity {
            Some(capacity) => AudioQueue::with_capacity(capacity),
            None => AudioQueue::new(),
        };
        let (error_tx, error_rx) = bounded(16);

        Self {
            backend,
            settings,
            queue: Arc::new(queue),
            format: OnceLock::new(),
            running: AtomicBool::new(false),
            control: Mutex::new(Control {
                state: EngineState::Uninitialized,
                worker: None,
                stale: None,
            }),
            line: Mutex::new(None),
            counters: Arc::new(Counters::default()),
            error_tx,
            error_rx,
        }
    }

    /// Open the speaker for `format`
    pub fn initialize(&self, format: PcmFormat) -> Result<(), AudioError> {
        let mut control = self.control.lock();
        if lifecycle::check_initialize(ENGINE, control.state)? == Transition::AlreadyDone {
            tracing::warn!("Speaker already initialized");
            return Ok(());
        }

        let buffer_bytes = self.settings.device_buffer.map(|d| format.bytes_for(d));
        let line = self.backend.open_output(format, buffer_bytes)?;

        let _ = self.format.set(format);
        *self.line.lock() = Some(line);
        control.state = EngineState::Ready;

        tracing::info!("Speaker initialized: {}", format);
        Ok(())
    }

    /// Start the line and the playback thread
    pub fn start(&self) -> Result<(), AudioError> {
        let mut control = self.control.lock();
        if lifecycle::check_start(ENGINE, control.state)? == Transition::AlreadyDone {
            tracing::warn!("Playback already running");
            return Ok(());
        }

        let Some(line) = self.line.lock().clone() else {
            return Err(AudioError::InvalidState {
                engine: ENGINE,
                operation: "start",
                state: control.state.name(),
            });
        };

        // Never run two loops against one line
        lifecycle::reap_stale(&mut control.stale, self.settings.join_timeout)?;

        line.start()?;

        let playback_loop = PlaybackLoop {
            line: line.clone(),
            queue: self.queue.clone(),
            counters: self.counters.clone(),
            errors: self.error_tx.clone(),
            poll_timeout: self.settings.poll_timeout,
        };

        match Worker::spawn("audio-playback", move |running| playback_loop.run(&running)) {
            Ok(worker) => control.worker = Some(worker),
            Err(e) => {
                line.stop();
                return Err(e);
            }
        }

        self.running.store(true, Ordering::SeqCst);
        control.state = EngineState::Running;
        tracing::info!("Playback started");
        Ok(())
    }

    /// Stop playback, flush the device and discard everything still queued
    pub fn stop(&self) {
        let mut control = self.control.lock();
        self.stop_locked(&mut control);
    }

    fn stop_locked(&self, control: &mut Control) {
        if control.state != EngineState::Running {
            if control.state == EngineState::Stopped {
                tracing::warn!("Playback already stopped");
            }
            return;
        }

        self.running.store(false, Ordering::SeqCst);

        if let Some(worker) = control.worker.take() {
            worker.signal_stop();
            // Cut the playback thread's poll short
            self.queue.interrupt();
            control.stale = lifecycle::stop_worker(worker, self.settings.join_timeout);
        }

        if let Some(line) = self.line.lock().as_ref() {
            line.stop();
            line.flush();
        }

        let dropped = self.queue.clear();
        self.counters
            .discarded
            .fetch_add(dropped as u64, Ordering::Relaxed);

        control.state = EngineState::Stopped;
        tracing::info!("Playback stopped ({} queued chunks discarded)", dropped);
    }

    /// Stop if needed and release the speaker. The engine cannot be reused.
    pub fn close(&self) {
        let mut control = self.control.lock();
        if control.state == EngineState::Closed {
            return;
        }

        self.stop_locked(&mut control);

        if let Some(line) = self.line.lock().take() {
            line.close();
            tracing::info!("Speaker closed");
        }
        control.state = EngineState::Closed;
    }

    /// Queue a chunk for the speaker. Empty chunks are ignored.
    pub fn enqueue_audio(&self, chunk: impl Into<AudioChunk>) {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return;
        }

        if let Some(format) = self.format.get() {
            if !format.is_frame_aligned(chunk.len()) {
                tracing::warn!(
                    "Dropping {}-byte chunk: not a whole number of {}-byte frames",
                    chunk.len(),
                    format.bytes_per_frame()
                );
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        if let Err(e) = self.queue.put(chunk) {
            tracing::warn!("Failed to enqueue audio: {}", e);
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Whether audio is running and waiting to be played. Advisory only.
    pub fn is_playing(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.queue.is_empty()
    }

    /// Queue feeding the speaker
    pub fn queue(&self) -> &SharedAudioQueue {
        &self.queue
    }

    pub fn state(&self) -> EngineState {
        self.control.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn format(&self) -> Option<PcmFormat> {
        self.format.get().copied()
    }

    pub fn stats(&self) -> PlaybackStats {
        let device_underruns = self
            .line
            .lock()
            .as_ref()
            .map(|line| line.stats().underruns)
            .unwrap_or(0);

        PlaybackStats {
            chunks_played: self.counters.chunks.load(Ordering::Relaxed),
            bytes_played: self.counters.bytes.load(Ordering::Relaxed),
            chunks_discarded: self.counters.discarded.load(Ordering::Relaxed),
            queued: self.queue.len(),
            device_underruns,
        }
    }

    /// Next error reported by the playback thread
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.try_recv().ok()
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.close();
    }
}

/// State moved onto the playback thread
struct PlaybackLoop {
    line: SharedOutputLine,
    queue: SharedAudioQueue,
    counters: Arc<Counters>,
    errors: Sender<AudioError>,
    poll_timeout: Duration,
}

impl PlaybackLoop {
    fn run(self, running: &AtomicBool) {
        tracing::info!("Playback loop started");

        while running.load(Ordering::Acquire) {
            let Some(chunk) = self.queue.poll_timeout(self.poll_timeout) else {
                continue;
            };

            match self.line.write(&chunk) {
                Ok(written) => {
                    if written < chunk.len() {
                        tracing::debug!(
                            "Short write: {} of {} bytes reached the device",
                            written,
                            chunk.len()
                        );
                    }
                    self.counters.chunks.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .bytes
                        .fetch_add(written as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::error!("Speaker write failed: {}", e);
                    let _ = self.errors.try_send(e);
                    break;
                }
            }
        }

        tracing::info!("Playback loop finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::MockBackend;
    use bytes::Bytes;
    use std::thread;
    use std::time::Instant;

    fn engine() -> (Arc<MockBackend>, PlaybackEngine) {
        let backend = Arc::new(MockBackend::new());
        let engine = PlaybackEngine::new(backend.clone());
        (backend, engine)
    }

    #[test]
    fn test_initialize_uses_default_buffer() {
        let (backend, engine) = engine();
        engine.initialize(PcmFormat::speech()).unwrap();
        assert_eq!(backend.output_opens(), vec![(PcmFormat::speech(), None)]);
        assert_eq!(engine.state(), EngineState::Ready);
    }

    #[test]
    fn test_enqueued_silence_is_written_once() {
        let (backend, engine) = engine();
        engine.initialize(PcmFormat::speech()).unwrap();
        engine.start().unwrap();

        engine.enqueue_audio(vec![0u8; 3200]);

        let output = backend.output();
        assert!(output.wait_for_writes(1, Duration::from_millis(200)));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(output.writes(), vec![vec![0u8; 3200]]);
        assert_eq!(engine.stats().bytes_played, 3200);

        engine.close();
    }

    #[test]
    fn test_enqueue_ignores_empty_and_misaligned_chunks() {
        let (_, engine) = engine();
        engine.initialize(PcmFormat::speech()).unwrap();

        engine.enqueue_audio(Bytes::new());
        assert!(engine.queue().is_empty());
        assert_eq!(engine.stats().chunks_discarded, 0);

        engine.enqueue_audio(vec![1u8; 3]);
        assert!(engine.queue().is_empty());
        assert_eq!(engine.stats().chunks_discarded, 1);

        engine.enqueue_audio(vec![1u8; 4]);
        assert_eq!(engine.queue().len(), 1);
    }

    #[test]
    fn test_double_start_runs_one_loop() {
        let (backend, engine) = engine();
        engine.initialize(PcmFormat::speech()).unwrap();
        engine.start().unwrap();
        engine.start().unwrap();

        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(backend.output().starts(), 1);
        engine.close();
    }

    #[test]
    fn test_stop_flushes_and_clears_queue() {
        let (backend, engine) = engine();
        let output = backend.output();
        output.set_write_delay(Duration::from_millis(50));

        engine.initialize(PcmFormat::speech()).unwrap();
        engine.start().unwrap();
        for _ in 0..10 {
            engine.enqueue_audio(vec![0u8; 320]);
        }
        assert!(engine.is_playing());

        engine.stop();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(engine.queue().is_empty());
        assert!(!engine.is_playing());
        assert_eq!(output.stops(), 1);
        assert_eq!(output.flushes(), 1);
        assert_eq!(output.buffered(), 0);
        assert!(engine.stats().chunks_discarded > 0);

        // Already stopped
        engine.stop();
        assert_eq!(output.stops(), 1);
        engine.close();
    }

    #[test]
    fn test_stop_mid_poll_returns_within_join_window() {
        let (_, engine) = engine();
        engine.initialize(PcmFormat::speech()).unwrap();
        engine.start().unwrap();
        thread::sleep(Duration::from_millis(30));

        let started = Instant::now();
        engine.stop();
        assert!(started.elapsed() <= Duration::from_millis(1100));
        engine.close();
    }

    #[test]
    fn test_stop_abandons_stuck_write() {
        let (backend, engine) = {
            let backend = Arc::new(MockBackend::new());
            let settings = PlaybackSettings {
                join_timeout: Duration::from_millis(100),
                ..PlaybackSettings::default()
            };
            let engine = PlaybackEngine::with_settings(backend.clone(), settings);
            (backend, engine)
        };
        backend.output().set_write_delay(Duration::from_millis(500));

        engine.initialize(PcmFormat::speech()).unwrap();
        engine.start().unwrap();
        engine.enqueue_audio(vec![0u8; 32]);
        thread::sleep(Duration::from_millis(30));

        let started = Instant::now();
        engine.stop();
        assert!(started.elapsed() < Duration::from_millis(450));
        assert_eq!(engine.state(), EngineState::Stopped);
        engine.close();
    }

    #[test]
    fn test_write_failure_is_reported() {
        let (backend, engine) = engine();
        backend.output().fail_writes();
        engine.initialize(PcmFormat::speech()).unwrap();
        engine.start().unwrap();
        engine.enqueue_audio(vec![0u8; 32]);

        let deadline = Instant::now() + Duration::from_secs(2);
        let error = loop {
            if let Some(e) = engine.check_errors() {
                break e;
            }
            assert!(Instant::now() < deadline, "no error reported");
            thread::sleep(Duration::from_millis(5));
        };
        assert!(matches!(error, AudioError::WriteFailed(_)));
        engine.close();
    }

    #[test]
    fn test_close_without_initialize() {
        let (backend, engine) = engine();
        engine.stop();
        engine.close();
        assert_eq!(engine.state(), EngineState::Closed);
        assert_eq!(backend.output().closes(), 0);
    }

    #[test]
    fn test_restart_after_abandoned_write_keeps_one_loop() {
        let backend = Arc::new(MockBackend::new());
        let settings = PlaybackSettings {
            join_timeout: Duration::from_millis(150),
            ..PlaybackSettings::default()
        };
        let engine = PlaybackEngine::with_settings(backend.clone(), settings);
        let output = backend.output();
        output.set_write_delay(Duration::from_millis(250));

        engine.initialize(PcmFormat::speech()).unwrap();
        engine.start().unwrap();
        engine.enqueue_audio(vec![0u8; 320]);
        thread::sleep(Duration::from_millis(20));

        // Join gives up while the first write is still blocked
        engine.stop();
        engine.start().unwrap();

        for fill in 1..=6u8 {
            engine.enqueue_audio(vec![fill; 320]);
        }
        thread::sleep(Duration::from_millis(850));

        assert_eq!(output.peak_concurrent_writes(), 1);
        let writes = output.writes();
        assert_eq!(writes[0], vec![0u8; 320]);
        for (i, chunk) in writes[1..].iter().enumerate() {
            assert_eq!(chunk, &vec![i as u8 + 1; 320]);
        }

        engine.close();
    }

    #[test]
    fn test_stats_do_not_wait_for_stop() {
        let backend = Arc::new(MockBackend::new());
        let settings = PlaybackSettings {
            join_timeout: Duration::from_millis(300),
            ..PlaybackSettings::default()
        };
        let engine = Arc::new(PlaybackEngine::with_settings(backend.clone(), settings));
        backend.output().set_write_delay(Duration::from_millis(500));

        engine.initialize(PcmFormat::speech()).unwrap();
        engine.start().unwrap();
        engine.enqueue_audio(vec![0u8; 32]);
        thread::sleep(Duration::from_millis(20));

        let stopper = {
            let engine = engine.clone();
            thread::spawn(move || engine.stop())
        };
        thread::sleep(Duration::from_millis(50));

        // stop is still inside its bounded join
        let started = Instant::now();
        let _ = engine.stats();
        assert!(started.elapsed() < Duration::from_millis(100));

        stopper.join().unwrap();
        engine.close();
    }
}
