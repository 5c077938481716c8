//! Microphone capture engine
//!
//! Reads fixed-size chunks from an input line on a dedicated thread and
//! pushes them into an [`AudioQueue`] for whatever consumes the microphone.

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::audio::device::{SharedBackend, SharedInputLine};
use crate::audio::format::PcmFormat;
use crate::audio::lifecycle::{self, EngineState, Transition, Worker};
use crate::audio::queue::{AudioQueue, SharedAudioQueue};
use crate::constants::{CAPTURE_BUFFER_MS, CHUNK_MS, JOIN_TIMEOUT_MS};
use crate::error::AudioError;

const ENGINE: &str = "capture";

/// Capture timing knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    /// Audio per read and per queued chunk
    pub chunk: Duration,
    /// Device-side buffer
    pub device_buffer: Duration,
    /// How long `stop` waits for the capture thread
    pub join_timeout: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            chunk: Duration::from_millis(CHUNK_MS),
            device_buffer: Duration::from_millis(CAPTURE_BUFFER_MS),
            join_timeout: Duration::from_millis(JOIN_TIMEOUT_MS),
        }
    }
}

/// Snapshot of capture counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub chunks_captured: u64,
    pub bytes_captured: u64,
    /// Reads that returned no data
    pub empty_reads: u64,
    /// Samples the device dropped because nobody read them in time
    pub device_overflows: usize,
}

#[derive(Default)]
struct Counters {
    chunks: AtomicU64,
    bytes: AtomicU64,
    empty_reads: AtomicU64,
}

struct Control {
    state: EngineState,
    worker: Option<Worker>,
    /// Loop abandoned by a timed-out stop, still finishing its last read
    stale: Option<Worker>,
}

/// Capture engine owning one input line and one queue
pub struct CaptureEngine {
    backend: SharedBackend,
    settings: CaptureSettings,
    queue: SharedAudioQueue,
    format: OnceLock<PcmFormat>,

    running: AtomicBool,
    /// Held across the bounded join in `stop`
    control: Mutex<Control>,
    /// Kept outside `control` so stats never wait on a stop
    line: Mutex<Option<SharedInputLine>>,
    counters: Arc<Counters>,

    error_tx: Sender<AudioError>,
    error_rx: Receiver<AudioError>,
}

impl CaptureEngine {
    pub fn new(backend: SharedBackend) -> Self {
        Self::with_settings(backend, CaptureSettings::default())
    }

    pub fn with_settings(backend: SharedBackend, settings: CaptureSettings) -> Self {
        let (error_tx, error_rx) = bounded(16);
        Self {
            backend,
            settings,
            queue: Arc::new(AudioQueue::new()),
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

    /// Open the microphone for `format` with a device buffer of one second
    pub fn initialize(&self, format: PcmFormat) -> Result<(), AudioError> {
        let mut control = self.control.lock();
        if lifecycle::check_initialize(ENGINE, control.state)? == Transition::AlreadyDone {
            tracing::warn!("Microphone already initialized");
            return Ok(());
        }

        let buffer_bytes = format
            .bytes_for(self.settings.device_buffer)
            .max(format.bytes_per_frame());
        let line = self.backend.open_input(format, buffer_bytes)?;

        let _ = self.format.set(format);
        *self.line.lock() = Some(line);
        control.state = EngineState::Ready;

        tracing::info!(
            "Microphone initialized: {}, buffer {} bytes",
            format,
            buffer_bytes
        );
        Ok(())
    }

    /// Start the line and the capture thread
    pub fn start(&self) -> Result<(), AudioError> {
        let mut control = self.control.lock();
        if lifecycle::check_start(ENGINE, control.state)? == Transition::AlreadyDone {
            tracing::warn!("Recording already running");
            return Ok(());
        }

        let line = self.line.lock().clone();
        let (Some(line), Some(&format)) = (line, self.format.get()) else {
            return Err(AudioError::InvalidState {
                engine: ENGINE,
                operation: "start",
                state: control.state.name(),
            });
        };

        // Never run two loops against one line
        lifecycle::reap_stale(&mut control.stale, self.settings.join_timeout)?;

        line.start()?;

        let capture_loop = CaptureLoop {
            line: line.clone(),
            queue: self.queue.clone(),
            counters: self.counters.clone(),
            errors: self.error_tx.clone(),
            chunk_bytes: format
                .bytes_for(self.settings.chunk)
                .max(format.bytes_per_frame()),
        };

        match Worker::spawn("audio-capture", move |running| capture_loop.run(&running)) {
            Ok(worker) => control.worker = Some(worker),
            Err(e) => {
                line.stop();
                return Err(e);
            }
        }

        self.running.store(true, Ordering::SeqCst);
        control.state = EngineState::Running;
        tracing::info!("Recording started");
        Ok(())
    }

    /// Stop the capture thread and the line. Queued chunks are kept.
    pub fn stop(&self) {
        let mut control = self.control.lock();
        self.stop_locked(&mut control);
    }

    fn stop_locked(&self, control: &mut Control) {
        if control.state != EngineState::Running {
            if control.state == EngineState::Stopped {
                tracing::warn!("Recording already stopped");
            }
            return;
        }

        self.running.store(false, Ordering::SeqCst);

        if let Some(worker) = control.worker.take() {
            control.stale = lifecycle::stop_worker(worker, self.settings.join_timeout);
        }

        if let Some(line) = self.line.lock().as_ref() {
            line.stop();
        }

        control.state = EngineState::Stopped;
        tracing::info!("Recording stopped");
    }

    /// Stop if needed and release the microphone. The engine cannot be reused.
    pub fn close(&self) {
        let mut control = self.control.lock();
        if control.state == EngineState::Closed {
            return;
        }

        self.stop_locked(&mut control);

        if let Some(line) = self.line.lock().take() {
            line.close();
            tracing::info!("Microphone closed");
        }
        control.state = EngineState::Closed;
    }

    /// Queue receiving captured chunks
    pub fn queue(&self) -> &SharedAudioQueue {
        &self.queue
    }

    pub fn state(&self) -> EngineState {
        self.control.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Format fixed at initialize, if any
    pub fn format(&self) -> Option<PcmFormat> {
        self.format.get().copied()
    }

    pub fn stats(&self) -> CaptureStats {
        let device_overflows = self
            .line
            .lock()
            .as_ref()
            .map(|line| line.stats().overflows)
            .unwrap_or(0);

        CaptureStats {
            chunks_captured: self.counters.chunks.load(Ordering::Relaxed),
            bytes_captured: self.counters.bytes.load(Ordering::Relaxed),
            empty_reads: self.counters.empty_reads.load(Ordering::Relaxed),
            device_overflows,
        }
    }

    /// Next error reported by the capture thread
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.try_recv().ok()
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.close();
    }
}

/// State moved onto the capture thread
struct CaptureLoop {
    line: SharedInputLine,
    queue: SharedAudioQueue,
    counters: Arc<Counters>,
    errors: Sender<AudioError>,
    chunk_bytes: usize,
}

impl CaptureLoop {
    fn run(self, running: &AtomicBool) {
        let mut buffer = vec![0u8; self.chunk_bytes];
        tracing::info!("Capture loop started (chunk size: {} bytes)", self.chunk_bytes);

        while running.load(Ordering::Acquire) {
            let n = match self.line.read(&mut buffer) {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!("Microphone read failed: {}", e);
                    let _ = self.errors.try_send(e);
                    break;
                }
            };

            if n == 0 {
                // Device had nothing yet; try again
                self.counters.empty_reads.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let chunk = Bytes::copy_from_slice(&buffer[..n]);
            if self.queue.put(chunk).is_err() {
                tracing::debug!("Capture queue wait cancelled");
                break;
            }
            self.counters.chunks.fetch_add(1, Ordering::Relaxed);
            self.counters.bytes.fetch_add(n as u64, Ordering::Relaxed);
        }

        tracing::info!("Capture loop finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::{MockBackend, ReadStep};
    use std::thread;
    use std::time::Instant;

    fn engine() -> (Arc<MockBackend>, CaptureEngine) {
        let backend = Arc::new(MockBackend::new());
        let engine = CaptureEngine::new(backend.clone());
        (backend, engine)
    }

    #[test]
    fn test_initialize_opens_one_second_buffer() {
        let (backend, engine) = engine();
        engine.initialize(PcmFormat::speech()).unwrap();

        assert_eq!(engine.state(), EngineState::Ready);
        assert_eq!(backend.input_opens(), vec![(PcmFormat::speech(), 32_000)]);

        // Second initialize is a no-op
        engine.initialize(PcmFormat::speech()).unwrap();
        assert_eq!(backend.input_opens().len(), 1);
    }

    #[test]
    fn test_initialize_surfaces_device_errors() {
        let (backend, engine) = engine();
        backend.fail_input(AudioError::DeviceUnavailable("unsupported".into()));
        assert!(matches!(
            engine.initialize(PcmFormat::speech()),
            Err(AudioError::DeviceUnavailable(_))
        ));
        assert_eq!(engine.state(), EngineState::Uninitialized);

        backend.fail_input(AudioError::DeviceOpenFailed("busy".into()));
        assert!(matches!(
            engine.initialize(PcmFormat::speech()),
            Err(AudioError::DeviceOpenFailed(_))
        ));
    }

    #[test]
    fn test_start_requires_initialize() {
        let (_, engine) = engine();
        assert!(matches!(
            engine.start(),
            Err(AudioError::InvalidState {
                state: "uninitialized",
                ..
            })
        ));
    }

    #[test]
    fn test_double_start_runs_one_loop() {
        let (backend, engine) = engine();
        engine.initialize(PcmFormat::speech()).unwrap();
        engine.start().unwrap();
        engine.start().unwrap();

        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(backend.input().starts(), 1);

        engine.stop();
        assert_eq!(backend.input().stops(), 1);
    }

    #[test]
    fn test_stop_and_close_without_start() {
        let (backend, engine) = engine();
        engine.initialize(PcmFormat::speech()).unwrap();
        engine.stop();
        engine.close();
        engine.close();

        assert_eq!(engine.state(), EngineState::Closed);
        assert_eq!(backend.input().stops(), 0);
        assert_eq!(backend.input().closes(), 1);
        assert!(engine.start().is_err());
    }

    #[test]
    fn test_captured_chunks_arrive_in_order() {
        let (backend, engine) = engine();
        let input = backend.input();
        input.push_read(ReadStep::Data(vec![1; 3200]));
        input.push_read(ReadStep::Data(vec![2; 3200]));

        engine.initialize(PcmFormat::speech()).unwrap();
        engine.start().unwrap();

        let queue = engine.queue();
        assert_eq!(queue.take().unwrap().as_ref(), &[1u8; 3200][..]);
        assert_eq!(queue.take().unwrap().as_ref(), &[2u8; 3200][..]);
        engine.close();

        let stats = engine.stats();
        assert_eq!(stats.chunks_captured, 2);
        assert_eq!(stats.bytes_captured, 6400);
    }

    #[test]
    fn test_empty_reads_are_retried() {
        let (backend, engine) = engine();
        let input = backend.input();
        input.push_empty_reads(10);
        input.push_read(ReadStep::Data(vec![7; 3200]));

        engine.initialize(PcmFormat::speech()).unwrap();
        engine.start().unwrap();

        let chunk = engine
            .queue()
            .poll_timeout(Duration::from_secs(2))
            .expect("chunk after empty reads");
        assert_eq!(chunk.len(), 3200);
        assert!(engine.is_running());
        assert!(engine.stats().empty_reads >= 10);
        assert!(input.reads() >= 11);

        engine.close();
    }

    #[test]
    fn test_partial_read_is_copied_exactly() {
        let (backend, engine) = engine();
        backend.input().push_read(ReadStep::Data(vec![5; 100]));

        engine.initialize(PcmFormat::speech()).unwrap();
        engine.start().unwrap();

        let chunk = engine.queue().poll_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(chunk.len(), 100);
        engine.close();
    }

    #[test]
    fn test_read_failure_is_reported() {
        let (backend, engine) = engine();
        backend
            .input()
            .push_read(ReadStep::Fail(AudioError::ReadFailed("unplugged".into())));

        engine.initialize(PcmFormat::speech()).unwrap();
        engine.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let error = loop {
            if let Some(e) = engine.check_errors() {
                break e;
            }
            assert!(Instant::now() < deadline, "no error reported");
            thread::sleep(Duration::from_millis(5));
        };
        assert!(matches!(error, AudioError::ReadFailed(_)));
        engine.close();
    }

    #[test]
    fn test_restart_after_stop() {
        let (backend, engine) = engine();
        engine.initialize(PcmFormat::speech()).unwrap();
        engine.start().unwrap();
        engine.stop();
        assert_eq!(engine.state(), EngineState::Stopped);

        backend.input().push_read(ReadStep::Data(vec![3; 32]));
        engine.start().unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert!(engine.queue().poll_timeout(Duration::from_secs(2)).is_some());
        assert_eq!(backend.input().starts(), 2);
        engine.close();
    }

    fn slow_engine(join_timeout: Duration, read_delay: Duration) -> (Arc<MockBackend>, CaptureEngine) {
        let backend = Arc::new(MockBackend::new());
        backend.input().set_read_delay(read_delay);
        let settings = CaptureSettings {
            join_timeout,
            ..CaptureSettings::default()
        };
        let engine = CaptureEngine::with_settings(backend.clone(), settings);
        (backend, engine)
    }

    #[test]
    fn test_restart_waits_for_abandoned_loop() {
        let (backend, engine) =
            slow_engine(Duration::from_millis(150), Duration::from_millis(250));
        let input = backend.input();

        engine.initialize(PcmFormat::speech()).unwrap();
        engine.start().unwrap();
        thread::sleep(Duration::from_millis(20));

        // Join gives up while the first read is still blocked
        engine.stop();
        assert_eq!(engine.state(), EngineState::Stopped);

        engine.start().unwrap();
        thread::sleep(Duration::from_millis(600));
        assert_eq!(input.peak_concurrent_reads(), 1);
        assert_eq!(engine.state(), EngineState::Running);

        engine.close();
    }

    #[test]
    fn test_start_fails_while_abandoned_loop_is_stuck() {
        let (backend, engine) =
            slow_engine(Duration::from_millis(50), Duration::from_millis(600));
        let input = backend.input();

        engine.initialize(PcmFormat::speech()).unwrap();
        engine.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        engine.stop();

        assert!(matches!(engine.start(), Err(AudioError::JoinTimeout(_))));
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(input.starts(), 1);

        // Once the blocked read returns the old loop exits and start succeeds
        thread::sleep(Duration::from_millis(700));
        engine.start().unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(input.peak_concurrent_reads(), 1);

        engine.close();
    }

    #[test]
    fn test_stop_leaves_queue_consumers_waiting() {
        let (_, engine) = engine();
        engine.initialize(PcmFormat::speech()).unwrap();
        engine.start().unwrap();

        let consumer = {
            let queue = engine.queue().clone();
            thread::spawn(move || queue.take())
        };
        thread::sleep(Duration::from_millis(30));

        engine.stop();
        assert!(!consumer.is_finished());

        engine.queue().put(Bytes::from_static(&[1, 2])).unwrap();
        assert_eq!(consumer.join().unwrap().unwrap().as_ref(), &[1u8, 2][..]);
        engine.close();
    }
}
