//! In-memory device lines for testing without hardware.
//!
//! [`MockInputLine`] replays a script of reads; [`MockOutputLine`] records
//! every write. Both count lifecycle calls so tests can check side effects.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::{AudioBackend, InputLine, OutputLine, SharedInputLine, SharedOutputLine};
use crate::audio::format::PcmFormat;
use crate::error::AudioError;

/// How long an idle mock read sleeps before returning zero bytes
const IDLE_READ: Duration = Duration::from_millis(5);

/// Counts overlapping calls into a line
#[derive(Default)]
struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    fn enter(&self) -> InFlightGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(self)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlightGuard<'a>(&'a InFlight);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One scripted result for [`MockInputLine::read`]
#[derive(Debug, Clone)]
pub enum ReadStep {
    /// Return zero bytes
    Empty,
    /// Return these bytes (truncated to the caller's buffer)
    Data(Vec<u8>),
    /// Fail the read
    Fail(AudioError),
}

/// Scripted capture line
#[derive(Default)]
pub struct MockInputLine {
    script: Mutex<VecDeque<ReadStep>>,
    read_delay: Mutex<Duration>,
    in_flight: InFlight,
    starts: AtomicUsize,
    stops: AtomicUsize,
    closes: AtomicUsize,
    reads: AtomicUsize,
    closed: AtomicBool,
}

impl MockInputLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a read result
    pub fn push_read(&self, step: ReadStep) {
        self.script.lock().push_back(step);
    }

    /// Queue `count` zero-byte reads
    pub fn push_empty_reads(&self, count: usize) {
        let mut script = self.script.lock();
        script.extend(std::iter::repeat(ReadStep::Empty).take(count));
    }

    /// Make every read block for `delay` before consulting the script
    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock() = delay;
    }

    /// Most reads ever in progress at the same time
    pub fn peak_concurrent_reads(&self) -> usize {
        self.in_flight.peak()
    }

    /// Scripted reads not consumed yet
    pub fn pending_reads(&self) -> usize {
        self.script.lock().len()
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl InputLine for MockInputLine {
    fn start(&self) -> Result<(), AudioError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, AudioError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AudioError::ReadFailed("input line is closed".to_string()));
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        let _call = self.in_flight.enter();

        let delay = *self.read_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let step = self.script.lock().pop_front();
        match step {
            Some(ReadStep::Empty) => Ok(0),
            Some(ReadStep::Data(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Some(ReadStep::Fail(e)) => Err(e),
            None => {
                thread::sleep(IDLE_READ);
                Ok(0)
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Recording playback line
#[derive(Default)]
pub struct MockOutputLine {
    writes: Mutex<Vec<Vec<u8>>>,
    /// Data the "device" still holds; dropped on flush
    buffered: AtomicUsize,
    write_delay: Mutex<Duration>,
    in_flight: InFlight,
    fail_writes: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
    flushes: AtomicUsize,
    closes: AtomicUsize,
    closed: AtomicBool,
}

impl MockOutputLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write block for `delay`, like a device pacing to real time
    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock() = delay;
    }

    /// Make subsequent writes fail
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Most writes ever in progress at the same time
    pub fn peak_concurrent_writes(&self) -> usize {
        self.in_flight.peak()
    }

    /// Every chunk written so far, in order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().clone()
    }

    pub fn bytes_written(&self) -> usize {
        self.writes.lock().iter().map(Vec::len).sum()
    }

    /// Poll until at least `count` writes happened or `timeout` elapses
    pub fn wait_for_writes(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.writes.lock().len() >= count {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Bytes written since the last flush
    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }
}

impl OutputLine for MockOutputLine {
    fn start(&self) -> Result<(), AudioError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn write(&self, data: &[u8]) -> Result<usize, AudioError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AudioError::WriteFailed("output line is closed".to_string()));
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AudioError::WriteFailed("simulated device failure".to_string()));
        }

        let _call = self.in_flight.enter();
        let delay = *self.write_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        self.writes.lock().push(data.to_vec());
        self.buffered.fetch_add(data.len(), Ordering::SeqCst);
        Ok(data.len())
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.buffered.store(0, Ordering::SeqCst);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Backend handing out one shared mock input and output line
#[derive(Default)]
pub struct MockBackend {
    input: Arc<MockInputLine>,
    output: Arc<MockOutputLine>,
    input_failure: Mutex<Option<AudioError>>,
    output_failure: Mutex<Option<AudioError>>,
    input_opens: Mutex<Vec<(PcmFormat, usize)>>,
    output_opens: Mutex<Vec<(PcmFormat, Option<usize>)>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(&self) -> Arc<MockInputLine> {
        self.input.clone()
    }

    pub fn output(&self) -> Arc<MockOutputLine> {
        self.output.clone()
    }

    /// Make the next `open_input` fail with `error`
    pub fn fail_input(&self, error: AudioError) {
        *self.input_failure.lock() = Some(error);
    }

    /// Make the next `open_output` fail with `error`
    pub fn fail_output(&self, error: AudioError) {
        *self.output_failure.lock() = Some(error);
    }

    /// Format and buffer size of every successful `open_input`
    pub fn input_opens(&self) -> Vec<(PcmFormat, usize)> {
        self.input_opens.lock().clone()
    }

    /// Format and buffer size of every successful `open_output`
    pub fn output_opens(&self) -> Vec<(PcmFormat, Option<usize>)> {
        self.output_opens.lock().clone()
    }
}

impl AudioBackend for MockBackend {
    fn open_input(
        &self,
        format: PcmFormat,
        buffer_bytes: usize,
    ) -> Result<SharedInputLine, AudioError> {
        if let Some(error) = self.input_failure.lock().take() {
            return Err(error);
        }
        self.input_opens.lock().push((format, buffer_bytes));
        Ok(self.input.clone())
    }

    fn open_output(
        &self,
        format: PcmFormat,
        buffer_bytes: Option<usize>,
    ) -> Result<SharedOutputLine, AudioError> {
        if let Some(error) = self.output_failure.lock().take() {
            return Err(error);
        }
        self.output_opens.lock().push((format, buffer_bytes));
        Ok(self.output.clone())
    }
}
