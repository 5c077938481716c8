//! cpal-backed device lines
//!
//! A cpal `Stream` is not `Send` on every platform, so each line builds its
//! stream on a dedicated host thread and drives it through a command channel.
//! Samples cross the real-time callback through a lock-free [`SampleRing`].

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig, SupportedStreamConfigRange};
use crossbeam_channel::{bounded, unbounded, Sender};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{AudioBackend, InputLine, LineStats, OutputLine, SharedInputLine, SharedOutputLine};
use crate::audio::buffer::{decode_le, encode_le, SampleRing, SharedSampleRing};
use crate::audio::format::{PcmFormat, BYTES_PER_SAMPLE};
use crate::constants::DEFAULT_OUTPUT_BUFFER_MS;
use crate::error::AudioError;

/// Sleep between ring checks while a read or write waits
const POLL_INTERVAL: Duration = Duration::from_millis(5);

const I16_SCALE: f32 = i16::MAX as f32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => f.write_str("input"),
            Direction::Output => f.write_str("output"),
        }
    }
}

/// Lines on the cpal default host
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    input_device: Option<String>,
    output_device: Option<String>,
}

impl CpalBackend {
    /// Use the host's default input and output devices
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the named devices, falling back to the defaults where `None`
    pub fn with_devices(input_device: Option<String>, output_device: Option<String>) -> Self {
        Self {
            input_device,
            output_device,
        }
    }
}

impl AudioBackend for CpalBackend {
    fn open_input(
        &self,
        format: PcmFormat,
        buffer_bytes: usize,
    ) -> Result<SharedInputLine, AudioError> {
        let capacity = (buffer_bytes / BYTES_PER_SAMPLE).max(format.channels() as usize);
        let ring = Arc::new(SampleRing::new(capacity, format.channels() as usize));
        let lost = Arc::new(AtomicBool::new(false));

        let name = self.input_device.clone();
        let ring_cb = ring.clone();
        let lost_cb = lost.clone();

        let host = StreamHost::spawn("cpal-input", move || {
            let device = find_device(Direction::Input, name.as_deref())?;
            let ranges: Vec<SupportedStreamConfigRange> = device
                .supported_input_configs()
                .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?
                .collect();
            let (config, sample_format) = select_config(&ranges, format).ok_or_else(|| {
                AudioError::DeviceUnavailable(format!(
                    "{} does not support {}",
                    device_name(&device),
                    format
                ))
            })?;

            tracing::info!(
                "Opening input device {} ({:?} samples)",
                device_name(&device),
                sample_format
            );
            build_input_stream(&device, &config, sample_format, ring_cb, lost_cb)
        })?;

        Ok(Arc::new(CpalInputLine {
            format,
            ring,
            host,
            active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            lost,
        }))
    }

    fn open_output(
        &self,
        format: PcmFormat,
        buffer_bytes: Option<usize>,
    ) -> Result<SharedOutputLine, AudioError> {
        let buffer_bytes = buffer_bytes
            .unwrap_or_else(|| format.bytes_for(Duration::from_millis(DEFAULT_OUTPUT_BUFFER_MS)));
        let capacity = (buffer_bytes / BYTES_PER_SAMPLE).max(format.channels() as usize);
        let ring = Arc::new(SampleRing::new(capacity, format.channels() as usize));
        let lost = Arc::new(AtomicBool::new(false));

        let name = self.output_device.clone();
        let ring_cb = ring.clone();
        let lost_cb = lost.clone();

        let host = StreamHost::spawn("cpal-output", move || {
            let device = find_device(Direction::Output, name.as_deref())?;
            let ranges: Vec<SupportedStreamConfigRange> = device
                .supported_output_configs()
                .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?
                .collect();
            let (config, sample_format) = select_config(&ranges, format).ok_or_else(|| {
                AudioError::DeviceUnavailable(format!(
                    "{} does not support {}",
                    device_name(&device),
                    format
                ))
            })?;

            tracing::info!(
                "Opening output device {} ({:?} samples)",
                device_name(&device),
                sample_format
            );
            build_output_stream(&device, &config, sample_format, ring_cb, lost_cb)
        })?;

        Ok(Arc::new(CpalOutputLine {
            format,
            ring,
            host,
            active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            lost,
        }))
    }
}

/// Capture line fed by a cpal input callback
pub struct CpalInputLine {
    format: PcmFormat,
    ring: SharedSampleRing,
    host: StreamHost,
    active: AtomicBool,
    closed: AtomicBool,
    lost: Arc<AtomicBool>,
}

impl InputLine for CpalInputLine {
    fn start(&self) -> Result<(), AudioError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AudioError::StreamError("input line is closed".to_string()));
        }
        self.host.play()?;
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.host.pause();
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, AudioError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AudioError::ReadFailed("input line is closed".to_string()));
        }
        if self.lost.load(Ordering::SeqCst) {
            return Err(AudioError::ReadFailed("input device disconnected".to_string()));
        }

        // Whole frames only, so every chunk starts on the first channel
        let wanted = buf.len() / self.format.bytes_per_frame() * self.ring.frame_len();
        // Give the device twice the chunk's playing time before handing back a short read
        let deadline = Instant::now() + self.format.duration_of(buf.len()) * 2 + POLL_INTERVAL;
        let mut scratch = [0i16; 256];
        let mut filled = 0;

        loop {
            while filled < wanted {
                let take = (wanted - filled).min(scratch.len());
                let n = self.ring.pop_into(&mut scratch[..take]);
                if n == 0 {
                    break;
                }
                let start = filled * BYTES_PER_SAMPLE;
                encode_le(&scratch[..n], &mut buf[start..start + n * BYTES_PER_SAMPLE]);
                filled += n;
            }

            if filled == wanted
                || !self.active.load(Ordering::Relaxed)
                || self.closed.load(Ordering::Relaxed)
                || Instant::now() >= deadline
            {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }

        Ok(filled * BYTES_PER_SAMPLE)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.active.store(false, Ordering::SeqCst);
        self.host.shutdown();
    }

    fn stats(&self) -> LineStats {
        LineStats {
            overflows: self.ring.overflow_count(),
            underruns: 0,
        }
    }
}

/// Playback line drained by a cpal output callback
pub struct CpalOutputLine {
    format: PcmFormat,
    ring: SharedSampleRing,
    host: StreamHost,
    active: AtomicBool,
    closed: AtomicBool,
    lost: Arc<AtomicBool>,
}

impl OutputLine for CpalOutputLine {
    fn start(&self) -> Result<(), AudioError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AudioError::StreamError("output line is closed".to_string()));
        }
        self.host.play()?;
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.host.pause();
    }

    fn write(&self, data: &[u8]) -> Result<usize, AudioError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AudioError::WriteFailed("output line is closed".to_string()));
        }
        if self.lost.load(Ordering::SeqCst) {
            return Err(AudioError::WriteFailed("output device disconnected".to_string()));
        }

        // Whole frames only, so the callback never sees half a frame
        let frame_bytes = self.format.bytes_per_frame();
        let mut frame = Vec::with_capacity(self.ring.frame_len());
        let mut written = 0;

        'frames: for bytes in data.chunks_exact(frame_bytes) {
            decode_le(bytes, &mut frame);
            while !self.ring.push_frame(&frame) {
                if !self.active.load(Ordering::Relaxed) || self.closed.load(Ordering::Relaxed) {
                    break 'frames;
                }
                thread::sleep(POLL_INTERVAL);
            }
            written += frame_bytes;
        }

        Ok(written)
    }

    fn flush(&self) {
        let dropped = self.ring.clear();
        if dropped > 0 {
            tracing::debug!("Flushed {} unplayed samples", dropped);
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.active.store(false, Ordering::SeqCst);
        self.host.shutdown();
    }

    fn stats(&self) -> LineStats {
        LineStats {
            overflows: 0,
            underruns: self.ring.underrun_count(),
        }
    }
}

enum StreamCommand {
    Play(Sender<Result<(), AudioError>>),
    Pause,
}

/// Thread owning a cpal stream for the lifetime of a line
struct StreamHost {
    commands: Mutex<Option<Sender<StreamCommand>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl StreamHost {
    fn spawn<F>(name: &str, build: F) -> Result<Self, AudioError>
    where
        F: FnOnce() -> Result<cpal::Stream, AudioError> + Send + 'static,
    {
        let (command_tx, command_rx) = unbounded::<StreamCommand>();
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Some hosts start streams as soon as they are built
                if let Err(e) = stream.pause() {
                    tracing::debug!("Initial pause not supported: {}", e);
                }
                let _ = ready_tx.send(Ok(()));

                // Runs until the line drops its command sender
                for command in command_rx.iter() {
                    match command {
                        StreamCommand::Play(reply) => {
                            let result = stream
                                .play()
                                .map_err(|e| AudioError::StreamError(e.to_string()));
                            let _ = reply.send(result);
                        }
                        StreamCommand::Pause => {
                            if let Err(e) = stream.pause() {
                                tracing::warn!("Failed to pause stream: {}", e);
                            }
                        }
                    }
                }
            })
            .map_err(|e| AudioError::DeviceOpenFailed(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                commands: Mutex::new(Some(command_tx)),
                thread: Mutex::new(Some(handle)),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(AudioError::DeviceOpenFailed(
                    "stream thread exited during setup".to_string(),
                ))
            }
        }
    }

    fn play(&self) -> Result<(), AudioError> {
        let (reply_tx, reply_rx) = bounded(1);
        {
            let commands = self.commands.lock();
            let sender = commands
                .as_ref()
                .ok_or_else(|| AudioError::StreamError("stream is shut down".to_string()))?;
            sender
                .send(StreamCommand::Play(reply_tx))
                .map_err(|_| AudioError::StreamError("stream thread exited".to_string()))?;
        }
        reply_rx
            .recv()
            .map_err(|_| AudioError::StreamError("stream thread exited".to_string()))?
    }

    fn pause(&self) {
        if let Some(sender) = self.commands.lock().as_ref() {
            let _ = sender.send(StreamCommand::Pause);
        }
    }

    /// Drop the stream and wait for its thread
    fn shutdown(&self) {
        self.commands.lock().take();
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Stream host thread panicked");
            }
        }
    }
}

impl Drop for StreamHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn device_name(device: &cpal::Device) -> String {
    device.name().unwrap_or_else(|_| "Unknown".to_string())
}

/// Look up a device by exact name, or the host default when no name is given
fn find_device(direction: Direction, name: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();

    let Some(name) = name else {
        let device = match direction {
            Direction::Input => host.default_input_device(),
            Direction::Output => host.default_output_device(),
        };
        return device.ok_or_else(|| {
            AudioError::DeviceUnavailable(format!("No default {} device", direction))
        });
    };

    let matches = |device: &cpal::Device| device.name().map(|n| n == name).unwrap_or(false);
    let found = match direction {
        Direction::Input => host
            .input_devices()
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?
            .find(matches),
        Direction::Output => host
            .output_devices()
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?
            .find(matches),
    };

    found.ok_or_else(|| {
        AudioError::DeviceUnavailable(format!("{} device not found: {}", direction, name))
    })
}

/// Pick a stream config for `format`, preferring native i16 over f32 samples
fn select_config(
    ranges: &[SupportedStreamConfigRange],
    format: PcmFormat,
) -> Option<(StreamConfig, SampleFormat)> {
    let rate = SampleRate(format.sample_rate());

    [SampleFormat::I16, SampleFormat::F32]
        .into_iter()
        .find(|&preferred| {
            ranges.iter().any(|range| {
                range.sample_format() == preferred
                    && range.channels() == format.channels()
                    && range.min_sample_rate() <= rate
                    && rate <= range.max_sample_rate()
            })
        })
        .map(|sample_format| {
            let config = StreamConfig {
                channels: format.channels(),
                sample_rate: rate,
                buffer_size: cpal::BufferSize::Default,
            };
            (config, sample_format)
        })
}

fn on_stream_error(direction: Direction, lost: &AtomicBool, err: cpal::StreamError) {
    tracing::error!("{} stream error: {}", direction, err);
    if matches!(err, cpal::StreamError::DeviceNotAvailable) {
        lost.store(true, Ordering::SeqCst);
    }
}

fn build_input_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    ring: SharedSampleRing,
    lost: Arc<AtomicBool>,
) -> Result<cpal::Stream, AudioError> {
    let err_fn = move |err| on_stream_error(Direction::Input, &lost, err);

    let stream = match sample_format {
        SampleFormat::I16 => device.build_input_stream(
            config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                ring.push_slice(data);
            },
            err_fn,
            None,
        ),
        SampleFormat::F32 => {
            let mut scratch: Vec<i16> = Vec::new();
            device.build_input_stream(
                config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    scratch.clear();
                    scratch.extend(data.iter().map(|&sample| {
                        (sample * I16_SCALE).clamp(i16::MIN as f32, I16_SCALE) as i16
                    }));
                    ring.push_slice(&scratch);
                },
                err_fn,
                None,
            )
        }
        other => {
            return Err(AudioError::DeviceUnavailable(format!(
                "unsupported sample format {:?}",
                other
            )))
        }
    };

    stream.map_err(|e| AudioError::DeviceOpenFailed(e.to_string()))
}

fn build_output_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    ring: SharedSampleRing,
    lost: Arc<AtomicBool>,
) -> Result<cpal::Stream, AudioError> {
    let err_fn = move |err| on_stream_error(Direction::Output, &lost, err);

    let stream = match sample_format {
        SampleFormat::I16 => device.build_output_stream(
            config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                ring.pop_or_silence(data);
            },
            err_fn,
            None,
        ),
        SampleFormat::F32 => {
            let mut scratch: Vec<i16> = Vec::new();
            device.build_output_stream(
                config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0);
                    ring.pop_or_silence(&mut scratch);
                    for (out, &sample) in data.iter_mut().zip(scratch.iter()) {
                        *out = sample as f32 / I16_SCALE;
                    }
                },
                err_fn,
                None,
            )
        }
        other => {
            return Err(AudioError::DeviceUnavailable(format!(
                "unsupported sample format {:?}",
                other
            )))
        }
    };

    stream.map_err(|e| AudioError::DeviceOpenFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpal::SupportedBufferSize;

    fn range(channels: u16, min: u32, max: u32, format: SampleFormat) -> SupportedStreamConfigRange {
        SupportedStreamConfigRange::new(
            channels,
            SampleRate(min),
            SampleRate(max),
            SupportedBufferSize::Unknown,
            format,
        )
    }

    #[test]
    fn test_select_config_prefers_i16() {
        let ranges = vec![
            range(1, 8_000, 48_000, SampleFormat::F32),
            range(1, 8_000, 48_000, SampleFormat::I16),
        ];
        let (config, sample_format) = select_config(&ranges, PcmFormat::speech()).unwrap();
        assert_eq!(sample_format, SampleFormat::I16);
        assert_eq!(config.channels, 1);
        assert_eq!(config.sample_rate, SampleRate(16_000));
    }

    #[test]
    fn test_select_config_falls_back_to_f32() {
        let ranges = vec![range(2, 44_100, 48_000, SampleFormat::F32)];
        let format = PcmFormat::new(48_000, 2).unwrap();
        let (_, sample_format) = select_config(&ranges, format).unwrap();
        assert_eq!(sample_format, SampleFormat::F32);
    }

    #[test]
    fn test_select_config_rejects_mismatch() {
        let ranges = vec![
            range(2, 8_000, 48_000, SampleFormat::I16),
            range(1, 44_100, 48_000, SampleFormat::I16),
            range(1, 8_000, 48_000, SampleFormat::U8),
        ];
        assert!(select_config(&ranges, PcmFormat::speech()).is_none());
    }

    /// Host with no stream behind it, for exercising line I/O
    fn idle_host() -> StreamHost {
        StreamHost {
            commands: Mutex::new(None),
            thread: Mutex::new(None),
        }
    }

    fn stereo_input(ring: SharedSampleRing) -> CpalInputLine {
        CpalInputLine {
            format: PcmFormat::new(48_000, 2).unwrap(),
            ring,
            host: idle_host(),
            active: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            lost: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn test_stereo_read_returns_whole_frames() {
        let ring = Arc::new(SampleRing::new(4, 2));
        // Callback delivered three frames; the last overflows and is dropped whole
        ring.push_slice(&[1, -1, 2, -2, 3, -3]);
        let line = stereo_input(ring.clone());

        // Room for one and a half frames: only the whole frame is read
        let mut buf = [0u8; 6];
        assert_eq!(line.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], &[1, 0, 0xff, 0xff]);

        // Deadline expires with one frame buffered
        let mut buf = [0u8; 16];
        assert_eq!(line.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], &[2, 0, 0xfe, 0xff]);
        assert_eq!(line.stats().overflows, 2);

        ring.push_slice(&[4, -4]);
        assert_eq!(line.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], &[4, 0, 0xfc, 0xff]);
    }

    #[test]
    fn test_stereo_write_pushes_whole_frames() {
        let ring = Arc::new(SampleRing::new(4, 2));
        let line = CpalOutputLine {
            format: PcmFormat::new(48_000, 2).unwrap(),
            ring: ring.clone(),
            host: idle_host(),
            active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            lost: Arc::new(AtomicBool::new(false)),
        };

        // Inactive line stops at the first frame that does not fit
        let data = [1, 0, 0xff, 0xff, 2, 0, 0xfe, 0xff, 3, 0, 0xfd, 0xff];
        assert_eq!(line.write(&data).unwrap(), 8);

        let mut out = [0i16; 4];
        ring.pop_or_silence(&mut out);
        assert_eq!(out, [1, -1, 2, -2]);
        assert_eq!(ring.underrun_count(), 0);
    }

    // Device tests require actual audio hardware and are skipped in CI
    #[test]
    #[ignore = "requires audio hardware"]
    fn test_open_default_lines() {
        let backend = CpalBackend::new();
        let format = PcmFormat::speech();
        let input = backend.open_input(format, format.bytes_per_second()).unwrap();
        let output = backend.open_output(format, None).unwrap();
        input.close();
        output.close();
    }
}
