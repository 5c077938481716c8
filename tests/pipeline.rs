//! End-to-end tests for the capture → queue → playback pipeline.
//!
//! Everything runs against the in-memory mock backend; nothing here needs
//! audio hardware.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nexus_audio::audio::device::{MockBackend, ReadStep};
use nexus_audio::{CaptureEngine, EchoPump, EngineState, PcmFormat, PlaybackEngine};

fn engines() -> (Arc<MockBackend>, Arc<CaptureEngine>, Arc<PlaybackEngine>) {
    let backend = Arc::new(MockBackend::new());
    let capture = Arc::new(CaptureEngine::new(backend.clone()));
    let playback = Arc::new(PlaybackEngine::new(backend.clone()));
    (backend, capture, playback)
}

#[test]
fn test_enqueued_silence_played_once_within_200ms() {
    let (backend, capture, playback) = engines();
    let format = PcmFormat::new(16_000, 1).unwrap();

    capture.initialize(format).unwrap();
    playback.initialize(format).unwrap();
    capture.start().unwrap();
    playback.start().unwrap();

    let silence = vec![0u8; 3200];
    playback.enqueue_audio(silence.clone());

    let output = backend.output();
    assert!(output.wait_for_writes(1, Duration::from_millis(200)));

    // Give a duplicate write the chance to show up
    thread::sleep(Duration::from_millis(150));
    assert_eq!(output.writes(), vec![silence]);

    capture.close();
    playback.close();
}

#[test]
fn test_capture_survives_ten_empty_reads() {
    let (backend, capture, _) = engines();
    let input = backend.input();
    input.push_empty_reads(10);
    input.push_read(ReadStep::Data(vec![0x11; 3200]));

    capture.initialize(PcmFormat::speech()).unwrap();
    capture.start().unwrap();

    let chunk = capture
        .queue()
        .poll_timeout(Duration::from_secs(2))
        .expect("chunk from eleventh read");
    assert_eq!(chunk.as_ref(), &[0x11u8; 3200][..]);
    assert_eq!(input.pending_reads(), 0);
    assert_eq!(capture.state(), EngineState::Running);
    assert!(capture.is_running());

    capture.close();
}

#[test]
fn test_playback_stop_mid_wait_is_bounded() {
    let (_, _, playback) = engines();
    playback.initialize(PcmFormat::speech()).unwrap();
    playback.start().unwrap();
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    playback.stop();
    assert!(started.elapsed() <= Duration::from_millis(1100));
    assert_eq!(playback.state(), EngineState::Stopped);

    playback.close();
    assert_eq!(playback.state(), EngineState::Closed);
}

#[test]
fn test_never_started_engines_close_cleanly() {
    let (backend, capture, playback) = engines();
    capture.stop();
    capture.close();
    playback.stop();
    playback.close();

    assert_eq!(capture.state(), EngineState::Closed);
    assert_eq!(playback.state(), EngineState::Closed);
    assert_eq!(backend.input().starts(), 0);
    assert_eq!(backend.output().starts(), 0);
}

#[test]
fn test_echo_pump_preserves_chunk_order() {
    let (backend, capture, playback) = engines();
    let input = backend.input();
    for i in 0..5u8 {
        input.push_read(ReadStep::Empty);
        input.push_read(ReadStep::Data(vec![i; 320]));
    }

    let pump = EchoPump::new(capture, playback);
    pump.start(PcmFormat::speech()).unwrap();

    let output = backend.output();
    assert!(output.wait_for_writes(5, Duration::from_secs(2)));
    let expected: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 320]).collect();
    assert_eq!(output.writes(), expected);

    pump.shutdown();
    assert_eq!(output.closes(), 1);
    assert_eq!(input.closes(), 1);
}
