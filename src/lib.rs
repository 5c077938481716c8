//! # Nexus Audio
//!
//! Full-duplex PCM pump: microphone in, speaker out, with a queue on each
//! side so processing stages can be slotted in between.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐    ┌────────────────────────┐    ┌──────────────┐
//! │  Microphone  │───▶│ CaptureEngine          │    │ Speaker      │
//! │ (InputLine)  │    │  capture thread        │    │ (OutputLine) │
//! └──────────────┘    │  100ms chunks          │    └──────▲───────┘
//!                     └───────────┬────────────┘           │
//!                                 ▼                        │
//!                     ┌────────────────────────┐           │
//!                     │ AudioQueue (capture)   │           │
//!                     └───────────┬────────────┘           │
//!                                 ▼                        │
//!                     ┌────────────────────────┐           │
//!                     │ EchoPump               │           │
//!                     │  forwarding thread     │           │
//!                     │  (future VAD / STT)    │           │
//!                     └───────────┬────────────┘           │
//!                                 ▼ enqueue_audio          │
//!                     ┌────────────────────────┐           │
//!                     │ AudioQueue (playback)  │◀── TTS    │
//!                     └───────────┬────────────┘           │
//!                                 ▼                        │
//!                     ┌────────────────────────┐           │
//!                     │ PlaybackEngine         │───────────┘
//!                     │  playback thread       │
//!                     └────────────────────────┘
//! ```
//!
//! Each engine moves through `Uninitialized → Ready → Running ⇄ Stopped →
//! Closed`. Stop and close are idempotent and never fail.

pub mod audio;
pub mod config;
pub mod error;
pub mod pump;

pub use audio::{
    AudioChunk, AudioQueue, CaptureEngine, EngineState, PcmFormat, PlaybackEngine,
};
pub use error::{Error, Result};
pub use pump::EchoPump;

/// Application-wide constants
pub mod constants {
    /// Default sample rate, the usual speech-recognition rate
    pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

    /// Default channel count (mono)
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Audio per capture read and per queued chunk
    pub const CHUNK_MS: u64 = 100;

    /// Capture device buffer
    pub const CAPTURE_BUFFER_MS: u64 = 1_000;

    /// Playback device buffer when none is configured
    pub const DEFAULT_OUTPUT_BUFFER_MS: u64 = 200;

    /// Playback queue poll timeout
    pub const POLL_TIMEOUT_MS: u64 = 100;

    /// Bounded wait for worker threads on stop
    pub const JOIN_TIMEOUT_MS: u64 = 1_000;
}
