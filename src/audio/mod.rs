//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod format;
pub mod lifecycle;
pub mod playback;
pub mod queue;

pub use capture::{CaptureEngine, CaptureSettings, CaptureStats};
pub use device::{AudioBackend, CpalBackend, InputLine, OutputLine, SharedBackend};
pub use format::PcmFormat;
pub use lifecycle::EngineState;
pub use playback::{PlaybackEngine, PlaybackSettings, PlaybackStats};
pub use queue::{AudioChunk, AudioQueue, SharedAudioQueue};
