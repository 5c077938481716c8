//! Audio device lines
//!
//! The engines only see [`InputLine`] and [`OutputLine`]. A line is an open
//! handle to a device for one fixed [`PcmFormat`]; it is shared between the
//! engine thread doing I/O and the lifecycle calls, so every method takes
//! `&self`.

pub mod host;
pub mod mock;

use std::sync::Arc;

use crate::audio::format::PcmFormat;
use crate::error::AudioError;

pub use host::{CpalBackend, CpalInputLine, CpalOutputLine};
pub use mock::{MockBackend, MockInputLine, MockOutputLine, ReadStep};

/// Device-side counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineStats {
    /// Samples dropped because the capture buffer was full
    pub overflows: usize,
    /// Output callbacks that ran out of samples
    pub underruns: usize,
}

/// An open capture line
pub trait InputLine: Send + Sync {
    /// Begin delivering samples
    fn start(&self) -> Result<(), AudioError>;

    /// Pause delivery. Buffered samples stay readable.
    fn stop(&self);

    /// Blocking read of up to `buf.len()` bytes of PCM.
    ///
    /// `Ok(0)` means nothing arrived in time and the caller should retry.
    fn read(&self, buf: &mut [u8]) -> Result<usize, AudioError>;

    /// Release the device. Further reads fail.
    fn close(&self);

    fn stats(&self) -> LineStats {
        LineStats::default()
    }
}

/// An open playback line
pub trait OutputLine: Send + Sync {
    /// Begin rendering buffered samples
    fn start(&self) -> Result<(), AudioError>;

    /// Pause rendering. Unblocks a pending `write`.
    fn stop(&self);

    /// Write PCM bytes, blocking until the device has room for them.
    ///
    /// Returns early with a short count if the line is stopped mid-write.
    fn write(&self, data: &[u8]) -> Result<usize, AudioError>;

    /// Discard samples buffered but not yet rendered
    fn flush(&self);

    /// Release the device. Further writes fail.
    fn close(&self);

    fn stats(&self) -> LineStats {
        LineStats::default()
    }
}

pub type SharedInputLine = Arc<dyn InputLine>;
pub type SharedOutputLine = Arc<dyn OutputLine>;

/// Opens lines on some audio host
pub trait AudioBackend: Send + Sync {
    /// Open a capture line with a device buffer of `buffer_bytes`.
    ///
    /// Fails with `DeviceUnavailable` if no device supports `format`.
    fn open_input(
        &self,
        format: PcmFormat,
        buffer_bytes: usize,
    ) -> Result<SharedInputLine, AudioError>;

    /// Open a playback line. `None` leaves the buffer size to the backend.
    fn open_output(
        &self,
        format: PcmFormat,
        buffer_bytes: Option<usize>,
    ) -> Result<SharedOutputLine, AudioError>;
}

pub type SharedBackend = Arc<dyn AudioBackend>;
