//! PCM sample format shared by capture and playback

use std::fmt;
use std::time::Duration;

use crate::error::AudioError;

/// Bits per sample. Only 16-bit PCM is supported.
pub const BIT_DEPTH: u16 = 16;

/// Bytes per single-channel sample
pub const BYTES_PER_SAMPLE: usize = (BIT_DEPTH / 8) as usize;

/// Immutable description of a 16-bit signed little-endian PCM stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PcmFormat {
    sample_rate: u32,
    channels: u16,
}

impl PcmFormat {
    /// Create a format, rejecting zero sample rates and channel counts other than 1 or 2
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, AudioError> {
        if sample_rate == 0 {
            return Err(AudioError::UnsupportedFormat(
                "sample rate must be positive".to_string(),
            ));
        }
        if !(1..=2).contains(&channels) {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} channels (expected 1 or 2)",
                channels
            )));
        }
        Ok(Self {
            sample_rate,
            channels,
        })
    }

    /// 16 kHz mono, the usual speech-recognition input format
    pub const fn speech() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn bit_depth(&self) -> u16 {
        BIT_DEPTH
    }

    pub fn is_signed(&self) -> bool {
        true
    }

    pub fn is_little_endian(&self) -> bool {
        true
    }

    /// Bytes in one frame (one sample per channel)
    pub fn bytes_per_frame(&self) -> usize {
        BYTES_PER_SAMPLE * self.channels as usize
    }

    /// Bytes in one second of audio
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.bytes_per_frame()
    }

    /// Bytes covering `duration`, rounded down to whole frames
    pub fn bytes_for(&self, duration: Duration) -> usize {
        let frames = (self.sample_rate as u128 * duration.as_micros()) / 1_000_000;
        frames as usize * self.bytes_per_frame()
    }

    /// Playing time of `bytes` bytes
    pub fn duration_of(&self, bytes: usize) -> Duration {
        let frames = (bytes / self.bytes_per_frame()) as u64;
        Duration::from_micros(frames * 1_000_000 / self.sample_rate as u64)
    }

    /// Whether `len` bytes hold a whole number of frames
    pub fn is_frame_aligned(&self, len: usize) -> bool {
        len % self.bytes_per_frame() == 0
    }
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self::speech()
    }
}

impl fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz, {} bit, {} channel(s), signed LE",
            self.sample_rate, BIT_DEPTH, self.channels
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speech_format_sizes() {
        let format = PcmFormat::speech();
        assert_eq!(format.bytes_per_frame(), 2);
        assert_eq!(format.bytes_per_second(), 32_000);
        assert_eq!(format.bytes_for(Duration::from_millis(100)), 3_200);
        assert_eq!(format.duration_of(3_200), Duration::from_millis(100));
    }

    #[test]
    fn test_stereo_alignment() {
        let format = PcmFormat::new(48_000, 2).unwrap();
        assert_eq!(format.bytes_per_frame(), 4);
        assert_eq!(format.bytes_for(Duration::from_millis(100)), 19_200);
        assert!(format.is_frame_aligned(8));
        assert!(!format.is_frame_aligned(6));
    }

    #[test]
    fn test_rejects_invalid_formats() {
        assert!(matches!(
            PcmFormat::new(0, 1),
            Err(AudioError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            PcmFormat::new(16_000, 6),
            Err(AudioError::UnsupportedFormat(_))
        ));
    }
}
