//! Application configuration
//!
//! Loaded from TOML. Every field has a default, so an empty or missing file
//! gives the 16 kHz mono echo setup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::capture::CaptureSettings;
use crate::audio::format::PcmFormat;
use crate::audio::playback::PlaybackSettings;
use crate::constants::*;
use crate::error::{Error, Result};

const CONFIG_FILE: &str = "config.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    pub lifecycle: LifecycleConfig,
}

/// Stream format shared by both engines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Input device name; the host default when unset
    pub device: Option<String>,
    pub chunk_ms: u64,
    pub buffer_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            chunk_ms: CHUNK_MS,
            buffer_ms: CAPTURE_BUFFER_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Output device name; the host default when unset
    pub device: Option<String>,
    pub poll_timeout_ms: u64,
    /// Device buffer; the backend default when unset
    pub buffer_ms: Option<u64>,
    /// Maximum queued chunks; unbounded when unset
    pub queue_capacity: Option<usize>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            device: None,
            poll_timeout_ms: POLL_TIMEOUT_MS,
            buffer_ms: None,
            queue_capacity: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Bounded wait for worker threads on stop
    pub join_timeout_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            join_timeout_ms: JOIN_TIMEOUT_MS,
        }
    }
}

impl LifecycleConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl AppConfig {
    /// Parse and validate a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path. The file must exist.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Load from the platform config directory, or defaults if there is no file
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading configuration from {}", path.display());
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// `config.toml` in the per-user config directory
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("at", "nexus", "nexus-audio")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.format()?;
        if self.capture.chunk_ms == 0 {
            return Err(Error::Config("capture.chunk_ms must be positive".into()));
        }
        if self.capture.buffer_ms < self.capture.chunk_ms {
            return Err(Error::Config(
                "capture.buffer_ms must hold at least one chunk".into(),
            ));
        }
        if self.playback.poll_timeout_ms == 0 {
            return Err(Error::Config(
                "playback.poll_timeout_ms must be positive".into(),
            ));
        }
        if self.playback.queue_capacity == Some(0) {
            return Err(Error::Config(
                "playback.queue_capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    /// PCM format for both engines
    pub fn format(&self) -> Result<PcmFormat> {
        PcmFormat::new(self.audio.sample_rate, self.audio.channels)
            .map_err(|e| Error::Config(e.to_string()))
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            chunk: Duration::from_millis(self.capture.chunk_ms),
            device_buffer: Duration::from_millis(self.capture.buffer_ms),
            join_timeout: self.lifecycle.join_timeout(),
        }
    }

    pub fn playback_settings(&self) -> PlaybackSettings {
        PlaybackSettings {
            poll_timeout: Duration::from_millis(self.playback.poll_timeout_ms),
            device_buffer: self.playback.buffer_ms.map(Duration::from_millis),
            join_timeout: self.lifecycle.join_timeout(),
            queue_capacity: self.playback.queue_capacity,
        }
    }
}
