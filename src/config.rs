//! Configuration management for CrabStream
//!
//! `StreamingConfiguration` is the value object handed to a session at
//! construction. The session snapshots it by value when a start attempt
//! begins, so later mutation only affects the next start. It can also be
//! loaded from and saved to TOML.

use crate::errors::StreamingError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingConfiguration {
    pub video: VideoConfig,
    pub audio: AudioConfig,
    pub session: SessionConfig,
}

/// Video encode parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Encoded width in pixels
    pub width: u32,
    /// Encoded height in pixels
    pub height: u32,
    /// Frames per second
    pub fps: u32,
    /// Target bitrate in bits per second
    pub bitrate: u32,
    /// Frames between keyframes
    pub keyframe_interval: u32,
}

/// Audio encode parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Target bitrate in bits per second
    pub bitrate: u32,
}

/// Session plumbing parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Network connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Raw frames buffered between capture and encode before dropping
    pub frame_queue_capacity: usize,
    /// Encoded packets buffered by the publisher before reporting degradation
    pub publish_queue_capacity: usize,
}

/// Quality presets for the video section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoQuality {
    /// 360p at 24fps
    Low,
    /// 540p at 30fps
    Medium,
    /// 720p at 30fps
    High,
}

impl VideoQuality {
    /// Get recommended bitrate in bits per second
    pub fn bitrate(&self) -> u32 {
        match self {
            VideoQuality::Low => 600_000,
            VideoQuality::Medium => 1_200_000,
            VideoQuality::High => 2_000_000,
        }
    }

    /// Get recommended resolution (width, height)
    pub fn resolution(&self) -> (u32, u32) {
        match self {
            VideoQuality::Low => (640, 360),
            VideoQuality::Medium => (960, 540),
            VideoQuality::High => (1280, 720),
        }
    }

    pub fn fps(&self) -> u32 {
        match self {
            VideoQuality::Low => 24,
            VideoQuality::Medium | VideoQuality::High => 30,
        }
    }
}

impl VideoConfig {
    /// Build a video section from a quality preset. Keyframe every 3 seconds.
    pub fn from_quality(quality: VideoQuality) -> Self {
        let (width, height) = quality.resolution();
        Self {
            width,
            height,
            fps: quality.fps(),
            bitrate: quality.bitrate(),
            keyframe_interval: quality.fps() * 3,
        }
    }
}

impl Default for StreamingConfiguration {
    fn default() -> Self {
        Self {
            video: VideoConfig::from_quality(VideoQuality::High),
            audio: AudioConfig {
                sample_rate: 44_100,
                channels: 1,
                bitrate: 96_000,
            },
            session: SessionConfig {
                connect_timeout_ms: 10_000,
                frame_queue_capacity: 8,
                publish_queue_capacity: 256,
            },
        }
    }
}

const SUPPORTED_SAMPLE_RATES: [u32; 5] = [8_000, 16_000, 22_050, 44_100, 48_000];

impl StreamingConfiguration {
    /// Default configuration with the video section taken from a preset
    pub fn with_quality(quality: VideoQuality) -> Self {
        Self {
            video: VideoConfig::from_quality(quality),
            ..Self::default()
        }
    }

    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, StreamingError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).map_err(|e| {
            StreamingError::InvalidConfiguration(format!("Failed to read config file: {}", e))
        })?;

        let config: StreamingConfiguration = toml::from_str(&contents).map_err(|e| {
            StreamingError::InvalidConfiguration(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), StreamingError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                StreamingError::InvalidConfiguration(format!(
                    "Failed to create config directory: {}",
                    e
                ))
            })?;
        }

        let toml_string = toml::to_string_pretty(self).map_err(|e| {
            StreamingError::InvalidConfiguration(format!("Failed to serialize config: {}", e))
        })?;

        fs::write(path, toml_string).map_err(|e| {
            StreamingError::InvalidConfiguration(format!("Failed to write config file: {}", e))
        })?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> PathBuf {
        PathBuf::from("crabstream.toml")
    }

    /// Load from default location or fall back to defaults
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.session.connect_timeout_ms)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), StreamingError> {
        let invalid = |msg: &str| Err(StreamingError::InvalidConfiguration(msg.to_string()));

        if self.video.width == 0 || self.video.height == 0 {
            return invalid("Invalid video resolution");
        }
        if self.video.width % 2 != 0 || self.video.height % 2 != 0 {
            return invalid("Video dimensions must be even");
        }
        if self.video.fps == 0 || self.video.fps > 120 {
            return invalid("Invalid video FPS (must be 1-120)");
        }
        if self.video.bitrate == 0 {
            return invalid("Video bitrate must be positive");
        }
        if self.video.keyframe_interval == 0 {
            return invalid("Keyframe interval must be positive");
        }

        if !SUPPORTED_SAMPLE_RATES.contains(&self.audio.sample_rate) {
            return invalid("Unsupported audio sample rate");
        }
        if self.audio.channels == 0 || self.audio.channels > 2 {
            return invalid("Audio channels must be 1 or 2");
        }
        if self.audio.bitrate == 0 {
            return invalid("Audio bitrate must be positive");
        }

        if self.session.connect_timeout_ms == 0 {
            return invalid("Connect timeout must be positive");
        }
        if self.session.frame_queue_capacity == 0 || self.session.publish_queue_capacity == 0 {
            return invalid("Queue capacities must be positive");
        }

        Ok(())
    }
}
