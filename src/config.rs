//! Player configuration.
//!
//! Every field has a default, so a TOML file only needs the values it changes. Command-line
//! flags of the binary are applied on top of the loaded file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::media::DecodeMode;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Capacity of each inter-stage queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub video_packets: usize,
    pub audio_packets: usize,
    pub video_frames: usize,
    pub audio_buffers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            video_packets: 64,
            audio_packets: 128,
            video_frames: 3,
            audio_buffers: 32,
        }
    }
}

/// Cadence of the control-thread ticks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    pub render_ms: u64,
    pub audio_ms: u64,
}

impl TickConfig {
    pub fn render_interval(&self) -> Duration {
        Duration::from_millis(self.render_ms)
    }

    pub fn audio_interval(&self) -> Duration {
        Duration::from_millis(self.audio_ms)
    }
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            render_ms: 8,
            audio_ms: 5,
        }
    }
}

/// Audio output sink settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Device occupancy the sink keeps topped up
    pub target_buffer_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self { target_buffer_ms: 200 }
    }
}

/// Thresholds of the render scheduler, all in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Lower clamp of the sync threshold
    pub min_threshold: f64,
    /// Upper clamp of the sync threshold
    pub max_threshold: f64,
    /// Beyond this drift no correction is attempted
    pub no_sync_threshold: f64,
    /// Base delays above this are extended by the full drift when video is ahead
    pub long_delay: f64,
    /// Frame-to-frame gaps above this are treated as discontinuities
    pub max_frame_delay: f64,
    pub min_delay: f64,
    pub max_delay: f64,
    /// Delay used for the first frame and after implausible gaps
    pub bootstrap_delay: f64,
    /// Lag behind the reference that arms catch-up dropping
    pub catch_up_lag: f64,
    /// Consecutive late frames before catch-up dropping
    pub catch_up_ticks: u32,
    /// Maximum frames discarded per catch-up
    pub max_drop_frames: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_threshold: 0.01,
            max_threshold: 0.1,
            no_sync_threshold: 10.0,
            long_delay: 0.1,
            max_frame_delay: 1.0,
            min_delay: 0.001,
            max_delay: 0.5,
            bootstrap_delay: 0.033,
            catch_up_lag: 1.0,
            catch_up_ticks: 10,
            max_drop_frames: 5,
        }
    }
}

/// Complete player configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub decode_mode: DecodeMode,
    #[serde(rename = "loop")]
    pub loop_playback: bool,
    /// Initial volume, 0..=100
    pub volume: u8,
    /// Presented frames per metrics window
    pub metrics_window: u64,
    pub queues: QueueConfig,
    pub ticks: TickConfig,
    pub audio: AudioConfig,
    pub sync: SyncConfig,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            decode_mode: DecodeMode::Auto,
            loop_playback: true,
            volume: 100,
            metrics_window: 100,
            queues: QueueConfig::default(),
            ticks: TickConfig::default(),
            audio: AudioConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl PlayerConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: PlayerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.volume > 100 {
            return Err(ConfigError::Invalid(format!(
                "volume {} outside 0..=100",
                self.volume
            )));
        }
        let q = &self.queues;
        if [q.video_packets, q.audio_packets, q.video_frames, q.audio_buffers].contains(&0) {
            return Err(ConfigError::Invalid("queue capacities must be positive".into()));
        }
        if self.ticks.render_ms == 0 || self.ticks.audio_ms == 0 {
            return Err(ConfigError::Invalid("tick intervals must be positive".into()));
        }
        let s = &self.sync;
        if !(s.min_threshold <= s.max_threshold && s.min_delay <= s.max_delay) {
            return Err(ConfigError::Invalid(
                "sync bounds must satisfy min <= max".into(),
            ));
        }
        if s.bootstrap_delay <= 0.0 {
            return Err(ConfigError::Invalid("bootstrap delay must be positive".into()));
        }
        Ok(())
    }
}
