//! Transcoder configuration

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TranscodeError};

/// How a seek lands relative to the requested timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SeekPolicy {
    /// Land on the nearest keyframe at or before the target.
    #[default]
    KeyframeBefore,
    /// Seek to the preceding keyframe, then drop packets that end before the
    /// target.
    Exact,
}

/// Source reading configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Backward-seek behaviour
    pub seek_policy: SeekPolicy,

    /// The packet pump pauses once this many compressed bytes are queued
    pub max_buffered_bytes: usize,

    /// How often a waiting consumer re-checks the pump, in milliseconds
    pub poll_interval_ms: u64,

    /// Protocol-level options passed to the demuxer (e.g. `headers`,
    /// `user_agent`, `timeout`)
    pub options: BTreeMap<String, String>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            seek_policy: SeekPolicy::KeyframeBefore,
            max_buffered_bytes: 4 * 1024 * 1024,
            poll_interval_ms: 50,
            options: BTreeMap::new(),
        }
    }
}

/// Output (write path) configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WriterConfig {
    /// Encoder bitrate in bps; 0 leaves the codec default
    pub bitrate: u64,

    /// Encoder name override (e.g. `aac`, `libmp3lame`); by default the
    /// container's default audio codec is used
    pub codec: Option<String>,

    /// Container name override (e.g. `adts`, `ipod`); by default the output
    /// path's extension decides
    pub container: Option<String>,

    /// Preferred output sample rate; defaults to the input rate
    pub sample_rate: Option<u32>,

    /// Preferred output channel count; defaults to the input count
    pub channels: Option<u16>,

    /// Preferred output sample format name (e.g. `fltp`); defaults to the
    /// input format
    pub sample_format: Option<String>,
}

/// Decoded output for a playback consumer (read path)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: String,

    /// Extra filter chain applied before format conversion (e.g.
    /// `volume=0.5`)
    pub filter: Option<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 2,
            sample_format: "fltp".to_string(),
            filter: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// `json` for structured output, anything else for plain text
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TranscodeConfig {
    pub reader: ReaderConfig,
    pub writer: WriterConfig,
    pub playback: PlaybackConfig,
    pub logging: LoggingConfig,
}

impl TranscodeConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| TranscodeError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &str) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| TranscodeError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
