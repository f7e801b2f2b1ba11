use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::media::{Micros, MICROS_PER_MS};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no sources configured")]
    NoSources,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub url: String,
    #[serde(default = "default_viewers")]
    pub viewers: usize,
    #[serde(default)]
    pub start_ms: i64,
    #[serde(default = "default_rate")]
    pub rate: f64,
}

fn default_viewers() -> usize {
    1
}

fn default_rate() -> f64 {
    1.0
}

fn default_decode_next() -> u64 {
    3000
}

fn default_release_prev() -> u64 {
    1000
}

fn default_gop_min() -> u64 {
    0
}

fn default_debounce() -> u64 {
    100
}

fn default_audio_segment() -> u64 {
    5000
}

fn default_range_window() -> u64 {
    4 * 1024 * 1024
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

/// Playback window and loading policy shared by every scheduler and the
/// execution context.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_decode_next")]
    pub decode_next_ms: u64,
    #[serde(default = "default_release_prev")]
    pub release_prev_ms: u64,
    #[serde(default = "default_gop_min")]
    pub gop_min_ms: u64,
    #[serde(default = "default_debounce")]
    pub decode_debounce_ms: u64,
    #[serde(default = "default_audio_segment")]
    pub audio_segment_ms: u64,
    #[serde(default = "default_range_window")]
    pub range_window_bytes: u64,
    #[serde(default)]
    pub preload_all: bool,
    #[serde(default)]
    pub mute: bool,
    #[serde(default)]
    pub persist_ranges: bool,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            decode_next_ms: default_decode_next(),
            release_prev_ms: default_release_prev(),
            gop_min_ms: default_gop_min(),
            decode_debounce_ms: default_debounce(),
            audio_segment_ms: default_audio_segment(),
            range_window_bytes: default_range_window(),
            preload_all: false,
            mute: false,
            persist_ranges: false,
            data_dir: default_data_dir(),
        }
    }
}

impl CacheConfig {
    pub fn decode_next(&self) -> Micros {
        ms_to_micros(self.decode_next_ms)
    }

    pub fn release_prev(&self) -> Micros {
        ms_to_micros(self.release_prev_ms)
    }

    pub fn gop_min(&self) -> Micros {
        ms_to_micros(self.gop_min_ms)
    }

    pub fn audio_segment(&self) -> Micros {
        ms_to_micros(self.audio_segment_ms.max(1))
    }

    pub fn decode_debounce(&self) -> Duration {
        Duration::from_millis(self.decode_debounce_ms)
    }
}

fn ms_to_micros(ms: u64) -> Micros {
    (ms as Micros).saturating_mul(MICROS_PER_MS)
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    360
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecoderConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            ffmpeg: default_ffmpeg(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;

        if config.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }

        Ok(config)
    }
}
