use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::playback::FadeCurve;
use crate::validate_enum;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralSettings,

    #[serde(default)]
    pub library: LibrarySettings,

    #[serde(default)]
    pub fetch: FetchSettings,

    #[serde(default)]
    pub playback: PlaybackSettings,

    #[serde(default)]
    pub display: DisplaySettings,
}

/// General daemon settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeneralSettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Play the last wallpaper again when the daemon starts
    #[serde(default = "default_true")]
    pub restore_on_launch: bool,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            restore_on_launch: true,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

/// Where the library lives on disk
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LibrarySettings {
    /// Directory holding cached video files
    #[serde(default)]
    pub cache_dir: Option<String>,

    /// Catalog file (JSON)
    #[serde(default)]
    pub catalog_path: Option<String>,

    /// Persisted runtime preferences (JSON)
    #[serde(default)]
    pub state_path: Option<String>,
}

impl LibrarySettings {
    pub fn cache_dir(&self) -> Result<PathBuf> {
        match &self.cache_dir {
            Some(dir) => Ok(expand_path(dir)),
            None => Ok(dirs::cache_dir()
                .context("Failed to get cache directory")?
                .join("loopwall")
                .join("videos")),
        }
    }

    pub fn catalog_path(&self) -> Result<PathBuf> {
        match &self.catalog_path {
            Some(path) => Ok(expand_path(path)),
            None => Ok(data_dir()?.join("catalog.json")),
        }
    }

    pub fn state_path(&self) -> Result<PathBuf> {
        match &self.state_path {
            Some(path) => Ok(expand_path(path)),
            None => Ok(data_dir()?.join("state.json")),
        }
    }
}

fn data_dir() -> Result<PathBuf> {
    Ok(dirs::data_dir()
        .context("Failed to get data directory")?
        .join("loopwall"))
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

/// External fetch tool settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FetchSettings {
    /// Explicit path to the fetch tool; searched on PATH when unset
    #[serde(default)]
    pub tool: Option<String>,

    #[serde(default = "default_tool_name")]
    pub tool_name: String,

    /// Extra directories searched after PATH
    #[serde(default = "default_search_dirs")]
    pub extra_search_dirs: Vec<String>,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    #[serde(default = "default_merge_format")]
    pub merge_output_format: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            tool: None,
            tool_name: default_tool_name(),
            extra_search_dirs: default_search_dirs(),
            probe_timeout_secs: default_probe_timeout(),
            merge_output_format: default_merge_format(),
        }
    }
}

fn default_tool_name() -> String {
    "yt-dlp".to_string()
}
fn default_search_dirs() -> Vec<String> {
    vec![
        "~/.local/bin".to_string(),
        "/usr/local/bin".to_string(),
        "/opt/homebrew/bin".to_string(),
    ]
}
fn default_probe_timeout() -> u64 {
    60
}
fn default_merge_format() -> String {
    "mp4".to_string()
}

/// Playback timing and audio defaults
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlaybackSettings {
    #[serde(default = "default_crossfade_ms")]
    pub crossfade_ms: u64,

    #[serde(default = "default_audio_fade_ms")]
    pub audio_fade_ms: u64,

    #[serde(default = "default_stop_fade_ms")]
    pub stop_fade_ms: u64,

    #[serde(default = "default_readiness_interval")]
    pub readiness_interval_ms: u64,

    #[serde(default = "default_readiness_attempts")]
    pub readiness_max_attempts: u32,

    #[serde(default = "default_volume")]
    pub default_volume: f32,

    #[serde(default = "default_true")]
    pub start_muted: bool,

    /// `linear`, `smooth` or `sine`
    #[serde(default)]
    pub fade_curve: FadeCurve,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            crossfade_ms: default_crossfade_ms(),
            audio_fade_ms: default_audio_fade_ms(),
            stop_fade_ms: default_stop_fade_ms(),
            readiness_interval_ms: default_readiness_interval(),
            readiness_max_attempts: default_readiness_attempts(),
            default_volume: default_volume(),
            start_muted: true,
            fade_curve: FadeCurve::default(),
        }
    }
}

fn default_crossfade_ms() -> u64 {
    800
}
fn default_audio_fade_ms() -> u64 {
    400
}
fn default_stop_fade_ms() -> u64 {
    500
}
fn default_readiness_interval() -> u64 {
    100
}
fn default_readiness_attempts() -> u32 {
    50
}
fn default_volume() -> f32 {
    1.0
}

impl PlaybackSettings {
    pub fn timings(&self) -> crate::playback::PlaybackTimings {
        crate::playback::PlaybackTimings {
            crossfade: Duration::from_millis(self.crossfade_ms),
            audio_fade: Duration::from_millis(self.audio_fade_ms),
            stop_fade: Duration::from_millis(self.stop_fade_ms),
            readiness_interval: Duration::from_millis(self.readiness_interval_ms),
            readiness_max_attempts: self.readiness_max_attempts,
            fade_curve: self.fade_curve,
        }
    }
}

/// Display surface settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DisplaySettings {
    /// Colour shown where the cover hides the video (hex, no alpha)
    #[serde(default = "default_cover_color")]
    pub cover_color: String,

    /// Displays used when no compositor topology is available
    #[serde(default)]
    pub fallback: Vec<FallbackDisplay>,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            cover_color: default_cover_color(),
            fallback: Vec::new(),
        }
    }
}

fn default_cover_color() -> String {
    "000000".to_string()
}

/// Statically configured display
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FallbackDisplay {
    pub name: String,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!(
                "Config file not found at {}, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::info!("Loaded configuration from {}", path.display());
        config.validate()?;

        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("loopwall");

        Ok(config_dir.join("config.toml"))
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        self.validate_log_level(&self.general.log_level)?;

        if !(0.0..=1.0).contains(&self.playback.default_volume) {
            anyhow::bail!(
                "Invalid default_volume (must be 0.0-1.0): {}",
                self.playback.default_volume
            );
        }

        if self.playback.readiness_max_attempts == 0 {
            anyhow::bail!("readiness_max_attempts must be at least 1");
        }

        if parse_hex_color(&self.display.cover_color).is_none() {
            anyhow::bail!("Invalid cover_color: {}", self.display.cover_color);
        }

        for display in &self.display.fallback {
            if display.width == 0 || display.height == 0 {
                anyhow::bail!("Fallback display {} has an empty frame", display.name);
            }
        }

        Ok(())
    }

    fn validate_log_level(&self, level: &str) -> Result<()> {
        validate_enum!(level, "trace", "debug", "info", "warn", "error")
    }
}

/// Parse a hex color string (e.g., "#FF5733" or "FF5733") to RGB
pub fn parse_hex_color(color: &str) -> Option<(u8, u8, u8)> {
    let color = color.trim_start_matches('#');

    if color.len() != 6 {
        return None;
    }

    let r = u8::from_str_radix(&color[0..2], 16).ok()?;
    let g = u8::from_str_radix(&color[2..4], 16).ok()?;
    let b = u8::from_str_radix(&color[4..6], 16).ok()?;

    Some((r, g, b))
}
