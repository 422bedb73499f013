use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::catalog::{VideoId, write_json_atomically};
use crate::config::PlaybackSettings;

/// Runtime preferences that survive restarts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default)]
    pub last_wallpaper: Option<VideoId>,
    pub audio_enabled: bool,
    pub audio_volume: f32,
}

impl Preferences {
    /// What a fresh install starts with
    pub fn from_settings(settings: &PlaybackSettings) -> Self {
        Self {
            last_wallpaper: None,
            audio_enabled: !settings.start_muted,
            audio_volume: settings.default_volume,
        }
    }
}

/// `state.json`, rewritten atomically on every change
pub struct PreferencesFile {
    path: PathBuf,
}

impl PreferencesFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load saved preferences, falling back to `defaults` when none exist
    /// or the file cannot be read
    pub fn load_or(&self, defaults: Preferences) -> Preferences {
        match self.load() {
            Ok(Some(prefs)) => prefs,
            Ok(None) => defaults,
            Err(e) => {
                log::warn!("Ignoring unreadable {}: {:#}", self.path.display(), e);
                defaults
            }
        }
    }

    fn load(&self) -> Result<Option<Preferences>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let mut prefs: Preferences = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;
        prefs.audio_volume = prefs.audio_volume.clamp(0.0, 1.0);
        Ok(Some(prefs))
    }

    pub fn save(&self, prefs: &Preferences) -> Result<()> {
        write_json_atomically(&self.path, prefs)
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_playback_settings() {
        let prefs = Preferences::from_settings(&PlaybackSettings::default());
        assert!(!prefs.audio_enabled);
        assert_eq!(prefs.audio_volume, 1.0);
        assert!(prefs.last_wallpaper.is_none());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let file = PreferencesFile::new(dir.path().join("state.json"));
        let prefs = Preferences {
            last_wallpaper: VideoId::new("dQw4w9WgXcQ"),
            audio_enabled: true,
            audio_volume: 0.4,
        };

        file.save(&prefs).unwrap();
        let defaults = Preferences::from_settings(&PlaybackSettings::default());
        assert_eq!(file.load_or(defaults), prefs);
    }

    #[test]
    fn test_missing_or_corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = PreferencesFile::new(dir.path().join("state.json"));
        let defaults = Preferences::from_settings(&PlaybackSettings::default());

        assert_eq!(file.load_or(defaults.clone()), defaults);

        std::fs::write(file.path(), "[]").unwrap();
        assert_eq!(file.load_or(defaults.clone()), defaults);
    }
}
