//! Persisted player settings
//!
//! This module provides:
//! - `PlayerSettings`, the TOML document the player keeps between sessions
//! - `SettingsStore` for loading and saving it under the user config directory
//! - `SettingsWatcher` for hot-reload when the file changes on disk

use crate::domain::dsp::params;
use crate::domain::equalizer::{EqPreset, EqualizerBand, BAND_COUNT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Preset name recorded once individual gains have been edited
pub const CUSTOM_PRESET: &str = "custom";

/// Errors that can occur during settings operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("File watch error: {0}")]
    WatchError(#[from] notify::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Unknown equalizer preset: {0}")]
    UnknownPreset(String),
}

/// Equalizer section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EqualizerSettings {
    pub enabled: bool,

    /// Name of the preset the gains came from, or `custom`
    pub preset: String,

    /// Band gains in dB, lowest band first
    pub gains: [f32; BAND_COUNT],
}

impl Default for EqualizerSettings {
    fn default() -> Self {
        Self::from_preset(EqPreset::Flat, true)
    }
}

impl EqualizerSettings {
    pub fn from_preset(preset: EqPreset, enabled: bool) -> Self {
        Self {
            enabled,
            preset: preset.name().to_string(),
            gains: preset.gains(),
        }
    }

    /// The named preset, if the gains still come from one
    pub fn preset(&self) -> Option<EqPreset> {
        self.preset.parse().ok()
    }

    /// Replace gains with a named preset
    pub fn apply_preset(&mut self, preset: EqPreset) {
        self.preset = preset.name().to_string();
        self.gains = preset.gains();
    }

    /// Edit one band; the preset becomes `custom`
    pub fn set_gain(&mut self, band: usize, gain: f32) -> Result<()> {
        let slot = self
            .gains
            .get_mut(band)
            .ok_or_else(|| ConfigError::Invalid(format!("No equalizer band {band}")))?;
        *slot = EqualizerBand::new(0.0, gain).gain;
        self.preset = CUSTOM_PRESET.to_string();
        Ok(())
    }

    pub fn bands(&self) -> Vec<EqualizerBand> {
        EqualizerBand::from_gains(&self.gains)
    }
}

/// Fade section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FadeSettings {
    /// Default crossfade length in seconds
    pub duration_secs: f32,
}

impl Default for FadeSettings {
    fn default() -> Self {
        Self { duration_secs: 2.0 }
    }
}

/// Software engine section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Sample rate
    pub sample_rate: u32,

    /// Output channel count
    pub channels: u16,

    /// Audio buffer size in frames
    pub buffer_size: u32,

    /// Whether the engine may start producing sound without a user gesture
    pub autoplay_allowed: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            buffer_size: 512,
            autoplay_allowed: true,
        }
    }
}

/// Everything the player persists between sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerSettings {
    pub equalizer: EqualizerSettings,

    /// Route through the normalization compressor
    pub normalization: bool,

    /// Master volume in [0, 1]
    pub volume: f32,

    pub fade: FadeSettings,

    pub engine: EngineSettings,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            equalizer: EqualizerSettings::default(),
            normalization: false,
            volume: 1.0,
            fade: FadeSettings::default(),
            engine: EngineSettings::default(),
        }
    }
}

impl PlayerSettings {
    /// Create factory default settings
    pub fn factory_default() -> Self {
        Self::default()
    }

    /// Reject values the player cannot apply
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(ConfigError::Invalid(format!(
                "volume {} outside [0, 1]",
                self.volume
            )));
        }
        if let Some(gain) = self
            .equalizer
            .gains
            .iter()
            .find(|g| !(params::EQ_GAIN_MIN..=params::EQ_GAIN_MAX).contains(*g))
        {
            return Err(ConfigError::Invalid(format!(
                "equalizer gain {gain} dB outside [{}, {}]",
                params::EQ_GAIN_MIN,
                params::EQ_GAIN_MAX
            )));
        }
        if self.equalizer.preset != CUSTOM_PRESET && self.equalizer.preset().is_none() {
            return Err(ConfigError::UnknownPreset(self.equalizer.preset.clone()));
        }
        if !(self.fade.duration_secs.is_finite() && self.fade.duration_secs >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "fade duration {} must be non-negative",
                self.fade.duration_secs
            )));
        }
        if self.engine.sample_rate == 0 || self.engine.buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "sample rate and buffer size must be non-zero".to_string(),
            ));
        }
        if !(1..=8).contains(&self.engine.channels) {
            return Err(ConfigError::Invalid(format!(
                "{} output channels not supported",
                self.engine.channels
            )));
        }
        Ok(())
    }

    /// Load settings from a TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading settings");

        let contents = fs::read_to_string(path).await?;
        let settings: Self = toml::from_str(&contents)?;
        settings.validate()?;

        debug!("Settings loaded successfully");
        Ok(settings)
    }

    /// Save settings to a TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving settings");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        fs::write(path, toml_str).await?;

        debug!("Settings saved successfully");
        Ok(())
    }
}

/// Loads and saves `settings.toml` in the player's config directory
#[derive(Debug, Clone)]
pub struct SettingsStore {
    config_dir: PathBuf,
    settings_path: PathBuf,
}

impl SettingsStore {
    pub const FILE_NAME: &'static str = "settings.toml";

    pub fn new(config_dir: PathBuf) -> Self {
        let settings_path = config_dir.join(Self::FILE_NAME);
        Self {
            config_dir,
            settings_path,
        }
    }

    /// Get the default config directory path
    ///
    /// `~/.config/encore` on Linux, the platform equivalent elsewhere.
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("encore"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    /// Where a corrupt settings file is copied before it is replaced
    pub fn backup_path(&self) -> PathBuf {
        self.settings_path.with_extension("toml.corrupt")
    }

    /// Load settings
    ///
    /// A missing file yields (and writes) the factory default. A corrupt or
    /// invalid file is backed up and the factory default returned.
    #[instrument(skip(self))]
    pub async fn load(&self) -> PlayerSettings {
        if !self.settings_path.exists() {
            info!(
                path = %self.settings_path.display(),
                "Settings file not found, creating factory default"
            );

            let settings = PlayerSettings::factory_default();
            if let Err(e) = self.save(&settings).await {
                error!(
                    path = %self.settings_path.display(),
                    error = %e,
                    "Failed to save factory default settings"
                );
            }
            return settings;
        }

        match PlayerSettings::load_from_file(&self.settings_path).await {
            Ok(settings) => settings,
            Err(e) => {
                error!(
                    path = %self.settings_path.display(),
                    error = %e,
                    "Failed to load settings, using factory default"
                );

                let backup_path = self.backup_path();
                if let Err(copy_err) = fs::copy(&self.settings_path, &backup_path).await {
                    error!(
                        path = %backup_path.display(),
                        error = %copy_err,
                        "Failed to backup corrupt settings"
                    );
                }

                PlayerSettings::factory_default()
            }
        }
    }

    /// Validate and save settings
    #[instrument(skip(self, settings))]
    pub async fn save(&self, settings: &PlayerSettings) -> Result<()> {
        settings.validate()?;
        fs::create_dir_all(&self.config_dir).await?;
        settings.save_to_file(&self.settings_path).await
    }

    /// Delete the settings file
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<()> {
        if self.settings_path.exists() {
            fs::remove_file(&self.settings_path).await?;
            info!(
                path = %self.settings_path.display(),
                "Settings cleared"
            );
        }
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.settings_path.exists()
    }
}

/// File system watcher for settings hot-reload
pub struct SettingsWatcher {
    _watcher: notify::RecommendedWatcher,
    change_tx: broadcast::Sender<PathBuf>,
}

impl SettingsWatcher {
    /// Watch the store's settings file for changes
    pub async fn new(store: &SettingsStore) -> Result<Self> {
        use notify::Watcher;

        let (change_tx, _change_rx) = broadcast::channel(32);
        fs::create_dir_all(&store.config_dir).await?;

        let tx_clone = change_tx.clone();
        let file_name = store.settings_path.file_name().map(|n| n.to_os_string());
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let Ok(event) = res else {
                return;
            };
            if !matches!(
                event.kind,
                notify::EventKind::Create(_) | notify::EventKind::Modify(_)
            ) {
                return;
            }
            for path in event.paths {
                if path.file_name() == file_name.as_deref() {
                    if let Err(e) = tx_clone.send(path) {
                        debug!("No settings subscribers: {}", e);
                    }
                }
            }
        })?;

        watcher.watch(&store.config_dir, notify::RecursiveMode::NonRecursive)?;

        info!(
            path = %store.settings_path.display(),
            "Settings watcher started"
        );

        Ok(Self {
            _watcher: watcher,
            change_tx,
        })
    }

    /// Subscribe to settings change events
    pub fn subscribe(&self) -> broadcast::Receiver<PathBuf> {
        self.change_tx.subscribe()
    }
}
