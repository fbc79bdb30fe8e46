//! # Configuration Management Module
//!
//! User settings stored in a platform-appropriate location and exposed to the
//! engines as a reactive source. The core never caches a `Settings` value across
//! decisions: every decision point calls `SettingsHandle::current()`.
//!
//! ## Storage Location
//! - macOS: ~/Library/Application Support/zone-coach/config.toml
//! - Linux: ~/.config/zone-coach/config.toml
//! - Windows: %APPDATA%\zone-coach\config.toml
//!
//! ## Why TOML
//! Human-readable format allows manual editing of zones and tuning values.

use crate::error::ConfigError;
use crate::session::SessionPhase;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceStyle {
    Short,
    Detailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Treadmill,
    Outdoor,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Treadmill => "treadmill",
            RunMode::Outdoor => "outdoor",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedDevice {
    pub address: String,
    pub name: String,
}

/// Coaching product tuning. These are configuration values, not invariants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoachingTuning {
    /// Phases in which cues may be spoken
    pub eligible_phases: Vec<SessionPhase>,
    /// Generic high-HR cues are muted before this many session seconds
    pub warm_up_buffer_seconds: u64,
    /// Above `zone2_high + critical_offset_bpm` the warm-up mute is ignored
    pub critical_offset_bpm: u16,
    pub drift_after_seconds: u64,
    pub drift_margin_bpm: u16,
    pub drift_cooldown_seconds: u64,
    /// Session second at which the drift baseline is sampled
    pub baseline_capture_second: u64,
}

impl Default for CoachingTuning {
    fn default() -> Self {
        Self {
            eligible_phases: vec![SessionPhase::WarmUp, SessionPhase::Main],
            warm_up_buffer_seconds: 480,
            critical_offset_bpm: 15,
            drift_after_seconds: 1200,
            drift_margin_bpm: 12,
            drift_cooldown_seconds: 300,
            baseline_capture_second: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub max_hr: u16,
    pub zone2_low: u16,
    pub zone2_high: u16,
    pub cooldown_seconds: u64,
    pub persistence_high_seconds: u64,
    pub persistence_low_seconds: u64,
    pub voice_style: VoiceStyle,
    pub coaching_enabled: bool,
    pub warm_up_duration_seconds: u64,
    pub cool_down_duration_seconds: u64,
    pub run_mode: RunMode,
    pub split_announcements_enabled: bool,
    pub simulation_enabled: bool,
    pub active_device_address: Option<String>,
    pub saved_devices: Vec<SavedDevice>,
    pub coaching: CoachingTuning,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_hr: 190,
            zone2_low: 120,
            zone2_high: 140,
            cooldown_seconds: 75,
            persistence_high_seconds: 30,
            persistence_low_seconds: 45,
            voice_style: VoiceStyle::Detailed,
            coaching_enabled: true,
            warm_up_duration_seconds: 480,
            cool_down_duration_seconds: 180,
            run_mode: RunMode::Treadmill,
            split_announcements_enabled: true,
            simulation_enabled: false,
            active_device_address: None,
            saved_devices: Vec::new(),
            coaching: CoachingTuning::default(),
        }
    }
}

impl Settings {
    /// Get the path to the config file
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("zone-coach")
            .join("config.toml")
    }

    /// Load settings from `path`, or create and save defaults if it doesn't exist
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let settings = toml::from_str(&contents).map_err(ConfigError::ParseFailed)?;
                Ok(settings)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let settings = Self::default();
                settings.save_to(path)?;
                Ok(settings)
            }
            Err(e) => Err(ConfigError::ReadFailed(e)),
        }
    }

    /// Save settings to `path`
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::WriteFailed)?;
        }

        let toml_string = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        fs::write(path, toml_string).map_err(ConfigError::WriteFailed)?;

        Ok(())
    }

    /// Remember a device with a verified heart rate service and make it the active one
    pub fn remember_device(&mut self, address: &str, name: &str) {
        self.saved_devices.retain(|d| d.address != address);
        self.saved_devices.push(SavedDevice {
            address: address.to_string(),
            name: name.to_string(),
        });
        self.active_device_address = Some(address.to_string());
    }

    pub fn phase_duration_seconds(&self, phase: SessionPhase) -> Option<u64> {
        match phase {
            SessionPhase::WarmUp => Some(self.warm_up_duration_seconds),
            SessionPhase::Main => None,
            SessionPhase::CoolDown => Some(self.cool_down_duration_seconds),
        }
    }
}

/// Reactive, shareable settings source.
///
/// Backed by a `watch` channel so updates replace the whole value at once and
/// readers always see a complete `Settings`.
#[derive(Clone)]
pub struct SettingsHandle {
    sender: Arc<watch::Sender<Settings>>,
    path: Option<Arc<PathBuf>>,
}

impl SettingsHandle {
    pub fn in_memory(settings: Settings) -> Self {
        let (sender, _) = watch::channel(settings);
        Self {
            sender: Arc::new(sender),
            path: None,
        }
    }

    /// File-backed handle; updates are written through to `path`.
    pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        let settings = Settings::load_from(&path)?;
        let (sender, _) = watch::channel(settings);
        Ok(Self {
            sender: Arc::new(sender),
            path: Some(Arc::new(path)),
        })
    }

    pub fn current(&self) -> Settings {
        self.sender.borrow().clone()
    }

    pub fn update<F>(&self, modify: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut Settings),
    {
        self.sender.send_modify(modify);
        if let Some(path) = &self.path {
            self.current().save_to(path)?;
        }
        Ok(())
    }

    pub fn save_device(&self, address: &str, name: &str) -> Result<(), ConfigError> {
        self.update(|s| s.remember_device(address, name))
    }
}
