use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::nes::joypad::{
    BUTTON_A, BUTTON_B, BUTTON_DOWN, BUTTON_LEFT, BUTTON_RIGHT, BUTTON_SELECT, BUTTON_START,
    BUTTON_UP,
};

pub const CONFIG_FILE_NAME: &str = "famicore.json";
pub const MIN_SCALE: u8 = 1;
pub const MAX_SCALE: u8 = 3;

/// One key name per controller button, spelled the way egui names keys
/// (`ArrowUp`, `Z`, `Enter`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyBindings {
    pub up: String,
    pub down: String,
    pub left: String,
    pub right: String,
    pub a: String,
    pub b: String,
    pub select: String,
    pub start: String,
}

impl Default for KeyBindings {
    fn default() -> Self {
        Self {
            up: "ArrowUp".to_string(),
            down: "ArrowDown".to_string(),
            left: "ArrowLeft".to_string(),
            right: "ArrowRight".to_string(),
            a: "Z".to_string(),
            b: "X".to_string(),
            select: "A".to_string(),
            start: "S".to_string(),
        }
    }
}

impl KeyBindings {
    /// Key name and joypad bit for every button.
    pub fn buttons(&self) -> [(&str, u8); 8] {
        [
            (self.up.as_str(), BUTTON_UP),
            (self.down.as_str(), BUTTON_DOWN),
            (self.left.as_str(), BUTTON_LEFT),
            (self.right.as_str(), BUTTON_RIGHT),
            (self.a.as_str(), BUTTON_A),
            (self.b.as_str(), BUTTON_B),
            (self.select.as_str(), BUTTON_SELECT),
            (self.start.as_str(), BUTTON_START),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub scale: u8,
    pub interpolate: bool,
    pub audio_enabled: bool,
    pub key_bindings: KeyBindings,
    pub last_rom_dir: Option<PathBuf>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            scale: 2,
            interpolate: false,
            audio_enabled: true,
            key_bindings: KeyBindings::default(),
            last_rom_dir: None,
        }
    }
}

impl EmulatorConfig {
    /// Reads the config at `path`, falling back to defaults when the file
    /// does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("malformed config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let text = serde_json::to_string_pretty(self).context("failed to encode config")?;
        fs::write(path, text).with_context(|| format!("failed to write config {}", path.display()))
    }

    pub fn set_scale(&mut self, scale: u8) {
        self.scale = scale.clamp(MIN_SCALE, MAX_SCALE);
    }

    fn validate(&self) -> Result<()> {
        if !(MIN_SCALE..=MAX_SCALE).contains(&self.scale) {
            bail!(
                "scale must be between {MIN_SCALE} and {MAX_SCALE}, got {}",
                self.scale
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("famicore-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn missing_file_yields_defaults() {
        let path = scratch_path("does-not-exist.json");
        let _ = fs::remove_file(&path);
        let config = EmulatorConfig::load_or_default(&path).unwrap();
        assert_eq!(config, EmulatorConfig::default());
        assert_eq!(config.key_bindings.a, "Z");
        assert_eq!(config.key_bindings.start, "S");
    }

    #[test]
    fn save_then_load_keeps_changes() {
        let path = scratch_path("saved.json");
        let mut config = EmulatorConfig::default();
        config.set_scale(3);
        config.audio_enabled = false;
        config.key_bindings.start = "Enter".to_string();
        config.last_rom_dir = Some(PathBuf::from("/roms"));
        config.save(&path).unwrap();

        let loaded = EmulatorConfig::load_or_default(&path).unwrap();
        assert_eq!(loaded, config);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn partial_file_fills_missing_fields() {
        let path = scratch_path("partial.json");
        fs::write(&path, r#"{ "scale": 1, "key_bindings": { "a": "K" } }"#).unwrap();
        let config = EmulatorConfig::load_or_default(&path).unwrap();
        assert_eq!(config.scale, 1);
        assert!(config.audio_enabled);
        assert_eq!(config.key_bindings.a, "K");
        assert_eq!(config.key_bindings.b, "X");
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn malformed_json_is_an_error() {
        let path = scratch_path("broken.json");
        fs::write(&path, "{ scale: ").unwrap();
        let err = EmulatorConfig::load_or_default(&path).unwrap_err();
        assert!(format!("{err:#}").contains("malformed config"));
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn out_of_range_scale_is_rejected() {
        let path = scratch_path("scale.json");
        fs::write(&path, r#"{ "scale": 7 }"#).unwrap();
        assert!(EmulatorConfig::load_or_default(&path).is_err());
        fs::remove_file(&path).unwrap();

        let mut config = EmulatorConfig::default();
        config.set_scale(9);
        assert_eq!(config.scale, MAX_SCALE);
        config.set_scale(0);
        assert_eq!(config.scale, MIN_SCALE);
    }

    #[test]
    fn bindings_cover_every_button_once() {
        let bits = KeyBindings::default()
            .buttons()
            .iter()
            .fold(0u8, |acc, (_, bit)| {
                assert_eq!(acc & bit, 0);
                acc | bit
            });
        assert_eq!(bits, 0xFF);
    }
}
