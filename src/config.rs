//! Persisted tool and emulator settings.
//!
//! The file is a flat JSON object. Loading never fails: each key that is
//! missing or has the wrong type falls back to its built-in default.
use crate::paths::expand_home;
use crate::toolchain::find_tool;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// Disk format passed to the packager when none is configured.
pub const DEFAULT_DISK_FORMAT: &str = "einstein";
/// Emulated machine driver.
pub const DEFAULT_MACHINE: &str = "einstein";

/// Flat configuration record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    pub assembler: PathBuf,
    pub packager: PathBuf,
    pub working_dir: PathBuf,
    pub disk_format: String,
    pub emulator: PathBuf,
    pub system_disk: PathBuf,
    pub rom_path: PathBuf,
    pub machine: String,
    pub logs_dir: PathBuf,
    pub windowed: bool,
    pub software_video: bool,
    pub ui_active: bool,
    pub skip_intro: bool,
    pub resolution: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let desktop = dirs::desktop_dir().unwrap_or_else(|| home.join("Desktop"));
        let documents = dirs::document_dir().unwrap_or_else(|| home.join("Documents"));
        let (assembler, packager, emulator, rom_path) = if cfg!(windows) {
            let z88dk = home.join("z88dk").join("bin");
            (
                z88dk.join("z80asm.exe"),
                z88dk.join("z88dk-appmake.exe"),
                PathBuf::from("C:/Program Files/MAME/mame.exe"),
                home.join("MAME").join("roms"),
            )
        } else {
            (
                PathBuf::from("/usr/bin/z80asm"),
                PathBuf::from("/usr/bin/z88dk-appmake"),
                PathBuf::from("/usr/games/mame"),
                home.join(".mame").join("roms"),
            )
        };
        Self {
            assembler: find_tool("z80asm", &assembler),
            packager: find_tool("z88dk-appmake", &packager),
            working_dir: desktop,
            disk_format: DEFAULT_DISK_FORMAT.to_string(),
            emulator: find_tool("mame", &emulator),
            system_disk: documents.join("Disk Images").join("DOS80.DSK"),
            rom_path,
            machine: DEFAULT_MACHINE.to_string(),
            logs_dir: documents.join("Logs"),
            windowed: true,
            software_video: false,
            ui_active: true,
            skip_intro: true,
            resolution: String::new(),
        }
    }
}

impl AppConfig {
    /// Expand `~` in every path-valued key.
    fn expand_paths(mut self) -> Self {
        for path in [
            &mut self.assembler,
            &mut self.packager,
            &mut self.working_dir,
            &mut self.emulator,
            &mut self.system_disk,
            &mut self.rom_path,
            &mut self.logs_dir,
        ] {
            *path = expand_home(path);
        }
        self
    }
}

/// Default config location under the platform config directory.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("asmtodsk")
        .join("config.json")
}

/// Load the config, falling back to defaults per key.
pub fn load_config(path: &Path) -> AppConfig {
    let defaults = AppConfig::default();
    let stored = match fs::read(path) {
        Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                tracing::debug!(path = %path.display(), "config is not a JSON object; using defaults");
                return defaults;
            }
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "unparseable config; using defaults");
                return defaults;
            }
        },
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "no config; using defaults");
            return defaults;
        }
    };
    merge_over_defaults(defaults, &stored).expand_paths()
}

/// Persist the config as pretty JSON.
pub fn write_config(path: &Path, config: &AppConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let text = serde_json::to_string_pretty(config).context("serialize config")?;
    fs::write(path, text.as_bytes()).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

fn merge_over_defaults(defaults: AppConfig, stored: &Map<String, Value>) -> AppConfig {
    let Ok(Value::Object(mut merged)) = serde_json::to_value(&defaults) else {
        return defaults;
    };
    for (key, default_value) in merged.iter_mut() {
        let Some(value) = stored.get(key) else {
            continue;
        };
        if same_json_type(default_value, value) {
            *default_value = value.clone();
        } else {
            tracing::debug!(key = %key, "config value has wrong type; using default");
        }
    }
    serde_json::from_value(Value::Object(merged)).unwrap_or(defaults)
}

fn same_json_type(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::String(_), Value::String(_)) | (Value::Bool(_), Value::Bool(_))
    )
}
