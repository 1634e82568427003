use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::history::MatchMode;

pub const APP_DIR: &str = "data/clipcapsule";
pub const DB_NAME: &str = "cliphistory.db";
pub const CONFIG_FILE: &str = "config.json";

const MIN_POLL_MS: u64 = 50;
const MAX_CAPTURE_DELAY_MS: u64 = 2000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_path: Option<String>,
    pub keyboard_device: Option<String>,
    pub watch_clipboard: bool,
    pub capture_hotkey: bool,
    pub clipboard_poll_ms: u64,
    pub capture_delay_ms: u64,
    pub match_mode: MatchMode,
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            keyboard_device: None,
            watch_clipboard: true,
            capture_hotkey: false,
            clipboard_poll_ms: 250,
            capture_delay_ms: 150,
            match_mode: MatchMode::Exact,
            log_filter: "info".to_string(),
        }
    }
}

impl Config {
    pub fn resolve_db_path(&self, base_dir: &Path) -> PathBuf {
        match self.db_path.as_ref() {
            Some(path) => PathBuf::from(path),
            None => base_dir.join(DB_NAME),
        }
    }
}

#[derive(Debug, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub db_path: Option<String>,
    pub keyboard_device: Option<String>,
    pub watch_clipboard: Option<bool>,
    pub capture_hotkey: Option<bool>,
    pub clipboard_poll_ms: Option<u64>,
}

pub fn load_config(base_dir: &Path, overrides: &CliOverrides) -> Result<Config> {
    let config_path = overrides
        .config_path
        .clone()
        .unwrap_or_else(|| base_dir.join(CONFIG_FILE));
    let mut config = load_or_create_config(&config_path)?;
    apply_overrides(&mut config, overrides);
    Ok(normalize_config(config))
}

pub fn load_or_create_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let contents = fs::read_to_string(path).context("Failed to read config file")?;
        let user_value: Value = serde_json::from_str(&contents).context("Failed to parse config file")?;
        return refresh_config_defaults(&user_value);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create config directory")?;
    }
    let config = Config::default();
    let payload = serde_json::to_string_pretty(&config).context("Failed to serialize config")?;
    fs::write(path, payload).context("Failed to write config file")?;
    Ok(config)
}

pub fn apply_overrides(config: &mut Config, overrides: &CliOverrides) {
    if let Some(db_path) = overrides.db_path.clone() {
        config.db_path = Some(db_path);
    }
    if let Some(device) = overrides.keyboard_device.clone() {
        config.keyboard_device = Some(device);
    }
    if let Some(watch) = overrides.watch_clipboard {
        config.watch_clipboard = watch;
    }
    if let Some(capture) = overrides.capture_hotkey {
        config.capture_hotkey = capture;
    }
    if let Some(poll_ms) = overrides.clipboard_poll_ms {
        config.clipboard_poll_ms = poll_ms;
    }
}

pub fn normalize_config(mut config: Config) -> Config {
    config.clipboard_poll_ms = config.clipboard_poll_ms.max(MIN_POLL_MS);
    config.capture_delay_ms = config.capture_delay_ms.min(MAX_CAPTURE_DELAY_MS);
    if let Some(path) = config.db_path.as_ref() {
        if path.trim().is_empty() {
            config.db_path = None;
        }
    }
    if let Some(device) = config.keyboard_device.as_ref() {
        if device.trim().is_empty() {
            config.keyboard_device = None;
        }
    }
    if config.log_filter.trim().is_empty() {
        config.log_filter = Config::default().log_filter;
    }
    config
}

/// Fills keys missing from an older config file with current defaults.
fn refresh_config_defaults(user_value: &Value) -> Result<Config> {
    let mut default_value =
        serde_json::to_value(Config::default()).context("Failed to serialize default config")?;
    merge_config_value(&mut default_value, user_value);
    serde_json::from_value(default_value).context("Failed to merge config defaults")
}

fn merge_config_value(target: &mut Value, source: &Value) {
    match (target, source) {
        (Value::Object(target_map), Value::Object(source_map)) => {
            for (key, value) in source_map {
                match target_map.get_mut(key) {
                    Some(existing) => merge_config_value(existing, value),
                    None => {
                        target_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target_value, source_value) => {
            *target_value = source_value.clone();
        }
    }
}
