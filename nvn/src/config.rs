// SPDX-FileCopyrightText: 2025 nvn-rs contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use ini::Ini;
use log::{debug, info, warn};
use nvn_common::settings::{DeviceSettings, QueuePriority, ValidationLevel};
use std::path::{Path, PathBuf};
use thiserror::Error;

const CONFIG_DIR: &str = "nvn";
const CONFIG_FILE: &str = "config.ini";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("[{section}] {key}: invalid number {value:?}")]
    InvalidNumber {
        section: &'static str,
        key: String,
        value: String,
    },
    #[error("[{section}] {key}: invalid boolean {value:?}")]
    InvalidBool {
        section: &'static str,
        key: String,
        value: String,
    },
    #[error("[{section}] unknown key {key:?}")]
    UnknownKey { section: &'static str, key: String },
}

/// Locate the config file: `$NVN_CONFIG`, then
/// `$XDG_CONFIG_HOME/nvn/config.ini`, then `~/.config/nvn/config.ini`.
pub fn find_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("NVN_CONFIG") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
        warn!("NVN_CONFIG points to a missing file: {}", path.display());
    }

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(&xdg).join(CONFIG_DIR).join(CONFIG_FILE);
        if path.exists() {
            return Some(path);
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let path = PathBuf::from(&home).join(".config").join(CONFIG_DIR).join(CONFIG_FILE);
        if path.exists() {
            return Some(path);
        }
    }

    None
}

/// Load device settings. Missing files, unreadable files and bad values
/// fall back to defaults with a warning.
pub fn load_config(path: Option<&PathBuf>) -> DeviceSettings {
    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                warn!("Config file not found: {}", p.display());
                return DeviceSettings::default();
            }
            p.clone()
        }
        None => match find_config_path() {
            Some(p) => p,
            None => {
                info!("No config found, using defaults");
                return DeviceSettings::default();
            }
        },
    };

    info!("Loading config from: {}", config_path.display());
    match Ini::load_from_file(&config_path) {
        Ok(conf) => settings_from_ini(&conf, &config_path),
        Err(e) => {
            warn!("Failed to parse config: {}", e);
            DeviceSettings::default()
        }
    }
}

/// Apply every recognized key in `conf` over the defaults.
pub fn settings_from_ini(conf: &Ini, origin: &Path) -> DeviceSettings {
    let mut settings = DeviceSettings::default();
    let report = |result: Result<(), ConfigError>| {
        if let Err(e) = result {
            warn!("{}: {}", origin.display(), e);
        }
    };

    // [Device]
    if let Some(section) = conf.section(Some("Device")) {
        for (key, value) in section.iter() {
            report(match key {
                "validation" => {
                    settings.validation = ValidationLevel::from_str_or_default(value);
                    Ok(())
                }
                "gpu_timeout_ms" => parse_u64("Device", key, value).map(|v| settings.gpu_timeout_ms = v),
                "finalize_age" => parse_u64("Device", key, value).map(|v| settings.finalize_age = v as u32),
                _ => Err(unknown("Device", key)),
            });
        }
        debug!("Validation: {:?}", settings.validation);
    }

    // [Queue]
    if let Some(section) = conf.section(Some("Queue")) {
        for (key, value) in section.iter() {
            report(match key {
                "command_memory_size" => {
                    parse_u64("Queue", key, value).map(|v| settings.queue_command_memory_size = v)
                }
                "compute_memory_size" => {
                    parse_u64("Queue", key, value).map(|v| settings.queue_compute_memory_size = v)
                }
                "control_memory_size" => {
                    parse_u64("Queue", key, value).map(|v| settings.queue_control_memory_size = v)
                }
                "flush_threshold" => parse_u64("Queue", key, value).map(|v| settings.queue_flush_threshold = v),
                "priority" => {
                    settings.queue_priority = QueuePriority::from_str_or_default(value);
                    Ok(())
                }
                _ => Err(unknown("Queue", key)),
            });
        }
        debug!("Queue priority: {:?}", settings.queue_priority);
    }

    // [Debug]
    if let Some(section) = conf.section(Some("Debug")) {
        for (key, value) in section.iter() {
            report(match key {
                "log_commands" => parse_bool("Debug", key, value).map(|v| settings.log_commands = v),
                _ => Err(unknown("Debug", key)),
            });
        }
    }

    settings
}

fn unknown(section: &'static str, key: &str) -> ConfigError {
    ConfigError::UnknownKey {
        section,
        key: key.to_string(),
    }
}

/// Decimal or `0x`-prefixed hexadecimal.
fn parse_u64(section: &'static str, key: &str, value: &str) -> Result<u64, ConfigError> {
    let v = value.trim();
    let parsed = match v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => v.replace('_', "").parse(),
    };
    parsed.map_err(|_| ConfigError::InvalidNumber {
        section,
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(section: &'static str, key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            section,
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(text: &str) -> DeviceSettings {
        let conf = Ini::load_from_str(text).unwrap();
        settings_from_ini(&conf, Path::new("test.ini"))
    }

    #[test]
    fn test_empty_config_is_default() {
        let s = load("");
        let d = DeviceSettings::default();
        assert_eq!(s.queue_command_memory_size, d.queue_command_memory_size);
        assert_eq!(s.validation, ValidationLevel::Off);
    }

    #[test]
    fn test_all_sections() {
        let s = load(
            "[Device]\nvalidation = strict\ngpu_timeout_ms = 250\nfinalize_age = 3\n\
             [Queue]\ncommand_memory_size = 0x2_0000\nflush_threshold = 4096\npriority = high\n\
             [Debug]\nlog_commands = true\n",
        );
        assert_eq!(s.validation, ValidationLevel::Strict);
        assert_eq!(s.gpu_timeout_ms, 250);
        assert_eq!(s.finalize_age, 3);
        assert_eq!(s.queue_command_memory_size, 0x2_0000);
        assert_eq!(s.queue_flush_threshold, 4096);
        assert_eq!(s.queue_priority, QueuePriority::High);
        assert!(s.log_commands);
    }

    #[test]
    fn test_bad_values_fall_back() {
        let s = load("[Queue]\ncontrol_memory_size = lots\nbogus = 1\n[Debug]\nlog_commands = maybe\n");
        let d = DeviceSettings::default();
        assert_eq!(s.queue_control_memory_size, d.queue_control_memory_size);
        assert!(!s.log_commands);
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_u64("Queue", "k", " 0x10 ").unwrap(), 16);
        assert_eq!(parse_u64("Queue", "k", "1_000").unwrap(), 1000);
        assert!(matches!(
            parse_u64("Queue", "k", "-1"),
            Err(ConfigError::InvalidNumber { section: "Queue", .. })
        ));
        assert!(parse_bool("Debug", "k", "ON").unwrap());
        assert!(!parse_bool("Debug", "k", "0").unwrap());
    }

    #[test]
    fn test_missing_explicit_path_uses_defaults() {
        let path = PathBuf::from("/nonexistent/nvn/config.ini");
        let s = load_config(Some(&path));
        assert_eq!(s.gpu_timeout_ms, DeviceSettings::default().gpu_timeout_ms);
    }
}
