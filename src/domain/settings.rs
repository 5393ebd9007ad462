use crate::domain::profile::{DEFAULT_NAME_PREFIX, SERVICE_START_DELAY_MS};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "warn".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "microbit_link".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Discovery
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,

    // Service activation
    #[serde(default = "default_service_start_delay_ms")]
    pub service_start_delay_ms: u64,
    #[serde(default = "default_true")]
    pub auto_start_services: bool,

    // Monitor output
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,
    #[serde(default = "default_monitor_duration_ms")]
    pub monitor_duration_ms: u64,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            name_prefix: default_name_prefix(),
            scan_timeout_ms: default_scan_timeout_ms(),
            service_start_delay_ms: default_service_start_delay_ms(),
            auto_start_services: default_true(),
            report_interval_ms: default_report_interval_ms(),
            monitor_duration_ms: default_monitor_duration_ms(),
            log_settings: LogSettings::default(),
        }
    }
}

fn default_name_prefix() -> String {
    DEFAULT_NAME_PREFIX.to_string()
}
fn default_scan_timeout_ms() -> u64 {
    10_000
}
fn default_service_start_delay_ms() -> u64 {
    SERVICE_START_DELAY_MS
}
fn default_report_interval_ms() -> u64 {
    1000
}
fn default_monitor_duration_ms() -> u64 {
    10_000
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::load(settings_path))
    }

    /// Load from an explicit path, falling back to defaults
    pub fn load(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {:#}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("MicrobitLink");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(dir) = self.settings_path.parent() {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let settings: Settings = serde_json::from_str(r#"{ "name_prefix": "BBC" }"#).unwrap();
        assert_eq!(settings.name_prefix, "BBC");
        assert_eq!(settings.service_start_delay_ms, 300);
        assert!(settings.auto_start_services);
        assert_eq!(settings.log_settings.rotation, "daily");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join(format!("microbit_link_settings_{}", std::process::id()));
        let path = dir.join("settings.json");

        let mut service = SettingsService::load(path.clone());
        service.get_mut().service_start_delay_ms = 500;
        service.save().unwrap();

        let reloaded = SettingsService::load(path.clone());
        assert_eq!(reloaded.path(), path.as_path());
        assert_eq!(reloaded.get().service_start_delay_ms, 500);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_missing_file_falls_back() {
        let service = SettingsService::load(PathBuf::from("/nonexistent/microbit/settings.json"));
        assert_eq!(service.get().name_prefix, DEFAULT_NAME_PREFIX);
    }
}
