use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::app::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolSettings {
    pub adb_path: String,
    pub tidevice_path: String,
    pub idevice_id_path: String,
    pub idevicediagnostics_path: String,
    /// Directory holding bundled `windows/`, `mac/` and `linux/` adb builds.
    pub bundled_tools_dir: String,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            adb_path: String::new(),
            tidevice_path: "tidevice".to_string(),
            idevice_id_path: "idevice_id".to_string(),
            idevicediagnostics_path: "idevicediagnostics".to_string(),
            bundled_tools_dir: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CommandSettings {
    pub default_timeout_secs: u64,
    pub install_timeout_secs: u64,
    pub uninstall_timeout_secs: u64,
    pub transfer_timeout_secs: u64,
    pub push_timeout_secs: u64,
    pub retry_count: u32,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            default_timeout_secs: 60,
            install_timeout_secs: 300,
            uninstall_timeout_secs: 180,
            transfer_timeout_secs: 180,
            push_timeout_secs: 300,
            retry_count: 3,
        }
    }
}

impl CommandSettings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn uninstall_timeout(&self) -> Duration {
        Duration::from_secs(self.uninstall_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceSettings {
    /// API level where `ps -A`, the 9-field `top` summary and usagestats-first activity lookup begin.
    pub legacy_sdk_threshold: u32,
    pub abi_list_sdk_threshold: u32,
    /// Reported when `ro.build.version.sdk` is unreadable.
    pub fallback_sdk: u32,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            legacy_sdk_threshold: 26,
            abi_list_sdk_threshold: 21,
            fallback_sdk: 25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetrySettings {
    pub dump_dir: String,
    pub max_dump_file_mb: u64,
    pub download_dir: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            dump_dir: String::new(),
            max_dump_file_mb: 100,
            download_dir: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IosSettings {
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub port_step: u16,
    pub pool_capacity: usize,
    pub relay_timeout_secs: u64,
}

impl Default for IosSettings {
    fn default() -> Self {
        Self {
            port_range_start: 10600,
            port_range_end: 11000,
            port_step: 5,
            pool_capacity: 100,
            relay_timeout_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteEnvVar {
    pub env_name: String,
    pub env_value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteSettings {
    pub agent_port: u16,
    pub env: String,
    pub env_vars: Vec<RemoteEnvVar>,
    pub request_timeout_secs: u64,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            agent_port: 6821,
            env: "base".to_string(),
            env_vars: vec![RemoteEnvVar {
                env_name: "JAVA_HOME".to_string(),
                env_value: "/root/jdk1.8.0_281".to_string(),
            }],
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub log_level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct KitConfig {
    #[serde(default)]
    pub tools: ToolSettings,
    #[serde(default)]
    pub command: CommandSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
    #[serde(default)]
    pub ios: IosSettings,
    #[serde(default)]
    pub remote: RemoteSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl KitConfig {
    pub fn dump_dir(&self) -> PathBuf {
        resolve_dir(&self.telemetry.dump_dir, "dumps")
    }

    pub fn download_dir(&self) -> PathBuf {
        resolve_dir(&self.telemetry.download_dir, "downloads")
    }

    pub fn max_dump_file_bytes(&self) -> u64 {
        self.telemetry.max_dump_file_mb.saturating_mul(1024 * 1024)
    }
}

fn resolve_dir(configured: &str, leaf: &str) -> PathBuf {
    let trimmed = configured.trim();
    if !trimmed.is_empty() {
        return PathBuf::from(trimmed);
    }
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("mdevice")
        .join(leaf)
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("MDEVICE_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mdevice_config.json")
}

pub fn backup_config_path(path: &Path) -> PathBuf {
    path.with_extension("backup.json")
}

pub fn load_config() -> Result<KitConfig, AppError> {
    load_config_from_path(&config_path())
}

pub fn save_config(config: &KitConfig) -> Result<(), AppError> {
    let path = config_path();
    save_config_to_path(config, &path, &backup_config_path(&path))
}

pub fn load_config_from_path(path: &Path) -> Result<KitConfig, AppError> {
    if !path.exists() {
        return Ok(KitConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), ""))?;
    let config: KitConfig = serde_json::from_str(&raw)
        .map_err(|err| AppError::system(format!("Failed to parse config: {err}"), ""))?;
    Ok(validate_config(config))
}

pub fn save_config_to_path(
    config: &KitConfig,
    path: &Path,
    backup_path: &Path,
) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        if let Err(err) = fs::create_dir_all(parent) {
            warn!(path = %parent.display(), error = %err, "failed to create config dir");
        }
    }
    if path.exists() {
        if let Err(err) = fs::copy(path, backup_path) {
            warn!(backup = %backup_path.display(), error = %err, "failed to back up config");
        }
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), ""))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), ""))?;
    Ok(())
}

pub(crate) fn validate_config(mut config: KitConfig) -> KitConfig {
    let defaults = KitConfig::default();
    if config.command.default_timeout_secs == 0 {
        config.command.default_timeout_secs = defaults.command.default_timeout_secs;
    }
    if config.command.install_timeout_secs < config.command.default_timeout_secs {
        config.command.install_timeout_secs = defaults.command.install_timeout_secs;
    }
    if config.command.uninstall_timeout_secs == 0 {
        config.command.uninstall_timeout_secs = defaults.command.uninstall_timeout_secs;
    }
    if config.command.transfer_timeout_secs == 0 {
        config.command.transfer_timeout_secs = defaults.command.transfer_timeout_secs;
    }
    if config.command.push_timeout_secs == 0 {
        config.command.push_timeout_secs = defaults.command.push_timeout_secs;
    }
    if config.command.retry_count == 0 || config.command.retry_count > 10 {
        config.command.retry_count = defaults.command.retry_count;
    }
    if config.device.legacy_sdk_threshold == 0 {
        config.device.legacy_sdk_threshold = defaults.device.legacy_sdk_threshold;
    }
    if config.telemetry.max_dump_file_mb == 0 {
        config.telemetry.max_dump_file_mb = defaults.telemetry.max_dump_file_mb;
    }
    if config.ios.port_step == 0 {
        config.ios.port_step = defaults.ios.port_step;
    }
    if config.ios.port_range_end <= config.ios.port_range_start {
        config.ios.port_range_start = defaults.ios.port_range_start;
        config.ios.port_range_end = defaults.ios.port_range_end;
    }
    if config.ios.pool_capacity == 0 {
        config.ios.pool_capacity = defaults.ios.pool_capacity;
    }
    if config.remote.agent_port == 0 {
        config.remote.agent_port = defaults.remote.agent_port;
    }
    config
}
