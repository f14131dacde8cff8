use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MonitorConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_store_location")]
    pub store_location: PathBuf,
    #[serde(default = "default_enabled")]
    pub enable_memory: bool,
    #[serde(default = "default_enabled")]
    pub enable_cpu: bool,
    #[serde(default = "default_enabled")]
    pub enable_disk: bool,
    #[serde(default = "default_enabled")]
    pub enable_process_manager: bool,
    #[serde(default = "default_max_records")]
    pub max_records: Option<u64>,
    #[serde(default = "default_disk_paths")]
    pub disk_paths: Vec<PathBuf>,
    #[serde(default = "default_process_manager_command")]
    pub process_manager_command: String,
    #[serde(default = "default_enabled")]
    pub scan_top_folders: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            store_location: default_store_location(),
            enable_memory: true,
            enable_cpu: true,
            enable_disk: true,
            enable_process_manager: true,
            max_records: default_max_records(),
            disk_paths: default_disk_paths(),
            process_manager_command: default_process_manager_command(),
            scan_top_folders: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigPatch {
    pub interval_ms: Option<u64>,
    pub store_location: Option<PathBuf>,
    pub enable_memory: Option<bool>,
    pub enable_cpu: Option<bool>,
    pub enable_disk: Option<bool>,
    pub enable_process_manager: Option<bool>,
    pub max_records: Option<u64>,
    pub disk_paths: Option<Vec<PathBuf>>,
    pub process_manager_command: Option<String>,
    pub scan_top_folders: Option<bool>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;
        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation(
                "поле listen обязательно".to_string(),
            ));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "поле listen должно быть корректным адресом host:port".to_string(),
            ));
        }
        self.monitor.validate()
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms < 1 {
            return Err(ConfigError::Validation(
                "monitor.interval_ms должно быть >= 1".to_string(),
            ));
        }
        if self.store_location.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "monitor.store_location не должен быть пустым".to_string(),
            ));
        }
        if self.enable_disk && self.disk_paths.is_empty() {
            return Err(ConfigError::Validation(
                "monitor.disk_paths должен содержать хотя бы один путь".to_string(),
            ));
        }
        if self
            .disk_paths
            .iter()
            .any(|p| p.as_os_str().is_empty())
        {
            return Err(ConfigError::Validation(
                "monitor.disk_paths[*] не должен быть пустым".to_string(),
            ));
        }
        if self.enable_process_manager && self.process_manager_command.trim().is_empty() {
            return Err(ConfigError::Validation(
                "monitor.process_manager_command не должен быть пустым".to_string(),
            ));
        }
        Ok(())
    }

    pub fn apply(&self, patch: ConfigPatch) -> Result<MonitorConfig, ConfigError> {
        let mut next = self.clone();
        if let Some(v) = patch.interval_ms {
            next.interval_ms = v;
        }
        if let Some(v) = patch.store_location {
            next.store_location = v;
        }
        if let Some(v) = patch.enable_memory {
            next.enable_memory = v;
        }
        if let Some(v) = patch.enable_cpu {
            next.enable_cpu = v;
        }
        if let Some(v) = patch.enable_disk {
            next.enable_disk = v;
        }
        if let Some(v) = patch.enable_process_manager {
            next.enable_process_manager = v;
        }
        if let Some(v) = patch.max_records {
            next.max_records = (v > 0).then_some(v);
        }
        if let Some(v) = patch.disk_paths {
            next.disk_paths = v;
        }
        if let Some(v) = patch.process_manager_command {
            next.process_manager_command = v;
        }
        if let Some(v) = patch.scan_top_folders {
            next.scan_top_folders = v;
        }
        next.validate()?;
        Ok(next)
    }
}

const fn default_interval_ms() -> u64 {
    60_000
}

fn default_store_location() -> PathBuf {
    PathBuf::from("server-monitor.db")
}

const fn default_enabled() -> bool {
    true
}

const fn default_max_records() -> Option<u64> {
    Some(10_000)
}

fn default_disk_paths() -> Vec<PathBuf> {
    vec![PathBuf::from("/")]
}

fn default_process_manager_command() -> String {
    "pm2".to_string()
}
