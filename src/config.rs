use axum::http::HeaderValue;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const MIN_NETWORK_WINDOW: Duration = Duration::from_millis(100);
const MIN_CPU_WINDOW: Duration = Duration::from_millis(200);
const MAX_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_window", with = "duration_str")]
    pub network_window: Duration,
    #[serde(default = "default_window", with = "duration_str")]
    pub cpu_window: Duration,
    #[serde(default = "default_root_mount")]
    pub root_mount: String,
    #[serde(default = "default_cors_allow_origin")]
    pub cors_allow_origin: String,
    #[serde(default)]
    pub gpu: GpuConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GpuConfig {
    #[serde(default = "default_gpu_enabled")]
    pub enabled: bool,
    #[serde(default = "default_nvidia_smi")]
    pub nvidia_smi: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            network_window: default_window(),
            cpu_window: default_window(),
            root_mount: default_root_mount(),
            cors_allow_origin: default_cors_allow_origin(),
            gpu: GpuConfig::default(),
        }
    }
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            enabled: default_gpu_enabled(),
            nvidia_smi: default_nvidia_smi(),
        }
    }
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
        if !(MIN_NETWORK_WINDOW..=MAX_WINDOW).contains(&self.network_window) {
            return Err(ConfigError::Validation(
                "network_window должно быть в диапазоне 100ms..60s".to_string(),
            ));
        }
        if !(MIN_CPU_WINDOW..=MAX_WINDOW).contains(&self.cpu_window) {
            return Err(ConfigError::Validation(
                "cpu_window должно быть в диапазоне 200ms..60s".to_string(),
            ));
        }
        if self.root_mount.trim().is_empty() {
            return Err(ConfigError::Validation(
                "root_mount не должен быть пустым".to_string(),
            ));
        }
        if HeaderValue::from_str(&self.cors_allow_origin).is_err() {
            return Err(ConfigError::Validation(format!(
                "cors_allow_origin '{}' не является корректным значением заголовка",
                self.cors_allow_origin
            )));
        }
        if self.gpu.enabled && self.gpu.nvidia_smi.trim().is_empty() {
            return Err(ConfigError::Validation(
                "gpu.nvidia_smi не должен быть пустым при gpu.enabled".to_string(),
            ));
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        SocketAddr::from_str(&self.listen).map_err(|err| {
            ConfigError::Validation(format!("некорректный адрес listen '{}': {err}", self.listen))
        })
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}

fn default_listen() -> String {
    "0.0.0.0:5000".to_string()
}

const fn default_window() -> Duration {
    Duration::from_secs(1)
}

fn default_root_mount() -> String {
    if cfg!(target_os = "windows") {
        r"C:\".to_string()
    } else {
        "/".to_string()
    }
}

fn default_cors_allow_origin() -> String {
    "*".to_string()
}

const fn default_gpu_enabled() -> bool {
    true
}

fn default_nvidia_smi() -> String {
    "nvidia-smi".to_string()
}
