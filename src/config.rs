use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub switch: SwitchConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
}

/// Connection to the switch's control interface
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SwitchConfig {
    /// REST base, e.g. `http://localhost:5039/ari`
    pub base_url: String,
    /// Event websocket, e.g. `ws://localhost:5039/ari/events`
    pub ws_url: String,
    pub username: String,
    pub password: String,
    /// Name of the controlling application
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

fn default_app_name() -> String {
    "callcontrol".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_reconnect_delay_ms() -> u64 {
    2000
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// JSON document on local disk
    File,
    /// Switch global variables
    Switch,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::File,
            path: "./data/transfers.json".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9500,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TransferConfig {
    /// Global state lock wait before giving up
    pub lock_timeout_ms: u64,
    /// Hold music class played to the transferred party
    pub moh_class: String,
    /// Ring timeout used when a request gives none; `None` rings forever
    #[serde(default)]
    pub default_timeout_secs: Option<u32>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 10_000,
            moh_class: "default".to_string(),
            default_timeout_secs: None,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", config_path))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }
}
