use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub packaging: PackagingConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub web: WebConfig,
}

/// HTTP gateway configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    /// Gateway bind address
    pub address: String,
    /// Gateway port
    pub port: u16,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database URL
    #[serde(default = "default_db_url")]
    pub url: String,
    /// Connection pool max size
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Automatic migration on startup
    #[serde(default = "default_true")]
    pub auto_migrate: bool,
}

fn default_db_url() -> String {
    "sqlite://streams.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

/// RTMP ingest configuration. Each session listens on `base_port + (id - 1)`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    pub address: String,
    pub base_port: u16,
    /// RTMP application name publishers connect to
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// Host name printed in ingest and playback URLs
    #[serde(default = "default_public_host")]
    pub public_host: String,
}

fn default_app_name() -> String {
    "live".to_string()
}

fn default_public_host() -> String {
    "localhost".to_string()
}

/// HTTP-FLV packaging configuration. Each session listens on `base_port + (id - 1)`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PackagingConfig {
    pub address: String,
    pub base_port: u16,
    /// Buffered media tags per viewer before the viewer starts lagging
    #[serde(default = "default_tag_buffer")]
    pub tag_buffer: usize,
}

fn default_tag_buffer() -> usize {
    512
}

/// Realtime hub configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HubConfig {
    /// Outbound queue per member; full queues drop messages for that member
    #[serde(default = "default_member_buffer")]
    pub member_buffer: usize,
    /// Inbound command queue of the hub worker
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
}

fn default_member_buffer() -> usize {
    64
}

fn default_command_buffer() -> usize {
    256
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    /// Seconds between registry reconciliations, 0 disables
    #[serde(default)]
    pub reconcile_interval_secs: u64,
}

/// Page and asset locations
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebConfig {
    pub page_dir: PathBuf,
    pub static_dir: PathBuf,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 8080,
            log_level: default_log_level(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_db_url(),
            max_connections: default_max_connections(),
            auto_migrate: true,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            base_port: 1935,
            app_name: default_app_name(),
            public_host: default_public_host(),
        }
    }
}

impl Default for PackagingConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            base_port: 7001,
            tag_buffer: default_tag_buffer(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            member_buffer: default_member_buffer(),
            command_buffer: default_command_buffer(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 0,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            page_dir: PathBuf::from("."),
            static_dir: PathBuf::from("./static"),
        }
    }
}

/// Load configuration from a file or use default
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => {
            let config_str = std::fs::read_to_string(path)
                .context(format!("Failed to read config file: {:?}", path))?;

            let config = if path.extension().map_or(false, |ext| ext == "json") {
                serde_json::from_str(&config_str).context("Failed to parse JSON config")?
            } else if path.extension().map_or(false, |ext| ext == "toml") {
                toml::from_str(&config_str).context("Failed to parse TOML config")?
            } else {
                return Err(anyhow::anyhow!("Unsupported config file format"));
            };

            Ok(config)
        }
        None => Ok(Config::default()),
    }
}
