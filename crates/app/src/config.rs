//! Server configuration
//!
//! Read from a TOML file named by `--config <path>` or `MANDI_CONFIG`.
//! A missing file means defaults; every key is optional.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use directories::ProjectDirs;
use mandi_net::{ServerConfig, DEFAULT_PORT};
use serde::{Deserialize, Serialize};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "MANDI_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Could not determine data directory")]
    NoDataDir,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub storage: StorageSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: IpAddr,
    pub port: u16,
    pub idle_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            idle_timeout_secs: 90,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Defaults to `mandi.db` in the platform data directory
    pub database_path: Option<PathBuf>,
    pub busy_timeout_ms: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            database_path: None,
            busy_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Load from `path`; a file that does not exist yields defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_toml_str(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            addr: SocketAddr::new(self.server.bind, self.server.port),
            idle_timeout: Duration::from_secs(self.server.idle_timeout_secs),
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.busy_timeout_ms)
    }

    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.storage.database_path {
            return Ok(path.clone());
        }
        let dirs = ProjectDirs::from("dev", "mandi", "mandi").ok_or(ConfigError::NoDataDir)?;
        Ok(dirs.data_dir().join("mandi.db"))
    }
}

/// Command-line arguments
#[derive(Debug, Parser)]
#[command(name = "mandi")]
#[command(about = "Moderated farmer/buyer negotiation chat server", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Path to the TOML config file
    #[arg(long, value_name = "PATH", env = CONFIG_ENV)]
    pub config: Option<PathBuf>,
}
