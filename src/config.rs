//! Configuration: the persisted fleet file and the environment-driven dev stack
//!
//! The fleet file is JSON:
//!
//! ```json
//! { "serverList": [ { "name": "0", "path": "/srv/www",
//!     "port": { "http": 8080, "https": null }, "autoStart": true } ] }
//! ```

use crate::pool::PoolConfig;
use crate::server::ServeOptions;
use crate::tls::TlsSettings;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Directory under the home directory holding the fleet file
const CONFIG_DIR: &str = ".light-http";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Error)]
pub enum ConfigIoError {
    #[error("Unable to read the configuration file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse the configuration file '{path}', it does not contain valid JSON data: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to convert the configuration into JSON: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Unable to create the configuration directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to write the configuration file '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Root of the persisted fleet file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetConfig {
    #[serde(default)]
    pub server_list: Vec<ServerDescriptor>,
}

/// One server as stored on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDescriptor {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub port: PortConfig,
    #[serde(default)]
    pub auto_start: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PortConfig {
    #[serde(default)]
    pub http: Option<u16>,
    #[serde(default)]
    pub https: Option<u16>,
}

/// Reads and writes the fleet file at a fixed location
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.light-http/config.json`, or a relative path when no home directory is known
    pub fn default_location() -> Self {
        let base = dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(base.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<FleetConfig, ConfigIoError> {
        let data = std::fs::read(&self.path).map_err(|source| ConfigIoError::Read {
            path: self.path.clone(),
            source,
        })?;

        serde_json::from_slice(&data).map_err(|source| ConfigIoError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Like [`load`](Self::load), but a missing file is an empty fleet
    pub fn load_or_default(&self) -> Result<FleetConfig, ConfigIoError> {
        match self.load() {
            Err(ConfigIoError::Read { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                debug!(path = %self.path.display(), "No configuration file, starting empty");
                Ok(FleetConfig::default())
            }
            other => other,
        }
    }

    pub fn save(&self, config: &FleetConfig) -> Result<(), ConfigIoError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| ConfigIoError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let json = serde_json::to_string_pretty(config).map_err(ConfigIoError::Serialize)?;

        std::fs::write(&self.path, json).map_err(|source| ConfigIoError::Write {
            path: self.path.clone(),
            source,
        })?;

        debug!(path = %self.path.display(), servers = config.server_list.len(), "Configuration saved");
        Ok(())
    }
}

/// One side server of the dev stack (player or editor)
#[derive(Debug, Clone, PartialEq)]
pub struct AssetServerConfig {
    /// Host used in the alias URL when set explicitly
    pub host: Option<String>,
    pub port: u16,
    pub path: PathBuf,
    /// Alias path on the main server
    pub alias: String,
}

impl AssetServerConfig {
    /// Explicit alias URL, if a host was configured
    pub fn alias_url(&self) -> Option<String> {
        self.host
            .as_ref()
            .map(|host| format!("http://{}:{}", host, self.port))
    }
}

/// The player/editor/main stack, read from environment variables
#[derive(Debug, Clone, PartialEq)]
pub struct StackConfig {
    pub player: AssetServerConfig,
    pub editor: AssetServerConfig,
    pub main_port: u16,
    pub main_https_port: Option<u16>,
    pub public_path: PathBuf,
    pub bind: Option<IpAddr>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl StackConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(std::env::vars().collect())
    }

    pub fn from_vars(vars: HashMap<String, String>) -> anyhow::Result<Self> {
        let get = |key: &str| vars.get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let port = |key: &str, default: u16| -> anyhow::Result<u16> {
            match get(key) {
                Some(value) => value
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid port in {}='{}': {}", key, value, e)),
                None => Ok(default),
            }
        };

        let main_https_port = match get("LOCAL_SERVER_HTTPS_PORT") {
            Some(value) => Some(value.parse().map_err(|e| {
                anyhow::anyhow!("Invalid port in LOCAL_SERVER_HTTPS_PORT='{}': {}", value, e)
            })?),
            None => None,
        };

        let bind = match get("LIGHT_HTTP_BIND") {
            Some(value) => Some(value.parse().map_err(|e| {
                anyhow::anyhow!("Invalid bind address in LIGHT_HTTP_BIND='{}': {}", value, e)
            })?),
            None => None,
        };

        Ok(Self {
            player: AssetServerConfig {
                host: get("PLAYER_SERVER_HOST"),
                port: port("PLAYER_SERVER_PORT", 8001)?,
                path: get("PLAYER_PATH")
                    .unwrap_or_else(|| "../player/player".to_string())
                    .into(),
                alias: get("LOCAL_PLAYER_ALIAS_PATH").unwrap_or_else(|| "mt".to_string()),
            },
            editor: AssetServerConfig {
                host: get("EDITOR_SERVER_HOST"),
                port: port("EDITOR_SERVER_PORT", 8002)?,
                path: get("EDITOR_PATH")
                    .unwrap_or_else(|| "../editor/source".to_string())
                    .into(),
                alias: get("LOCAL_EDITOR_ALIAS_PATH").unwrap_or_else(|| "WM.Editor".to_string()),
            },
            main_port: port("LOCAL_SERVER_PORT", 80)?,
            main_https_port,
            public_path: get("LOCAL_PUBLIC_PATH")
                .unwrap_or_else(|| "public".to_string())
                .into(),
            bind,
            tls_cert: get("LIGHT_HTTP_TLS_CERT").map(PathBuf::from),
            tls_key: get("LIGHT_HTTP_TLS_KEY").map(PathBuf::from),
        })
    }

    pub fn serve_options(&self) -> ServeOptions {
        let defaults = ServeOptions::default();
        ServeOptions {
            bind: self.bind.unwrap_or(defaults.bind),
            tls: TlsSettings {
                cert: self.tls_cert.clone(),
                key: self.tls_key.clone(),
            },
            pool: PoolConfig::default(),
        }
    }
}
