//! Configuration with priority: environment (`CIVIC_*`) > TOML file > defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::ids::{channel_name, is_valid_room_id, IdSource};

const ENV_PREFIX: &str = "CIVIC_";

/// Settings for the library and the `civic` binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// Prefix of every channel name
    pub namespace: String,
    /// Prefix of local cache keys
    pub app_namespace: String,
    /// Signaling hubs for the peer mesh, tried in order
    pub signaling_endpoints: Vec<String>,
    /// Relay hub used when the mesh fails
    pub fallback_endpoint: String,
    pub failover_deadline_ms: u64,
    pub typing_debounce_ms: u64,
    pub presence_grace_ms: u64,
    pub presence_heartbeat_ms: u64,
    /// Initial sync window before the cache may seed an empty room
    pub seed_delay_ms: u64,
    pub mesh_listen_addr: String,
    /// Direct link budget; drawn from the id source when unset
    pub max_peers: Option<usize>,
    pub cache_path: PathBuf,
    pub rewrite_endpoint: Option<String>,
    pub rewrite_api_key: Option<String>,
    /// Skip the mesh and go straight to the relay
    pub force_relay: bool,
}

impl Default for CollabConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self {
            namespace: "civic".to_string(),
            app_namespace: "editor".to_string(),
            signaling_endpoints: vec!["ws://127.0.0.1:4444".to_string()],
            fallback_endpoint: "ws://127.0.0.1:4444".to_string(),
            failover_deadline_ms: 5_000,
            typing_debounce_ms: 1_000,
            presence_grace_ms: 30_000,
            presence_heartbeat_ms: 10_000,
            seed_delay_ms: 1_000,
            mesh_listen_addr: "127.0.0.1:0".to_string(),
            max_peers: None,
            cache_path: PathBuf::from(home).join(".civic").join("cache"),
            rewrite_endpoint: None,
            rewrite_api_key: None,
            force_relay: false,
        }
    }
}

/// Immutable per-session room settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomConfig {
    pub room_id: String,
    /// `"<namespace>-<room_id>"`
    pub channel: String,
    pub signaling_endpoints: Vec<String>,
    pub fallback_endpoint: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid room id {0:?} (expected at least 20 lowercase letters or digits)")]
    InvalidRoomId(String),
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}

impl CollabConfig {
    /// Load from `path` (or the default location), then apply the process
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_config_path);
        let mut config = Self::from_file(&path)?;
        config.apply_env_from(std::env::vars())?;
        Ok(config)
    }

    /// Defaults overlaid with `path` if it exists.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `~/.config/civic/config.toml`
    pub fn default_config_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home)
            .join(".config")
            .join("civic")
            .join("config.toml")
    }

    /// Apply `CIVIC_*` overrides from `vars`.
    pub fn apply_env_from<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "NAMESPACE" => self.namespace = value,
                "APP_NAMESPACE" => self.app_namespace = value,
                "SIGNALING" => {
                    self.signaling_endpoints = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                "FALLBACK" => self.fallback_endpoint = value,
                "CACHE_PATH" => self.cache_path = PathBuf::from(value),
                "REWRITE_ENDPOINT" => self.rewrite_endpoint = Some(value),
                "REWRITE_API_KEY" => self.rewrite_api_key = Some(value),
                "MESH_LISTEN" => self.mesh_listen_addr = value,
                "MAX_PEERS" => self.max_peers = Some(parse_value(&key, &value)?),
                "FAILOVER_DEADLINE_MS" => self.failover_deadline_ms = parse_value(&key, &value)?,
                "FORCE_RELAY" => self.force_relay = parse_flag(&key, &value)?,
                _ => log::debug!("Ignoring unknown setting {key}"),
            }
        }
        Ok(())
    }

    /// Settings for one room. The id must be a valid room id.
    pub fn room(&self, room_id: &str) -> Result<RoomConfig, ConfigError> {
        if !is_valid_room_id(room_id) {
            return Err(ConfigError::InvalidRoomId(room_id.to_string()));
        }
        Ok(RoomConfig {
            room_id: room_id.to_string(),
            channel: channel_name(&self.namespace, room_id),
            signaling_endpoints: self.signaling_endpoints.clone(),
            fallback_endpoint: self.fallback_endpoint.clone(),
        })
    }

    /// Configured link budget, or a jittered default from `ids`.
    pub fn max_peers_or(&self, ids: &mut dyn IdSource) -> usize {
        self.max_peers.unwrap_or_else(|| ids.max_peers())
    }

    pub fn failover_deadline(&self) -> Duration {
        Duration::from_millis(self.failover_deadline_ms)
    }

    pub fn typing_debounce(&self) -> Duration {
        Duration::from_millis(self.typing_debounce_ms)
    }

    pub fn presence_grace(&self) -> Duration {
        Duration::from_millis(self.presence_grace_ms)
    }

    pub fn presence_heartbeat(&self) -> Duration {
        Duration::from_millis(self.presence_heartbeat_ms)
    }

    pub fn seed_delay(&self) -> Duration {
        Duration::from_millis(self.seed_delay_ms)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}
