//! Configuration structs with sensible defaults and RON persistence.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How a service frames traffic on its sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceKind {
    /// Length-prefixed frames carrying an opcode/status header.
    #[default]
    Normal,
    /// Bytes are passed through as-is, without any packet framing.
    Raw,
}

/// Who runs the service's per-tick work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DriveMode {
    /// The service owns an execution thread that ticks at the configured fps.
    #[default]
    SelfDrive,
    /// The host calls `on_svc` from its own loop; no execution thread exists.
    ExternalDrive,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Service identity and scheduling.
    pub service: ServiceConfig,
    /// Transport settings.
    pub network: NetworkConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Service identity and scheduling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    /// Human-readable service name, used in logs and thread names.
    pub name: String,
    /// Framing mode.
    pub kind: ServiceKind,
    /// Drive mode.
    pub drive_mode: DriveMode,
    /// Target ticks per second. Must be at least 1.
    pub fps: u32,
    /// Transport I/O worker threads allocated on start.
    pub worker_count: usize,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to listen on.
    pub listen_address: String,
    /// Port to listen on.
    pub port: u16,
    /// Maximum concurrent sessions per service.
    pub max_sessions: usize,
    /// Maximum frame payload in bytes.
    pub max_payload_size: u32,
    /// Timeout for blocking connects, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Read buffer size for raw sessions, in bytes.
    pub read_buffer_size: usize,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "harbor".to_string(),
            kind: ServiceKind::Normal,
            drive_mode: DriveMode::SelfDrive,
            fps: 30,
            worker_count: 2,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            port: 7777,
            max_sessions: 1024,
            max_payload_size: 1_048_576,
            connect_timeout_ms: 5_000,
            read_buffer_size: 4096,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            config.validate()?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
        new_config.validate()?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// Reject values the runtime cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.fps == 0 {
            return Err(ConfigError::InvalidValue {
                field: "service.fps",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.network.max_sessions == 0 {
            return Err(ConfigError::InvalidValue {
                field: "network.max_sessions",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
