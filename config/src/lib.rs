//! Process configuration (§6, §10): everything is read directly from the
//! environment. No XDG/dotenv layering — the queue processor, gateway, and
//! storage backend selection are controlled by a handful of env vars.

use std::env;

use thiserror::Error;

pub const ENV_DATA_PATH: &str = "AGENT_WORLD_DATA_PATH";
pub const ENV_STORAGE_TYPE: &str = "AGENT_WORLD_STORAGE_TYPE";
pub const ENV_LOGGER_LEVELS: &str = "LOGGER_LEVELS";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown storage backend: {0} (expected \"memory\" or \"sqlite\")")]
    UnknownBackend(String),
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Filesystem path the sqlite backend opens its database under. Ignored
    /// for the in-memory backend.
    pub data_path: String,
    pub storage_backend: StorageBackend,
    pub logger_levels: String,
}

impl ServerConfig {
    /// Reads configuration from the process environment, applying the
    /// defaults named in §6: in-memory storage under `./agent-world-data`,
    /// `info` logging.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_path = env::var(ENV_DATA_PATH).unwrap_or_else(|_| "./agent-world-data".to_string());
        let storage_backend = match env::var(ENV_STORAGE_TYPE).ok().as_deref() {
            None | Some("memory") => StorageBackend::Memory,
            Some("sqlite") => StorageBackend::Sqlite,
            Some(other) => return Err(ConfigError::UnknownBackend(other.to_string())),
        };
        let logger_levels = env::var(ENV_LOGGER_LEVELS).unwrap_or_else(|_| "info".to_string());
        Ok(Self {
            data_path,
            storage_backend,
            logger_levels,
        })
    }
}

/// Initializes a global `tracing` subscriber driven by [`ServerConfig::logger_levels`],
/// matching the teacher's `env-filter`-based setup. Safe to call once at process start.
pub fn init_tracing(logger_levels: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(logger_levels)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
