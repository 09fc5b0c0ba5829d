//! Application configuration management.
//!
//! Configuration is layered with the `config` crate:
//!
//! 1. Built-in defaults (the `Default` impls below)
//! 2. An optional TOML file
//! 3. `ROLLCALL__<SECTION>__<KEY>` environment variables
//!
//! ```toml
//! [engine]
//! user_id = "user-1"
//! position_timeout_secs = 10
//! repository_timeout_secs = 15
//!
//! [store]
//! kind = "rest"
//! base_url = "https://project.example.co"
//! api_key = "..."
//!
//! [server]
//! bind_address = "0.0.0.0:3000"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use ::config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "ROLLCALL";

/// Errors raised while loading, saving or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly requested configuration file does not exist.
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The configuration could not be written.
    #[error("Failed to write {}: {source}", path.display())]
    WriteError {
        /// Target path.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// A source could not be parsed or deserialized.
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] ::config::ConfigError),

    /// The configuration could not be serialized to TOML.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// A single field holds an invalid value.
    #[error("{field}: {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields hold invalid values.
    #[error("{} configuration errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Attendance engine tuning.
    pub engine: EngineConfig,
    /// Remote store connection.
    pub store: StoreConfig,
    /// HTTP server settings.
    pub server: ServerConfig,
}

/// Attendance engine tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// The signed-in user whose attendance this engine tracks.
    pub user_id: String,

    /// Deadline for a single position fix.
    pub position_timeout_secs: u64,

    /// Deadline for a single remote store round-trip.
    pub repository_timeout_secs: u64,

    /// Pause before the single retry of a failed operation.
    pub retry_backoff_ms: u64,

    /// Capacity of the region event channel.
    pub event_channel_capacity: usize,

    /// Number of issues retained in the engine's issue log.
    pub issue_log_capacity: usize,

    /// Foreground polling interval. `0` disables polling unless the
    /// monitoring facility cannot push events.
    pub poll_interval_secs: u64,

    /// Where the monitoring session snapshot is persisted.
    pub session_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_id: "local-user".to_string(),
            position_timeout_secs: 10,
            repository_timeout_secs: 15,
            retry_backoff_ms: 500,
            event_channel_capacity: 64,
            issue_log_capacity: 128,
            poll_interval_secs: 30,
            session_path: None,
        }
    }
}

impl EngineConfig {
    /// Position fetch deadline.
    #[must_use]
    pub const fn position_timeout(&self) -> Duration {
        Duration::from_secs(self.position_timeout_secs)
    }

    /// Repository round-trip deadline.
    #[must_use]
    pub const fn repository_timeout(&self) -> Duration {
        Duration::from_secs(self.repository_timeout_secs)
    }

    /// Backoff before retrying.
    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Polling interval, if polling is enabled.
    #[must_use]
    pub const fn poll_interval(&self) -> Option<Duration> {
        if self.poll_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.poll_interval_secs))
        }
    }
}

/// Which remote store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// Process-local store, for development and tests.
    #[default]
    Memory,
    /// PostgREST-compatible HTTP backend.
    Rest,
}

/// Remote store connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend selection.
    pub kind: StoreKind,
    /// Base URL of the REST backend.
    pub base_url: Option<String>,
    /// API key sent with every REST request.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub bind_address: String,
    /// Production logging and file output.
    pub production: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            production: false,
        }
    }
}

impl Config {
    /// Loads configuration from defaults, an optional file and the environment.
    ///
    /// With `path = None` the default location is used if it exists.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::NotFound` if an explicit `path` does not exist,
    /// a parse error for malformed sources, or validation errors.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut builder = ::config::Config::builder();

        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::NotFound(path.to_path_buf()));
                }
                builder = builder.add_source(File::from(path).format(FileFormat::Toml));
            }
            None => {
                if let Some(default) = default_config_path() {
                    builder = builder.add_source(
                        File::from(default)
                            .format(FileFormat::Toml)
                            .required(false),
                    );
                }
            }
        }

        let config: Self = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parses configuration from a TOML string, without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns a parse error or validation errors.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: Self = ::config::Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to `path` as TOML.
    ///
    /// The store API key is never written.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks every field and reports all violations at once.
    ///
    /// # Errors
    ///
    /// Returns a single `ValidationError` or `MultipleValidationErrors`.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut invalid = |field: &str, message: &str| {
            errors.push(ConfigError::ValidationError {
                field: field.to_string(),
                message: message.to_string(),
            });
        };

        let engine = &self.engine;
        if engine.user_id.trim().is_empty() {
            invalid("engine.user_id", "must not be empty");
        }
        if engine.position_timeout_secs == 0 {
            invalid("engine.position_timeout_secs", "must be greater than zero");
        }
        if engine.repository_timeout_secs == 0 {
            invalid("engine.repository_timeout_secs", "must be greater than zero");
        }
        if engine.event_channel_capacity == 0 {
            invalid("engine.event_channel_capacity", "must be greater than zero");
        }
        if engine.issue_log_capacity == 0 {
            invalid("engine.issue_log_capacity", "must be greater than zero");
        }

        if self.store.kind == StoreKind::Rest {
            match self.store.base_url.as_deref() {
                None | Some("") => invalid("store.base_url", "required when store.kind = \"rest\""),
                Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
                    invalid("store.base_url", "must be an http(s) URL");
                }
                Some(_) => {}
            }
        }

        if self.server.bind_address.parse::<std::net::SocketAddr>().is_err() {
            invalid("server.bind_address", "must be a socket address like 0.0.0.0:3000");
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }

    /// Session snapshot path: explicit setting or the platform data dir.
    #[must_use]
    pub fn session_path(&self) -> Option<PathBuf> {
        self.engine
            .session_path
            .clone()
            .or_else(crate::storage::default_session_path)
    }
}

/// Default configuration file location (`~/.config/rollcall/config.toml` on Linux).
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "rollcall").map(|dirs| dirs.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.position_timeout(), Duration::from_secs(10));
        assert_eq!(config.engine.repository_timeout(), Duration::from_secs(15));
        assert_eq!(config.store.kind, StoreKind::Memory);
    }

    #[test]
    fn test_from_toml_overrides_defaults() {
        let config = Config::from_toml_str(
            r#"
            [engine]
            user_id = "user-42"
            poll_interval_secs = 0

            [server]
            bind_address = "127.0.0.1:8080"
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.user_id, "user-42");
        assert_eq!(config.engine.poll_interval(), None);
        assert_eq!(config.engine.repository_timeout_secs, 15);
        assert_eq!(config.server.bind_address, "127.0.0.1:8080");
    }

    #[test]
    fn test_rest_store_requires_base_url() {
        let err = Config::from_toml_str(
            r#"
            [store]
            kind = "rest"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { ref field, .. } if field == "store.base_url"));
    }

    #[test]
    fn test_collects_multiple_errors() {
        let mut config = Config::default();
        config.engine.user_id = " ".into();
        config.engine.repository_timeout_secs = 0;
        config.server.bind_address = "nowhere".into();

        match config.validate() {
            Err(ConfigError::MultipleValidationErrors(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected multiple errors, got {other:?}"),
        }
    }

    #[test]
    fn test_load_missing_explicit_path() {
        let err = Config::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_save_omits_api_key_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.engine.user_id = "user-7".into();
        config.store.api_key = Some("secret".into());
        config.save(&path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(!written.contains("secret"));

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.engine.user_id, "user-7");
        assert_eq!(loaded.store.api_key, None);
    }
}
