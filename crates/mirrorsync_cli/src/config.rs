//! Configuration file support for the mirrorsync CLI.
//!
//! Configuration is loaded with the following precedence (highest to lowest):
//! 1. CLI flags
//! 2. Environment variables (prefixed with `MIRRORSYNC_`, e.g., `MIRRORSYNC_DATABASE_URL`)
//! 3. Config file (~/.config/mirrorsync/config.toml or ./mirrorsync.toml)
//! 4. Built-in defaults
//!
//! The database URL defaults to `sqlite://~/.local/state/mirrorsync/mirrorsync.db`
//! on Linux (using the XDG state directory) if not explicitly configured.
//!
//! Example config file:
//! ```toml
//! [database]
//! url = "sqlite://~/.local/state/mirrorsync/mirrorsync.db"  # optional, this is the default
//!
//! [server]
//! listen = "127.0.0.1:8080"
//!
//! [sync]
//! page_size = 100
//!
//! [sync.limiter]
//! initial_limit = 20
//! max_limit = 30
//!
//! [sync.cache]
//! memory_ttl_secs = 1800
//! ```

use std::path::PathBuf;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use directories::ProjectDirs;
use mirrorsync::SyncTunables;
use serde::Deserialize;

/// Default listen address for the API server.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database configuration.
    pub database: DatabaseConfig,
    /// API server configuration.
    pub server: ServerConfig,
    /// Pipeline tunables, passed through to the library.
    pub sync: SyncTunables,
}

/// Database configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database connection URL.
    /// Defaults to `sqlite://~/.local/state/mirrorsync/mirrorsync.db` if not specified.
    pub url: Option<String>,
}

/// API server configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for `mirrorsync serve`.
    /// Can also be set via MIRRORSYNC_SERVER_LISTEN environment variable.
    pub listen: Option<String>,
}

impl Config {
    /// Load configuration using the config crate's layered approach.
    ///
    /// Sources are loaded in order (later sources override earlier):
    /// 1. Built-in defaults
    /// 2. XDG config file (~/.config/mirrorsync/config.toml)
    /// 3. Local config file (./mirrorsync.toml)
    /// 4. Environment variables with MIRRORSYNC_ prefix
    pub fn load() -> Self {
        let mut builder = ConfigBuilder::builder();

        if let Some(proj_dirs) = ProjectDirs::from("", "", "mirrorsync") {
            let xdg_config = proj_dirs.config_dir().join("config.toml");
            if xdg_config.exists() {
                tracing::debug!("Loading config from {:?}", xdg_config);
                builder = builder.add_source(
                    File::from(xdg_config)
                        .format(FileFormat::Toml)
                        .required(false),
                );
            }
        }

        // Local config file (higher priority than XDG)
        let local_config = PathBuf::from("mirrorsync.toml");
        if local_config.exists() {
            tracing::debug!("Loading config from ./mirrorsync.toml");
            builder = builder.add_source(
                File::from(local_config)
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        // e.g., MIRRORSYNC_DATABASE_URL -> database.url
        builder = builder.add_source(
            Environment::with_prefix("MIRRORSYNC")
                .separator("_")
                .try_parsing(true),
        );

        match builder.build() {
            Ok(settings) => match settings.try_deserialize::<Config>() {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to deserialize config: {}", e);
                    Config::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to build config: {}", e);
                Config::default()
            }
        }
    }

    /// Get the database URL, falling back to the default state directory path.
    ///
    /// The `mode=rwc` parameter enables read-write access and creates the
    /// file if it doesn't exist.
    pub fn database_url(&self) -> Option<String> {
        self.database.url.clone().or_else(|| {
            Self::default_state_dir().map(|state_dir| {
                let db_path = state_dir.join("mirrorsync.db");
                format!("sqlite://{}?mode=rwc", db_path.display())
            })
        })
    }

    /// Get the API listen address.
    pub fn listen_addr(&self) -> String {
        self.server
            .listen
            .clone()
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string())
    }

    /// Get the default state directory path.
    ///
    /// On Linux, this is `$XDG_STATE_HOME/mirrorsync` or `~/.local/state/mirrorsync`.
    /// On macOS/Windows, falls back to the data directory.
    pub fn default_state_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "mirrorsync").map(|dirs| {
            dirs.state_dir()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| dirs.data_dir().to_path_buf())
        })
    }
}
