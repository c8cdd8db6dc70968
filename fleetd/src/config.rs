//! Coordinator configuration: TOML file, then environment, then CLI flags.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
pub const DEFAULT_SECRET: &str = "change-me-in-production";
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;
const MAX_TOKEN_TTL_SECS: u64 = 10 * 365 * DEFAULT_TOKEN_TTL_SECS;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub auth: AuthSection,
    pub database: DatabaseSection,
    pub log: LogSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    pub secret: String,
    pub token_ttl_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            auth: AuthSection::default(),
            database: DatabaseSection::default(),
            log: LogSection::default(),
        }
    }
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            secret: DEFAULT_SECRET.to_string(),
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
        }
    }
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("fleetd.db"),
        }
    }
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// `FLEETD_SECRET` and `FLEETD_LISTEN` override file values.
    pub fn apply_env(&mut self) {
        if let Some(secret) = non_empty_env("FLEETD_SECRET") {
            self.auth.secret = secret;
        }
        if let Some(listen) = non_empty_env("FLEETD_LISTEN") {
            self.listen = listen;
        }
    }

    pub fn token_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.auth.token_ttl_secs.min(MAX_TOKEN_TTL_SECS) as i64)
    }

    pub fn uses_default_secret(&self) -> bool {
        self.auth.secret == DEFAULT_SECRET
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Reads the config file, falling back to defaults when it is missing or
/// unreadable.
pub fn load_server_config(config_path: Option<&Path>) -> ServerConfig {
    let Some(path) = config_path else {
        return ServerConfig::default();
    };

    let contents = match fs::read_to_string(path) {
        Ok(value) => value,
        Err(err) => {
            warn!("Failed to read config file {}: {}", path.display(), err);
            return ServerConfig::default();
        }
    };

    match toml::from_str::<ServerConfig>(&contents) {
        Ok(config) => config,
        Err(err) => {
            warn!("Failed to parse {}: {}", path.display(), err);
            ServerConfig::default()
        }
    }
}
