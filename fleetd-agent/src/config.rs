//! Agent configuration (`fleetd-agent.toml`).

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::backoff::ReconnectPolicy;
use crate::session::SessionConfig;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Client IP reported to the coordinator.
    pub identity: String,
    pub server: ServerSection,
    pub session: SessionSection,
    pub executor: ExecutorSection,
    pub log: LogSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub upload_api: String,
    pub download_api: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub heartbeat_secs: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub response_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub work_dir: PathBuf,
    pub log_dir: PathBuf,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            identity: "127.0.0.1".to_string(),
            server: ServerSection::default(),
            session: SessionSection::default(),
            executor: ExecutorSection::default(),
            log: LogSection::default(),
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            path: "/wsclient".to_string(),
            upload_api: "http://127.0.0.1:8081/api/upload".to_string(),
            download_api: "http://127.0.0.1:8081/api/download".to_string(),
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            heartbeat_secs: 30,
            max_reconnect_attempts: 3,
            reconnect_base_delay_ms: 5_000,
            response_timeout_secs: 30,
        }
    }
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            log_dir: PathBuf::from("logs"),
            timeout_secs: 3_600,
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

impl AgentConfig {
    /// Reads `path` when given; an absent path yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// `FLEETD_AGENT_IDENTITY` overrides the configured identity.
    pub fn apply_env(&mut self) {
        if let Ok(identity) = env::var("FLEETD_AGENT_IDENTITY") {
            let identity = identity.trim();
            if !identity.is_empty() {
                self.identity = identity.to_string();
            }
        }
    }

    pub fn server_url(&self) -> String {
        format!(
            "ws://{}:{}{}",
            self.server.host, self.server.port, self.server.path
        )
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            url: self.server_url(),
            identity: self.identity.clone(),
            heartbeat: Duration::from_secs(self.session.heartbeat_secs.max(1)),
            reconnect: ReconnectPolicy {
                max_attempts: self.session.max_reconnect_attempts,
                base_delay: Duration::from_millis(self.session.reconnect_base_delay_ms),
            },
            response_timeout: Duration::from_secs(self.session.response_timeout_secs.max(1)),
        }
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.executor.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_is_valid() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = AgentConfig::load(Some(file.path())).unwrap();
        assert_eq!(config, AgentConfig::default());
        assert_eq!(config.server_url(), "ws://127.0.0.1:8080/wsclient");

        let session = config.session_config();
        assert_eq!(session.reconnect.max_attempts, 3);
        assert_eq!(session.reconnect.base_delay, Duration::from_secs(5));
        assert_eq!(session.heartbeat, Duration::from_secs(30));
    }

    #[test]
    fn sections_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "identity = \"10.1.2.3\"\n[server]\nhost = \"coord\"\nport = 9000\n[executor]\ntimeout_secs = 5"
        )
        .unwrap();
        let config = AgentConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.identity, "10.1.2.3");
        assert_eq!(config.server_url(), "ws://coord:9000/wsclient");
        assert_eq!(config.execution_timeout(), Duration::from_secs(5));
        assert_eq!(config.executor.log_dir, PathBuf::from("logs"));
    }

    #[test]
    fn broken_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nport = 1").unwrap();
        assert!(AgentConfig::load(Some(file.path())).is_err());
    }
}
