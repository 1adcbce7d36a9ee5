//! Gateway configuration.
//!
//! Layered the usual way: serde defaults, then an optional config file, then
//! `CCBRIDGE_*` environment variables. `NODE_ENV=test` or `CCBRIDGE_TEST`
//! switches on test mode, which disables the background timers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3001
}

fn default_safe_root() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_max_sessions() -> usize {
    10
}

fn default_session_timeout_secs() -> u64 {
    24 * 60 * 60
}

fn default_session_warning_secs() -> u64 {
    20 * 60 * 60
}

fn default_ping_interval_secs() -> u64 {
    15
}

fn default_queue_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_queue_capacity() -> usize {
    256
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Bind address for the WebSocket listener.
    pub host: String,
    pub port: u16,
    /// Optional bearer token; when set, unauthenticated connections are
    /// closed with policy code 1008.
    pub auth_token: Option<String>,
    /// Root directory that all session working directories must live under.
    pub safe_root: PathBuf,
    /// Agent CLI command name used for discovery.
    pub agent_command: String,
    /// Explicit Agent CLI binary path; overrides discovery.
    pub agent_cli_path: Option<PathBuf>,
    /// Maximum concurrent sessions.
    pub max_sessions: usize,
    pub session_timeout_secs: u64,
    pub session_warning_secs: u64,
    pub ping_interval_secs: u64,
    pub queue_ttl_secs: u64,
    /// Per-session delivery queue bound; oldest events are evicted on
    /// overflow.
    pub queue_capacity: usize,
    /// Disables background timers (session sweep, queue expiry, pings).
    pub test_mode: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            auth_token: None,
            safe_root: default_safe_root(),
            agent_command: default_agent_command(),
            agent_cli_path: None,
            max_sessions: default_max_sessions(),
            session_timeout_secs: default_session_timeout_secs(),
            session_warning_secs: default_session_warning_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            queue_ttl_secs: default_queue_ttl_secs(),
            queue_capacity: default_queue_capacity(),
            test_mode: false,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        builder = match file {
            Some(path) => builder.add_source(config::File::from(path)),
            None => builder.add_source(config::File::with_name("ccbridge").required(false)),
        };
        builder = builder.add_source(config::Environment::with_prefix("CCBRIDGE"));

        let mut loaded: BridgeConfig = builder
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("invalid configuration")?;

        if std::env::var("NODE_ENV").as_deref() == Ok("test")
            || std::env::var("CCBRIDGE_TEST").is_ok()
        {
            loaded.test_mode = true;
        }
        Ok(loaded)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn session_warning(&self) -> Duration {
        Duration::from_secs(self.session_warning_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn queue_ttl(&self) -> Duration {
        Duration::from_secs(self.queue_ttl_secs)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = BridgeConfig::default();
        assert_eq!(config.port, 3001);
        assert_eq!(config.max_sessions, 10);
        assert_eq!(config.session_timeout(), Duration::from_secs(86400));
        assert_eq!(config.session_warning(), Duration::from_secs(72000));
        assert_eq!(config.ping_interval(), Duration::from_secs(15));
        assert_eq!(config.queue_ttl(), Duration::from_secs(86400));
        assert!(!config.test_mode);
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ccbridge.toml");
        std::fs::write(&path, "port = 4100\nmax_sessions = 3\n").unwrap();

        let config = BridgeConfig::load(Some(&path)).unwrap();
        assert_eq!(config.port, 4100);
        assert_eq!(config.max_sessions, 3);
        // Untouched fields keep their defaults.
        assert_eq!(config.ping_interval_secs, 15);
    }

    #[test]
    fn bind_addr_joins_host_and_port() {
        let config = BridgeConfig {
            host: "0.0.0.0".to_string(),
            port: 9000,
            ..Default::default()
        };
        assert_eq!(config.bind_addr(), "0.0.0.0:9000");
    }
}
