//! Shell configuration, read from `FORGE_*` environment variables after an
//! optional `.env` file.

use std::path::PathBuf;
use std::time::Duration;

use forge_collab::{RelayConfig, TransportConfig};
use forge_core::ModelId;
use serde::Deserialize;

pub const ENV_PREFIX: &str = "FORGE_";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    pub relay_url: String,
    pub room: String,
    pub user_name: String,
    /// First-attempt generation deadline.
    pub deadline_ms: u64,
    pub default_model: ModelId,
    /// File the editor buffer is presented as in generation context.
    pub context_path: String,
    pub language: String,
    pub heartbeat_secs: u64,
    /// Where `forge-shell relay` listens.
    pub bind_addr: String,
    /// JSON snapshot of the record store, loaded on start and written on exit.
    pub store_path: Option<PathBuf>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:9090".to_string(),
            room: "monaco-demo".to_string(),
            user_name: "anonymous".to_string(),
            deadline_ms: 15_000,
            default_model: ModelId::Gpt4,
            context_path: "current.ts".to_string(),
            language: "typescript".to_string(),
            heartbeat_secs: 15,
            bind_addr: "127.0.0.1:9090".to_string(),
            store_path: None,
        }
    }
}

impl ShellConfig {
    /// Load `.env` if present, then the process environment.
    pub fn from_env() -> Result<Self, envy::Error> {
        match dotenvy::dotenv() {
            Ok(path) => log::debug!("Loaded {}", path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => log::warn!("Ignoring unreadable .env: {e}"),
        }
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Result<Self, envy::Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::prefixed(ENV_PREFIX).from_iter(vars)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_secs * 3),
            ..Default::default()
        }
    }

    pub fn relay(&self) -> RelayConfig {
        RelayConfig {
            bind_addr: self.bind_addr.clone(),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_secs * 3),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = ShellConfig::from_vars(vars(&[("PATH", "/usr/bin")])).unwrap();
        assert_eq!(config, ShellConfig::default());
        assert_eq!(config.deadline(), Duration::from_secs(15));
    }

    #[test]
    fn test_prefixed_overrides() {
        let config = ShellConfig::from_vars(vars(&[
            ("FORGE_ROOM", "pairing"),
            ("FORGE_USER_NAME", "Ada"),
            ("FORGE_DEADLINE_MS", "500"),
            ("FORGE_DEFAULT_MODEL", "CLAUDE"),
            ("ROOM", "ignored"),
        ]))
        .unwrap();
        assert_eq!(config.room, "pairing");
        assert_eq!(config.user_name, "Ada");
        assert_eq!(config.deadline(), Duration::from_millis(500));
        assert_eq!(config.default_model, ModelId::Claude);
        assert_eq!(config.relay_url, "ws://127.0.0.1:9090");
        assert_eq!(config.store_path, None);
    }

    #[test]
    fn test_store_path_from_env() {
        let config = ShellConfig::from_vars(vars(&[("FORGE_STORE_PATH", "/tmp/forge.json")])).unwrap();
        assert_eq!(config.store_path, Some(PathBuf::from("/tmp/forge.json")));
    }

    #[test]
    fn test_bad_value_rejected() {
        let result = ShellConfig::from_vars(vars(&[("FORGE_DEADLINE_MS", "soon")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_heartbeat_feeds_transport_and_relay() {
        let config = ShellConfig {
            heartbeat_secs: 5,
            ..Default::default()
        };
        assert_eq!(config.transport().heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.relay().heartbeat_timeout, Duration::from_secs(15));
    }
}
