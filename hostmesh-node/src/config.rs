//! Node configuration: defaults, then a TOML file, then environment overrides.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::adapter::AdapterSettings;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {reason}")]
    Read { path: PathBuf, reason: String },
    #[error("invalid config file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },
    #[error("unsupported medium {0:?} (expected `memory` or `udp://group:port`)")]
    Medium(String),
    #[error("ttl_secs must be at least 1")]
    Ttl,
}

/// Node configuration. File: ~/.config/hostmesh/config.toml or /etc/hostmesh/config.toml.
/// Env overrides: HOSTMESH_TTL_SECS, HOSTMESH_MEDIUM, HOSTMESH_BROADCAST_CHANNEL,
/// HOSTMESH_CHANNEL_PREFIX, HOSTMESH_GUARD_SKEW_MS, HOSTMESH_RELAY_LISTEN.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Seconds an announcement stays valid (default 10). Refresh runs every TTL/2.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u16,
    /// `memory` or `udp://group:port`.
    #[serde(default = "default_medium")]
    pub medium: String,
    #[serde(default = "default_broadcast_channel")]
    pub broadcast_channel: String,
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,
    /// Subtracted from each refresh wait (default 200).
    #[serde(default = "default_guard_skew_ms")]
    pub guard_skew_ms: u64,
    /// TCP listen address of the relay's stream side.
    #[serde(default = "default_relay_listen")]
    pub relay_listen: SocketAddr,
}

fn default_ttl_secs() -> u16 {
    10
}
fn default_medium() -> String {
    "udp://239.255.60.61:45690".into()
}
fn default_broadcast_channel() -> String {
    "hostmesh.presence".into()
}
fn default_channel_prefix() -> String {
    "hostmesh.host.".into()
}
fn default_guard_skew_ms() -> u64 {
    200
}
fn default_relay_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 45691))
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            medium: default_medium(),
            broadcast_channel: default_broadcast_channel(),
            channel_prefix: default_channel_prefix(),
            guard_skew_ms: default_guard_skew_ms(),
            relay_listen: default_relay_listen(),
        }
    }
}

impl NodeConfig {
    /// Settings for an adapter named `name`.
    pub fn adapter_settings(&self, name: impl Into<String>) -> AdapterSettings {
        AdapterSettings {
            name: name.into(),
            ttl_secs: self.ttl_secs,
            guard_skew: Duration::from_millis(self.guard_skew_ms),
            broadcast_channel: self.broadcast_channel.clone(),
            channel_prefix: self.channel_prefix.clone(),
            ..AdapterSettings::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl_secs == 0 {
            return Err(ConfigError::Ttl);
        }
        crate::medium::from_uri(&self.medium).map(|_| ())
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        if let Some(v) = lookup("HOSTMESH_TTL_SECS") {
            self.ttl_secs = parse_env("HOSTMESH_TTL_SECS", v)?;
        }
        if let Some(v) = lookup("HOSTMESH_MEDIUM") {
            self.medium = v;
        }
        if let Some(v) = lookup("HOSTMESH_BROADCAST_CHANNEL") {
            self.broadcast_channel = v;
        }
        if let Some(v) = lookup("HOSTMESH_CHANNEL_PREFIX") {
            self.channel_prefix = v;
        }
        if let Some(v) = lookup("HOSTMESH_GUARD_SKEW_MS") {
            self.guard_skew_ms = parse_env("HOSTMESH_GUARD_SKEW_MS", v)?;
        }
        if let Some(v) = lookup("HOSTMESH_RELAY_LISTEN") {
            self.relay_listen = parse_env("HOSTMESH_RELAY_LISTEN", v)?;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Env { var, value })
}

/// Load config: defaults, then the first config file found, then env vars.
pub fn load() -> Result<NodeConfig, ConfigError> {
    let mut config = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_file(&path)?,
        None => NodeConfig::default(),
    };
    config.apply_env(|var| std::env::var(var).ok())?;
    config.validate()?;
    Ok(config)
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(home.join(".config/hostmesh/config.toml"));
    }
    out.push(PathBuf::from("/etc/hostmesh/config.toml"));
    out
}

pub fn load_file(path: &Path) -> Result<NodeConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    parse(&text).map_err(|reason| ConfigError::Parse {
        path: path.to_path_buf(),
        reason,
    })
}

fn parse(text: &str) -> Result<NodeConfig, String> {
    toml::from_str(text).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_gives_defaults() {
        assert_eq!(parse("").unwrap(), NodeConfig::default());
    }

    #[test]
    fn file_overrides_some_fields() {
        let c = parse("ttl_secs = 4\nmedium = \"memory\"\nrelay_listen = \"127.0.0.1:9000\"\n").unwrap();
        assert_eq!(c.ttl_secs, 4);
        assert_eq!(c.medium, "memory");
        assert_eq!(c.relay_listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(c.channel_prefix, "hostmesh.host.");
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(parse("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("HOSTMESH_TTL_SECS", "30"),
            ("HOSTMESH_GUARD_SKEW_MS", "500"),
            ("HOSTMESH_CHANNEL_PREFIX", "mesh."),
        ]);
        let mut c = NodeConfig::default();
        c.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(c.ttl_secs, 30);
        assert_eq!(c.guard_skew_ms, 500);
        assert_eq!(c.channel_prefix, "mesh.");
        let s = c.adapter_settings("relay");
        assert_eq!(s.guard_skew, Duration::from_millis(500));
        assert_eq!(s.name, "relay");
    }

    #[test]
    fn bad_env_value_reported() {
        let mut c = NodeConfig::default();
        let err = c
            .apply_env(|k| (k == "HOSTMESH_TTL_SECS").then(|| "ten".to_string()))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Env {
                var: "HOSTMESH_TTL_SECS",
                value: "ten".into()
            }
        );
    }

    #[test]
    fn validate_checks_ttl_and_medium() {
        assert!(NodeConfig::default().validate().is_ok());
        let zero = NodeConfig {
            ttl_secs: 0,
            ..NodeConfig::default()
        };
        assert_eq!(zero.validate(), Err(ConfigError::Ttl));
        let bad = NodeConfig {
            medium: "amqp://broker".into(),
            ..NodeConfig::default()
        };
        assert!(matches!(bad.validate(), Err(ConfigError::Medium(_))));
    }
}
