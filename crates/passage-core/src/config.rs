//! Configuration system for Passage.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PASSAGE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/passage/config.toml
//!   3. ~/.config/passage/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::profile::PeerProfile;
use crate::wire::{CHANNEL_PORT, REGSERVER_PORT};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub rendezvous: RendezvousConfig,
    pub profile: ProfileConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the 32-byte identity seed. Auto-generated on first run.
    pub seed_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind the channel socket to.
    pub listen: String,
    /// UDP port for channel traffic. 0 = OS-assigned.
    pub channel_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Rendezvous servers, "host" or "host:port" (default port 9669).
    pub servers: Vec<String>,
    /// Keep re-registering through server outages instead of giving up.
    pub persist: bool,
}

/// Published profile attributes. Empty strings are omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    pub host_name: String,
    pub owner_nickname: String,
    pub city: String,
    pub region: String,
    pub country: String,
}

impl ProfileConfig {
    /// Build the wire profile this configuration describes.
    pub fn to_profile(&self) -> PeerProfile {
        let mut p = PeerProfile::new();
        p.set_host_name(&self.host_name);
        p.set_owner_nickname(&self.owner_nickname);
        p.set_city(&self.city);
        p.set_region(&self.region);
        p.set_country(&self.country);
        p
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            network: NetworkConfig::default(),
            rendezvous: RendezvousConfig::default(),
            profile: ProfileConfig::default(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            seed_path: config_dir().join("identity"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0".to_string(),
            channel_port: CHANNEL_PORT,
        }
    }
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            persist: true,
        }
    }
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            host_name: String::new(),
            owner_nickname: String::new(),
            city: String::new(),
            region: String::new(),
            country: String::new(),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".config"))
        .join("passage")
}

fn home_or_tmp() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

/// Split a "host:port" server entry, defaulting to the regserver port.
pub fn split_server_entry(entry: &str) -> (String, u16) {
    // Bracketed IPv6 or host:port; a bare name gets the default port.
    if let Some(rest) = entry.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(REGSERVER_PORT);
            return (host.to_string(), port);
        }
    }
    match entry.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (entry.to_string(), REGSERVER_PORT),
        },
        _ => (entry.to_string(), REGSERVER_PORT),
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl NodeConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            NodeConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PASSAGE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&NodeConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply PASSAGE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PASSAGE_NETWORK__LISTEN") {
            self.network.listen = v;
        }
        if let Ok(v) = std::env::var("PASSAGE_NETWORK__CHANNEL_PORT") {
            if let Ok(p) = v.parse() {
                self.network.channel_port = p;
            }
        }
        if let Ok(v) = std::env::var("PASSAGE_RENDEZVOUS__SERVERS") {
            self.rendezvous.servers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(v) = std::env::var("PASSAGE_RENDEZVOUS__PERSIST") {
            self.rendezvous.persist = v == "true" || v == "1";
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_protocol_ports() {
        let config = NodeConfig::default();
        assert_eq!(config.network.channel_port, CHANNEL_PORT);
        assert!(config.rendezvous.servers.is_empty());
        assert!(config.rendezvous.persist);
    }

    #[test]
    fn server_entry_splitting() {
        assert_eq!(
            split_server_entry("rendezvous.example.org"),
            ("rendezvous.example.org".to_string(), REGSERVER_PORT)
        );
        assert_eq!(
            split_server_entry("10.0.0.1:7000"),
            ("10.0.0.1".to_string(), 7000)
        );
        assert_eq!(
            split_server_entry("[fe80::1]:7000"),
            ("fe80::1".to_string(), 7000)
        );
        assert_eq!(
            split_server_entry("[fe80::1]"),
            ("fe80::1".to_string(), REGSERVER_PORT)
        );
    }

    #[test]
    fn profile_config_omits_empty_attributes() {
        let mut pc = ProfileConfig::default();
        pc.city = "Boston".to_string();
        let profile = pc.to_profile();
        assert_eq!(profile.city(), Some("Boston"));
        assert_eq!(profile.host_name(), None);
    }
}
