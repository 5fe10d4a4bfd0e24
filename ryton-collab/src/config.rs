//! Hub configuration.
//!
//! Defaults work out of the box on a LAN. Every field can be overridden
//! from the environment:
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `RYTON_NAME` | instance name | `RytonIDE Peer_<hostname>` |
//! | `RYTON_LISTEN` | signaling bind address | `0.0.0.0:9090` |
//! | `RYTON_ICE_SERVERS` | comma-separated STUN/TURN URLs | Google STUN |
//! | `RYTON_DISCOVERY` | enable LAN discovery | `true` |
//! | `RYTON_DISCOVERY_SERVICE` | DNS-SD service type | `_rytonide._tcp.local.` |
//! | `RYTON_LOOPBACK_CANDIDATES` | offer loopback ICE candidates | `false` |

use std::net::{Ipv4Addr, SocketAddr};

use crate::connection::ConnectionConfig;
use crate::discovery::DiscoveryConfig;
use crate::identity::default_instance_name;

/// Well-known signaling port.
pub const DEFAULT_SIGNALING_PORT: u16 = 9090;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: invalid value {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Everything the hub needs to start.
#[derive(Debug, Clone)]
pub struct CollabConfig {
    pub instance_name: String,
    /// Signaling listener address
    pub listen_addr: SocketAddr,
    pub discovery: DiscoveryConfig,
    pub connection: ConnectionConfig,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_SIGNALING_PORT)),
            discovery: DiscoveryConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl CollabConfig {
    /// Defaults overridden by `RYTON_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns per variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let get = |key: &'static str| lookup(key).map(|v| v.trim().to_string());

        if let Some(name) = get("RYTON_NAME").filter(|n| !n.is_empty()) {
            config.instance_name = name;
        }
        if let Some(value) = get("RYTON_LISTEN") {
            config.listen_addr = value.parse().map_err(|_| invalid("RYTON_LISTEN", &value, "expected ip:port"))?;
        }
        if let Some(value) = get("RYTON_ICE_SERVERS") {
            config.connection.ice_servers = value
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(value) = get("RYTON_DISCOVERY") {
            config.discovery.enabled = parse_flag("RYTON_DISCOVERY", &value)?;
        }
        if let Some(value) = get("RYTON_DISCOVERY_SERVICE") {
            if !is_service_type(&value) {
                return Err(invalid("RYTON_DISCOVERY_SERVICE", &value, "expected _name._tcp.local."));
            }
            config.discovery.service_type = value;
        }
        if let Some(value) = get("RYTON_LOOPBACK_CANDIDATES") {
            config.connection.include_loopback_candidates = parse_flag("RYTON_LOOPBACK_CANDIDATES", &value)?;
        }
        Ok(config)
    }
}

fn invalid(key: &'static str, value: &str, reason: &'static str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason,
    }
}

fn is_service_type(value: &str) -> bool {
    let Some(name) = value
        .strip_suffix("._tcp.local.")
        .or_else(|| value.strip_suffix("._udp.local."))
    else {
        return false;
    };
    name.len() > 1 && name.starts_with('_') && !name.contains('.')
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value, "expected true or false")),
    }
}
