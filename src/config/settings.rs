// src/config/settings.rs
//! Server configuration settings.
//!
//! This module contains the command line arguments and the server settings
//! loaded from the configuration file. The settings mapping is what clients
//! receive as their tunnel settings, so the address pool parameters are
//! removed from it once the pool has been read.

use clap::Parser;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::constants::HOST_NETMASK;
use crate::config::defaults;
use crate::network::dns::{self, ResolverConfig};

/// Keys of the settings mapping
pub mod keys {
    pub const IPV4: &str = "IPv4";
    pub const POOL: &str = "Pool";
    pub const ADDRESS: &str = "Address";
    pub const NETMASK: &str = "Netmask";
    pub const DNS: &str = "DNS";
    pub const SERVERS: &str = "Servers";
    pub const SEARCH_DOMAINS: &str = "SearchDomains";
}

/// Error type for configuration-related operations
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing setting: {0}")]
    MissingSetting(String),

    #[error("Invalid socket address: {0}")]
    InvalidSocketAddr(#[from] std::net::AddrParseError),
}

/// Command line arguments for the server
#[derive(Parser, Debug, Clone)]
#[clap(
    name = "tunnel-server",
    about = "Multiplexes TCP, UDP and IP flows from tunnel clients over one control connection",
    version,
    author
)]
pub struct ServerArgs {
    /// Port to accept control connections on
    pub port: u16,

    /// Server configuration file (JSON)
    pub config_file: PathBuf,

    /// Address to listen on
    #[clap(long, default_value = defaults::DEFAULT_LISTEN_ADDRESS)]
    pub listen_address: String,

    /// Log level
    #[clap(long, default_value = defaults::DEFAULT_LOG_LEVEL)]
    pub log_level: String,

    /// Also write logs to this file (rotated daily)
    #[clap(long)]
    pub log_file: Option<String>,

    /// MTU of the virtual interfaces created for IP flows
    #[clap(long, default_value_t = defaults::DEFAULT_TUN_MTU)]
    pub tun_mtu: u16,
}

impl ServerArgs {
    /// Socket address the listener binds to
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip = self.listen_address.parse()?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Settings loaded from the configuration file
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Tunnel settings sent to clients, pool parameters removed
    configuration: Map<String, Value>,
    /// First address of the client address pool
    pool_start: String,
    /// End of the client address pool (exclusive)
    pool_end: String,
}

impl ServerSettings {
    /// Load settings from a file, filling DNS defaults from the host
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&content)?;
        let settings = Self::from_value(value, dns::system_resolver)?;
        info!("Loaded server configuration from {}", path.display());
        Ok(settings)
    }

    /// Build settings from a parsed configuration document.
    ///
    /// `system_dns` is only consulted when the document has no DNS mapping.
    pub fn from_value<F>(value: Value, system_dns: F) -> Result<Self, ConfigError>
    where
        F: FnOnce() -> ResolverConfig,
    {
        let mut configuration = match value {
            Value::Object(map) => map,
            _ => {
                return Err(ConfigError::Invalid(
                    "configuration must be a mapping".to_string(),
                ))
            }
        };

        let pool = pool_settings(&configuration)?;
        let pool_start = pool
            .start_address
            .ok_or_else(|| ConfigError::MissingSetting("v4 start address".to_string()))?;
        let pool_end = pool
            .end_address
            .ok_or_else(|| ConfigError::MissingSetting("v4 end address".to_string()))?;

        if let Some(Value::Object(ipv4)) = configuration.get_mut(keys::IPV4) {
            ipv4.remove(keys::POOL);
        }

        if !configuration.contains_key(keys::DNS) {
            let resolver = system_dns();
            debug!("No DNS settings configured, using host resolver {:?}", resolver);

            let mut dns = Map::new();
            dns.insert(keys::SERVERS.to_string(), Value::from(resolver.servers));
            dns.insert(
                keys::SEARCH_DOMAINS.to_string(),
                Value::from(resolver.search_domains),
            );
            configuration.insert(keys::DNS.to_string(), Value::Object(dns));
        }

        Ok(Self {
            configuration,
            pool_start,
            pool_end,
        })
    }

    /// Start and end addresses of the client pool
    pub fn pool_range(&self) -> (&str, &str) {
        (&self.pool_start, &self.pool_end)
    }

    /// The sanitized settings mapping
    pub fn configuration(&self) -> &Map<String, Value> {
        &self.configuration
    }

    /// Settings sent in reply to a configuration fetch (no IPv4 settings)
    pub fn client_configuration(&self) -> Map<String, Value> {
        let mut configuration = self.configuration.clone();
        configuration.remove(keys::IPV4);
        configuration
    }

    /// Settings for an IP flow, with the assigned virtual address.
    ///
    /// Returns `None` when the configuration has no IPv4 mapping.
    pub fn personalized(&self, address: Ipv4Addr) -> Option<Map<String, Value>> {
        let mut configuration = self.configuration.clone();
        let ipv4 = match configuration.get_mut(keys::IPV4) {
            Some(Value::Object(ipv4)) => ipv4,
            _ => return None,
        };

        ipv4.insert(keys::ADDRESS.to_string(), Value::from(address.to_string()));
        ipv4.insert(keys::NETMASK.to_string(), Value::from(HOST_NETMASK));
        Some(configuration)
    }
}

/// `IPv4.Pool` as written in the configuration file
#[derive(Debug, Default, Deserialize)]
struct PoolSettings {
    #[serde(rename = "StartAddress")]
    start_address: Option<String>,
    #[serde(rename = "EndAddress")]
    end_address: Option<String>,
}

fn pool_settings(configuration: &Map<String, Value>) -> Result<PoolSettings, ConfigError> {
    match configuration
        .get(keys::IPV4)
        .and_then(|ipv4| ipv4.get(keys::POOL))
    {
        Some(pool) => Ok(PoolSettings::deserialize(pool)?),
        None => Ok(PoolSettings::default()),
    }
}
