// src/network/dns.rs
//! Host resolver defaults.
//!
//! When the server configuration carries no DNS settings, clients are handed
//! the resolver configuration of the machine the server runs on.

use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Resolver servers and search domains
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Name server addresses
    pub servers: Vec<String>,
    /// Search domains
    pub search_domains: Vec<String>,
}

/// Parse resolv.conf formatted text.
///
/// `search` replaces the domain list, `domain` is only used when no
/// `search` line is present (matching the resolver's own precedence).
pub fn parse_resolv_conf(content: &str) -> ResolverConfig {
    let mut config = ResolverConfig::default();
    let mut domain = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("nameserver") => {
                if let Some(server) = parts.next() {
                    config.servers.push(server.to_string());
                }
            }
            Some("search") => {
                config.search_domains = parts.map(String::from).collect();
            }
            Some("domain") => {
                domain = parts.next().map(String::from);
            }
            _ => {}
        }
    }

    if config.search_domains.is_empty() {
        if let Some(domain) = domain {
            config.search_domains.push(domain);
        }
    }

    config
}

/// Read the resolver configuration from a file, empty if it cannot be read
pub fn resolver_from_file(path: &Path) -> ResolverConfig {
    match fs::read_to_string(path) {
        Ok(content) => {
            let config = parse_resolv_conf(&content);
            debug!(
                "dns: servers {:?}, search domains {:?}",
                config.servers, config.search_domains
            );
            config
        }
        Err(e) => {
            warn!("Failed to read resolver configuration {}: {}", path.display(), e);
            ResolverConfig::default()
        }
    }
}

/// Copy the default resolver configuration of the host
pub fn system_resolver() -> ResolverConfig {
    resolver_from_file(Path::new(crate::config::defaults::DEFAULT_RESOLV_CONF))
}
