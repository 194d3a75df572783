//! Peer roster loading and self-address detection.

use crate::config::{ClusterConfig, PeerRoster};
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, warn};

/// `host:port` address of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerEndpoint {
    pub host: String,
    pub port: u16,
}

impl PeerEndpoint {
    /// Parse a `host:port` string.
    pub fn parse(value: &str) -> Result<Self> {
        let parts: Vec<&str> = value.trim().split(':').collect();
        if parts.len() != 2 || parts[0].is_empty() {
            return Err(Error::Config(format!("malformed peer endpoint {:?}", value)));
        }

        let port = parts[1]
            .parse::<u16>()
            .map_err(|_| Error::Config(format!("malformed peer port in {:?}", value)))?;

        Ok(Self {
            host: parts[0].to_string(),
            port,
        })
    }

    /// Lowercased form used to compare against self addresses.
    pub fn normalized(&self) -> String {
        self.to_string().to_ascii_lowercase()
    }
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Every `host:port` this node answers to, lowercased.
pub fn self_endpoints(port: u16, config: &ClusterConfig) -> HashSet<String> {
    let mut hosts = vec!["127.0.0.1".to_string(), "localhost".to_string()];
    hosts.extend(config.local_ip.iter().cloned());
    hosts.extend(config.public_ip.iter().cloned());
    hosts.extend(config.domain.iter().cloned());

    hosts
        .into_iter()
        .filter(|h| !h.trim().is_empty())
        .map(|h| format!("{}:{}", h.trim().to_ascii_lowercase(), port))
        .collect()
}

/// Read the roster source. Malformed entries are logged and skipped. A
/// roster file that cannot be read yields an empty roster.
pub fn load_roster(roster: &PeerRoster) -> Vec<PeerEndpoint> {
    match roster {
        PeerRoster::Static(peers) => parse_lines(peers.iter().map(String::as_str)),
        PeerRoster::File(path) => match std::fs::read_to_string(path) {
            Ok(content) => parse_lines(content.lines()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read peer roster");
                Vec::new()
            }
        },
    }
}

fn parse_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<PeerEndpoint> {
    let mut seen = HashSet::new();
    let mut endpoints = Vec::new();

    for line in lines {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match PeerEndpoint::parse(line) {
            Ok(endpoint) => {
                if seen.insert(endpoint.normalized()) {
                    endpoints.push(endpoint);
                } else {
                    debug!(endpoint = %endpoint, "Duplicate roster entry");
                }
            }
            Err(e) => warn!(line, error = %e, "Skipping malformed roster line"),
        }
    }

    endpoints
}
