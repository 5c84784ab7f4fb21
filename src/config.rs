//! Resolver configuration.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::upstream::{HealthPolicy, MAX_SERVERS};

pub const DNS_PORT: u16 = 53;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_MAX_RETRANSMITS: u32 = 3;

/// One upstream server: where to send and what to call it in logs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub addr: SocketAddr,
    pub name: String,
}

impl FromStr for UpstreamConfig {
    type Err = ConfigError;

    /// Accepts `ip`, `ip:port`, `[ipv6]` and `[ipv6]:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let addr = if let Ok(addr) = s.parse::<SocketAddr>() {
            addr
        } else {
            let host = s.trim_start_matches('[').trim_end_matches(']');
            let ip = host
                .parse::<IpAddr>()
                .map_err(|_| ConfigError::BadServer(s.to_string()))?;
            SocketAddr::new(ip, DNS_PORT)
        };

        Ok(UpstreamConfig {
            addr,
            name: s.to_string(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolverConfig {
    pub servers: Vec<UpstreamConfig>,
    /// Time to wait for a reply before retransmitting.
    pub timeout: Duration,
    /// Retransmissions after the first send before giving up.
    pub max_retransmits: u32,
    pub health: HealthPolicy,
    /// Transaction IDs handed out by the permutor.
    pub id_range: RangeInclusive<u16>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            servers: Vec::new(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            max_retransmits: DEFAULT_MAX_RETRANSMITS,
            health: HealthPolicy::default(),
            id_range: 0..=u16::MAX,
        }
    }
}

impl ResolverConfig {
    pub fn with_servers(servers: Vec<UpstreamConfig>) -> Self {
        ResolverConfig {
            servers,
            ..Default::default()
        }
    }

    /// Fill in servers from a resolv.conf file when none are configured.
    pub fn or_resolv_conf(mut self, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        if self.servers.is_empty() {
            let path = path.as_ref();
            let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            self.servers = parse_resolv_conf(&contents);
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::NoServers);
        }
        if self.servers.len() > MAX_SERVERS {
            return Err(ConfigError::TooManyServers(self.servers.len()));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.id_range.is_empty() {
            return Err(ConfigError::EmptyIdRange);
        }
        Ok(())
    }
}

/// Collect `nameserver` entries, keeping at most [`MAX_SERVERS`].
///
/// Unparsable entries are skipped.
pub fn parse_resolv_conf(contents: &str) -> Vec<UpstreamConfig> {
    contents
        .lines()
        .filter_map(|line| {
            let line = line.split(['#', ';']).next()?.trim();
            let mut fields = line.split_whitespace();
            if fields.next()? != "nameserver" {
                return None;
            }
            fields.next()?.parse().ok()
        })
        .take(MAX_SERVERS)
        .collect()
}
