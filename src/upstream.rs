//! Upstream DNS servers.
//!
//! Each server owns a UDP socket connected to its address, so the kernel
//! only hands us datagrams that really come from that server. Health is
//! tracked passively from what the resolver observes (send failures and
//! timeouts); no health checks are sent to a server.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;

use crate::config::UpstreamConfig;
use crate::error::StartError;

/// Most servers a pool accepts.
pub const MAX_SERVERS: usize = 16;

const DEFAULT_ERROR_TIME: Duration = Duration::from_secs(10);
const DEFAULT_DEAD_TIME: Duration = Duration::from_secs(300);
const DEFAULT_MAX_ERRORS: u32 = 4;
/// Longest a server is kept out of rotation, whatever the policy says.
const MAX_DEAD_TIME: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// When repeated failures take a server out of rotation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HealthPolicy {
    /// Window in which failures are counted together.
    pub error_time: Duration,
    /// How long a server stays out of rotation, capped at one week.
    pub dead_time: Duration,
    /// Failures within `error_time` that mark a server dead.
    pub max_errors: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        HealthPolicy {
            error_time: DEFAULT_ERROR_TIME,
            dead_time: DEFAULT_DEAD_TIME,
            max_errors: DEFAULT_MAX_ERRORS,
        }
    }
}

#[derive(Debug, Default)]
struct Health {
    errors: u32,
    window_start: Option<Instant>,
    dead_until: Option<Instant>,
}

pub struct Upstream {
    addr: SocketAddr,
    name: String,
    socket: UdpSocket,
    health: Health,
}

impl Upstream {
    async fn connect(config: &UpstreamConfig) -> io::Result<Self> {
        let local: SocketAddr = if config.addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(config.addr).await?;

        Ok(Self {
            addr: config.addr,
            name: config.name.clone(),
            socket,
            health: Health::default(),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Whether the server is in rotation at `now`.
    pub fn is_alive(&self, now: Instant) -> bool {
        match self.health.dead_until {
            Some(until) => now >= until,
            None => true,
        }
    }
}

/// Round-robin pool of upstream servers.
pub struct UpstreamPool {
    servers: Vec<Upstream>,
    next: usize,
    policy: HealthPolicy,
}

impl UpstreamPool {
    /// Bind one connected socket per configured server.
    pub async fn bind(configs: &[UpstreamConfig], policy: HealthPolicy) -> io::Result<Self> {
        if configs.len() > MAX_SERVERS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "too many upstream servers",
            ));
        }

        let mut servers = Vec::with_capacity(configs.len());
        for config in configs {
            servers.push(Upstream::connect(config).await?);
        }

        Ok(Self {
            servers,
            next: 0,
            policy,
        })
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Upstream> {
        self.servers.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Upstream> {
        self.servers.iter()
    }

    /// Pick the next live server after the previously selected one.
    ///
    /// Servers whose dead time has passed rejoin the rotation here.
    pub fn select(&mut self, now: Instant) -> Result<usize, StartError> {
        let count = self.servers.len();

        for offset in 0..count {
            let index = (self.next + offset) % count;
            let server = &mut self.servers[index];

            if !server.is_alive(now) {
                continue;
            }
            if server.health.dead_until.take().is_some() {
                server.health.errors = 0;
                server.health.window_start = None;
            }

            self.next = (index + 1) % count;
            return Ok(index);
        }

        Err(StartError::NoUpstreamsAvailable)
    }

    /// Record a failed exchange; enough failures inside the error window
    /// take the server out of rotation for the dead time.
    pub fn mark_failed(&mut self, index: usize, now: Instant) {
        let policy = self.policy;
        let Some(server) = self.servers.get_mut(index) else {
            return;
        };
        let health = &mut server.health;
        if health.dead_until.is_some() {
            return;
        }

        match health.window_start {
            Some(start) if now.saturating_duration_since(start) <= policy.error_time => {
                health.errors += 1;
            }
            _ => {
                health.window_start = Some(now);
                health.errors = 1;
            }
        }

        if health.errors >= policy.max_errors {
            let dead_time = policy.dead_time.min(MAX_DEAD_TIME);
            health.dead_until = Some(now.checked_add(dead_time).unwrap_or(now));
            health.errors = 0;
            health.window_start = None;
        }
    }

    /// Record a successful exchange.
    pub fn mark_ok(&mut self, index: usize) {
        if let Some(server) = self.servers.get_mut(index) {
            server.health.errors = 0;
            server.health.window_start = None;
        }
    }

    /// Drop every server and its socket.
    pub fn close(&mut self) {
        self.servers.clear();
        self.next = 0;
    }
}
