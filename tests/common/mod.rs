//! Loopback upstream server for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;

use mailresolv::dns::Question;
use mailresolv::{ResolverConfig, UpstreamConfig};

const WAIT: Duration = Duration::from_secs(2);

/// A UDP socket standing in for a recursive server. Tests drive it by hand.
pub struct FakeUpstream {
    socket: UdpSocket,
}

/// A query as seen by the fake upstream.
pub struct Query {
    pub packet: Vec<u8>,
    pub from: SocketAddr,
}

impl Query {
    pub fn id(&self) -> u16 {
        u16::from_be_bytes([self.packet[0], self.packet[1]])
    }

    pub fn question(&self) -> Question {
        Question::parse(&self.packet).expect("query has a question").0
    }

    /// Start a response echoing this query.
    pub fn reply(&self, rcode: u8) -> ReplyBuilder {
        ReplyBuilder::new(self.packet.clone(), rcode)
    }
}

impl FakeUpstream {
    pub async fn bind() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Self { socket }
    }

    pub fn config(&self) -> UpstreamConfig {
        let addr = self.socket.local_addr().unwrap();
        addr.to_string().parse().unwrap()
    }

    pub async fn recv(&self) -> Query {
        self.try_recv(WAIT).await.expect("no query arrived")
    }

    pub async fn try_recv(&self, wait: Duration) -> Option<Query> {
        let mut buf = [0u8; 4096];
        let (len, from) = tokio::time::timeout(wait, self.socket.recv_from(&mut buf))
            .await
            .ok()?
            .unwrap();
        Some(Query {
            packet: buf[..len].to_vec(),
            from,
        })
    }

    pub async fn send(&self, packet: &[u8], to: SocketAddr) {
        self.socket.send_to(packet, to).await.unwrap();
    }
}

/// Appends answers to a copy of the query; owner names point at the
/// question (offset 12).
pub struct ReplyBuilder {
    packet: Vec<u8>,
    answers: u16,
}

impl ReplyBuilder {
    pub fn new(mut packet: Vec<u8>, rcode: u8) -> Self {
        packet[2] |= 0x80;
        packet[3] = 0x80 | (rcode & 0x0f);
        Self { packet, answers: 0 }
    }

    pub fn id(mut self, id: u16) -> Self {
        self.packet[..2].copy_from_slice(&id.to_be_bytes());
        self
    }

    pub fn answer(mut self, rtype: u16, rdata: &[u8]) -> Self {
        self.packet.extend_from_slice(&[0xC0, 0x0C]);
        self.packet.extend_from_slice(&rtype.to_be_bytes());
        self.packet.extend_from_slice(&1u16.to_be_bytes());
        self.packet.extend_from_slice(&300u32.to_be_bytes());
        self.packet.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        self.packet.extend_from_slice(rdata);
        self.answers += 1;
        self
    }

    pub fn build(mut self) -> Vec<u8> {
        self.packet[6..8].copy_from_slice(&self.answers.to_be_bytes());
        self.packet
    }
}

/// Uncompressed wire form of a name.
pub fn wire_name(name: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    for label in name.trim_end_matches('.').split('.') {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
    buf
}

pub fn mx_rdata(priority: u16, name: &str) -> Vec<u8> {
    let mut rdata = priority.to_be_bytes().to_vec();
    rdata.extend(wire_name(name));
    rdata
}

/// Config with test-friendly timeouts.
pub fn config(servers: Vec<UpstreamConfig>) -> ResolverConfig {
    ResolverConfig {
        timeout: Duration::from_millis(500),
        ..ResolverConfig::with_servers(servers)
    }
}
