//! mailresolv - asynchronous UDP DNS resolver core for mail filtering.
//!
//! A single-threaded resolver that multiplexes queries for A, PTR, MX, TXT,
//! SPF and SRV records over connected UDP sockets to a pool of upstream
//! servers. Transaction IDs come from a keyed permutation so they cannot be
//! predicted from earlier queries, and replies are only accepted when they
//! echo the question that was asked.
//!
//! ```no_run
//! use mailresolv::{AsyncSession, RecordType, Resolver, ResolverConfig};
//!
//! # async fn demo() -> std::io::Result<()> {
//! let config = ResolverConfig::with_servers(vec!["192.0.2.53".parse().unwrap()]);
//! let resolver = Resolver::spawn(&config, tracing::Span::current()).await?;
//! let session = AsyncSession::new();
//!
//! resolver
//!     .start_request("example.com", RecordType::Mx, &session, |reply| {
//!         for element in reply.elements() {
//!             println!("{element}");
//!         }
//!     })
//!     .ok();
//! session.wait_drained().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dns;
pub mod error;
pub mod permutor;
pub mod request;
pub mod resolver;
pub mod session;
pub mod stats;
pub mod upstream;

pub use config::{ResolverConfig, UpstreamConfig};
pub use dns::{RecordType, Reply, ReplyElement, ResponseCode};
pub use error::{ConfigError, DecodeError, EncodeError, StartError};
pub use permutor::Permutor;
pub use request::{RequestHandle, RequestState};
pub use resolver::Resolver;
pub use session::AsyncSession;
pub use stats::{ResolverStats, StatsSnapshot};
