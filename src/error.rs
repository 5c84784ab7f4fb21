//! Error types for the resolver.

use std::io;

use thiserror::Error;

/// Failure to encode a query name.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    #[error("name exceeds the label or total length limit")]
    NameTooLong,
    #[error("name contains an empty label")]
    EmptyLabel,
}

/// Failure to decode a reply datagram.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),
    #[error("malformed name: {0}")]
    MalformedName(&'static str),
}

/// Synchronous failure of [`Resolver::start_request`](crate::Resolver::start_request).
///
/// No request exists and nothing was sent when one of these is returned.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartError {
    #[error("no upstream server available")]
    NoUpstreamsAvailable,
    #[error("name exceeds the label or total length limit")]
    NameTooLong,
    #[error("name contains an empty label")]
    EmptyLabel,
    #[error("every transaction id is in flight")]
    IdSpaceExhausted,
    #[error("session already destroyed")]
    SessionClosed,
    #[error("resolver has been shut down")]
    Shutdown,
}

impl From<EncodeError> for StartError {
    fn from(e: EncodeError) -> Self {
        match e {
            EncodeError::NameTooLong => StartError::NameTooLong,
            EncodeError::EmptyLabel => StartError::EmptyLabel,
        }
    }
}

/// Invalid resolver configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no upstream server configured")]
    NoServers,
    #[error("too many upstream servers: {0}")]
    TooManyServers(usize),
    #[error("invalid upstream address {0:?}")]
    BadServer(String),
    #[error("request timeout must be non-zero")]
    ZeroTimeout,
    #[error("empty transaction id range")]
    EmptyIdRange,
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Unknown record type name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unsupported record type {0:?}")]
pub struct ParseRecordTypeError(pub String);
