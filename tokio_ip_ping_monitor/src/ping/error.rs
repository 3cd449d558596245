use super::Family;
use std::io;
use std::net::IpAddr;
use thiserror::Error;

/// Engine startup error.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid config: {0}")]
    BadConfig(String),
    #[error("no ICMP connection could be opened")]
    NoConnection,
    #[error("failed to open {family} socket: {source}")]
    Socket {
        family: Family,
        #[source]
        source: io::Error,
    },
    #[error("failed to start listener: {0}")]
    Listener(#[source] io::Error),
}

/// A received datagram that cannot be turned into a reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated {what}: needed {needed} bytes, got {actual}")]
    Truncated {
        what: &'static str,
        needed: usize,
        actual: usize,
    },
    #[error("bad IP version: expected {expected}, got {actual}")]
    BadVersion { expected: u8, actual: u8 },
    #[error("bad IP header length: {0}")]
    BadHeaderLength(usize),
    #[error("embedded datagram carries protocol {0}, not ICMP")]
    UnexpectedProtocol(u8),
    #[error("embedded ICMP message of type {0} is not an echo request")]
    NotAnEchoRequest(u8),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    #[error("sequence {sequence} already held by a request to {holder}")]
    Occupied { sequence: u16, holder: IpAddr },
}
