//! Peer networking layer
//!
//! Contains:
//! - Envelope: the UTF-8 JSON datagram wire format
//! - Transport: request/response over a shared UDP socket with
//!   correlation ids, response deadlines and (namespace, type) dispatch
//! - HTTP: a minimal content server and client for bulk item transfer
//!   (datagrams carry control traffic only)
//! - Parse: hand-rolled HTTP header helpers shared by the content
//!   server and the gateway

pub mod envelope;
pub mod http;
pub mod parse;
pub mod transport;

pub use envelope::Envelope;
pub use transport::{Handler, HandlerFuture, Transport};

/// Errors from the peer messaging layer.
#[derive(Debug)]
pub enum NetError {
    /// No response arrived before the deadline
    Timeout,
    /// Every addressed peer answered with an error
    NoResponse,
    /// No peers to address
    NoPeers,
    /// The remote peer answered with an error
    Remote(String),
    /// Socket or stream failure
    Io(String),
    /// The exchange produced bytes we could not interpret
    Malformed(String),
}

impl std::fmt::Display for NetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetError::Timeout => write!(f, "no response before the deadline"),
            NetError::NoResponse => write!(f, "every peer answered with an error"),
            NetError::NoPeers => write!(f, "no peers to address"),
            NetError::Remote(e) => write!(f, "remote error: {}", e),
            NetError::Io(e) => write!(f, "io error: {}", e),
            NetError::Malformed(e) => write!(f, "malformed message: {}", e),
        }
    }
}

impl std::error::Error for NetError {}

impl From<std::io::Error> for NetError {
    fn from(e: std::io::Error) -> Self {
        NetError::Io(e.to_string())
    }
}
