//! Node error types

use thiserror::Error;

/// Errors surfaced by node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The listen socket could not be bound.
    #[error("failed to bind listen socket: {0}")]
    Bind(#[source] std::io::Error),

    /// A socket send or receive failed.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// A DHT operation failed.
    #[error("dht error: {0}")]
    Dht(#[from] burrow_dht::DhtError),

    /// A cryptographic operation failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] burrow_crypto::CryptoError),

    /// The peer did not complete the handshake in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The peer stopped responding to keepalives.
    #[error("peer unreachable")]
    Unreachable,

    /// No path to the peer could be opened.
    #[error("hole punch to peer failed")]
    PunchFailed,

    /// The node is not running or the connection is closed.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Too many handshakes already in flight.
    #[error("too many connection attempts in flight")]
    Busy,

    /// The connection was closed while the operation was pending.
    #[error("connection closed")]
    Closed,
}

impl NodeError {
    /// Whether retrying the same operation later could succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::HandshakeTimeout | Self::Unreachable | Self::PunchFailed | Self::Busy
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(NodeError::Busy.is_transient());
        assert!(NodeError::HandshakeTimeout.is_transient());
        assert!(!NodeError::InvalidState("stopped").is_transient());
    }
}
