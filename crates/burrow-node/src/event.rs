//! Events emitted by a running node

use std::net::SocketAddr;

use burrow_dht::NodeId;
use bytes::Bytes;

/// Why a connection left the established state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The local application asked for the close.
    Explicit,
    /// The handshake window elapsed without completion.
    HandshakeTimeout,
    /// Keepalives went unanswered past the grace window.
    Unreachable,
    /// The shared socket failed.
    SocketError,
    /// The node is shutting down.
    Shutdown,
}

/// Asynchronous events delivered to the application.
#[derive(Debug)]
pub enum NodeEvent {
    /// A peer announcing the node's topic was found in the DHT.
    PeerDiscovered {
        /// Observed transport address of the peer.
        addr: SocketAddr,
    },
    /// A secure session with a peer is established.
    Connected {
        /// The peer's node id, learned during the handshake.
        peer: NodeId,
        /// The peer's transport address.
        addr: SocketAddr,
    },
    /// Decrypted application payload from an established peer.
    Data {
        /// Sending peer.
        peer: NodeId,
        /// Plaintext payload.
        payload: Bytes,
    },
    /// An established or pending connection ended.
    Closed {
        /// The peer's node id, when the handshake got far enough to
        /// learn it.
        peer: Option<NodeId>,
        /// The peer's transport address.
        addr: SocketAddr,
        /// Why the connection ended.
        reason: CloseReason,
    },
    /// A background task hit a non-fatal error.
    Error {
        /// Human-readable description.
        message: String,
    },
}
