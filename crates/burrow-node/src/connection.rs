//! Per-peer connection state
//!
//! A [`Connection`] moves through `Handshaking` to `Established` and
//! finally `Closed`. State changes are published on a watch channel so
//! any number of concurrent `connect` callers can await the same
//! handshake without coordinating with the read loop.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use burrow_crypto::SecureChannel;
use burrow_dht::NodeId;
use tokio::sync::watch;

use crate::error::NodeError;
use crate::event::CloseReason;
use crate::packet::CorrelationId;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Key exchange in progress.
    Handshaking,
    /// Session key agreed, payloads flow.
    Established(NodeId),
    /// Terminal.
    Closed(CloseReason),
}

/// One peer's slot in the connection table.
#[derive(Debug)]
pub struct Connection {
    addr: SocketAddr,
    correlation: CorrelationId,
    state_tx: watch::Sender<ConnectionState>,
    channel: Mutex<Option<SecureChannel>>,
    last_seen: Mutex<Instant>,
}

impl Connection {
    /// Creates a connection in the handshaking state.
    #[must_use]
    pub fn new(addr: SocketAddr, correlation: CorrelationId) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Handshaking);
        Self {
            addr,
            correlation,
            state_tx,
            channel: Mutex::new(None),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    /// The peer's transport address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Correlation id of the handshake this connection was opened with.
    #[must_use]
    pub fn correlation(&self) -> CorrelationId {
        self.correlation
    }

    /// Current state snapshot.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// The peer's node id once the handshake has revealed it.
    #[must_use]
    pub fn peer_id(&self) -> Option<NodeId> {
        match self.state() {
            ConnectionState::Established(id) => Some(id),
            _ => None,
        }
    }

    /// Installs the session channel and publishes `Established`.
    ///
    /// Returns false when the connection already left the handshaking
    /// state; late or duplicate handshake answers are ignored.
    pub fn establish(&self, peer: NodeId, channel: SecureChannel) -> bool {
        let mut installed = false;
        self.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Handshaking {
                *state = ConnectionState::Established(peer);
                installed = true;
                true
            } else {
                false
            }
        });
        if installed {
            *self.channel.lock().unwrap() = Some(channel);
            self.touch();
        }
        installed
    }

    /// Moves to `Closed` unless already closed. Returns false when the
    /// connection was closed before.
    pub fn close(&self, reason: CloseReason) -> bool {
        let mut closed = false;
        self.state_tx.send_if_modified(|state| {
            if matches!(state, ConnectionState::Closed(_)) {
                false
            } else {
                *state = ConnectionState::Closed(reason);
                closed = true;
                true
            }
        });
        if closed {
            *self.channel.lock().unwrap() = None;
        }
        closed
    }

    /// Waits for the handshake to finish, resolving to the peer id.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::HandshakeTimeout`], [`NodeError::Unreachable`]
    /// or [`NodeError::Closed`] depending on why the connection closed
    /// instead of establishing.
    pub async fn wait_established(&self) -> Result<NodeId, NodeError> {
        let mut rx = self.state_tx.subscribe();
        loop {
            match *rx.borrow_and_update() {
                ConnectionState::Established(id) => return Ok(id),
                ConnectionState::Closed(reason) => return Err(close_error(reason)),
                ConnectionState::Handshaking => {}
            }
            if rx.changed().await.is_err() {
                return Err(NodeError::Closed);
            }
        }
    }

    /// Encrypts a payload for this peer.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidState`] when the session is not
    /// established, or a crypto error from sealing.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, NodeError> {
        let mut guard = self.channel.lock().unwrap();
        let channel = guard
            .as_mut()
            .ok_or(NodeError::InvalidState("connection not established"))?;
        Ok(channel.seal(plaintext)?)
    }

    /// Decrypts an inbound envelope from this peer.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidState`] when the session is not
    /// established, or a crypto error on authentication failure.
    pub fn open(&self, envelope: &[u8]) -> Result<Vec<u8>, NodeError> {
        let mut guard = self.channel.lock().unwrap();
        let channel = guard
            .as_mut()
            .ok_or(NodeError::InvalidState("connection not established"))?;
        Ok(channel.open(envelope)?)
    }

    /// Records peer activity for keepalive accounting.
    pub fn touch(&self) {
        *self.last_seen.lock().unwrap() = Instant::now();
    }

    /// Time since the last datagram from this peer.
    #[must_use]
    pub fn idle(&self) -> Duration {
        self.last_seen.lock().unwrap().elapsed()
    }
}

fn close_error(reason: CloseReason) -> NodeError {
    match reason {
        CloseReason::HandshakeTimeout => NodeError::HandshakeTimeout,
        CloseReason::Unreachable => NodeError::Unreachable,
        _ => NodeError::Closed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_crypto::AeadKey;
    use rand::rngs::OsRng;

    fn test_channel() -> SecureChannel {
        SecureChannel::new(AeadKey::generate(&mut OsRng))
    }

    fn test_conn() -> Connection {
        Connection::new("127.0.0.1:4000".parse().unwrap(), [1; 8])
    }

    #[test]
    fn test_establish_once() {
        let conn = test_conn();
        let peer = NodeId::random();

        assert!(conn.establish(peer, test_channel()));
        assert_eq!(conn.peer_id(), Some(peer));

        // A duplicate handshake answer must not replace the session.
        assert!(!conn.establish(NodeId::random(), test_channel()));
        assert_eq!(conn.peer_id(), Some(peer));
    }

    #[test]
    fn test_close_is_terminal() {
        let conn = test_conn();
        assert!(conn.close(CloseReason::Explicit));
        assert!(!conn.close(CloseReason::Unreachable));
        assert_eq!(conn.state(), ConnectionState::Closed(CloseReason::Explicit));
        assert!(!conn.establish(NodeId::random(), test_channel()));
    }

    #[test]
    fn test_seal_requires_established() {
        let conn = test_conn();
        assert!(matches!(
            conn.seal(b"early"),
            Err(NodeError::InvalidState(_))
        ));
    }

    #[test]
    fn test_seal_open_through_matching_channels() {
        let key = AeadKey::generate(&mut OsRng);
        let a = test_conn();
        let b = test_conn();
        let id = NodeId::random();
        a.establish(id, SecureChannel::new(key.clone()));
        b.establish(id, SecureChannel::new(key));

        let envelope = a.seal(b"over the wire").unwrap();
        assert_eq!(b.open(&envelope).unwrap(), b"over the wire");
    }

    #[tokio::test]
    async fn test_wait_established_resolves() {
        let conn = std::sync::Arc::new(test_conn());
        let peer = NodeId::random();

        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.wait_established().await })
        };
        tokio::task::yield_now().await;
        conn.establish(peer, test_channel());

        assert_eq!(waiter.await.unwrap().unwrap(), peer);
    }

    #[tokio::test]
    async fn test_wait_established_sees_timeout_close() {
        let conn = std::sync::Arc::new(test_conn());
        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.wait_established().await })
        };
        tokio::task::yield_now().await;
        conn.close(CloseReason::HandshakeTimeout);

        assert!(matches!(
            waiter.await.unwrap(),
            Err(NodeError::HandshakeTimeout)
        ));
    }
}
