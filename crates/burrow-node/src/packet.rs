//! Wire framing for the shared UDP socket
//!
//! Every datagram starts with a one-byte tag so the read loop can
//! route DHT traffic, liveness probes, handshakes, and encrypted
//! payloads without trial decryption.

use burrow_dht::NodeId;
use bytes::{BufMut, Bytes, BytesMut};

/// KRPC bencode message follows.
pub const TAG_DHT: u8 = 0x01;
/// Liveness probe, also used as the hole punch payload.
pub const TAG_PING: u8 = 0x02;
/// Reply to a probe.
pub const TAG_PONG: u8 = 0x03;
/// Handshake opener carrying the initiator's public key.
pub const TAG_HANDSHAKE_INIT: u8 = 0x04;
/// Handshake answer carrying the responder's public key.
pub const TAG_HANDSHAKE_RESP: u8 = 0x05;
/// Encrypted application envelope.
pub const TAG_PAYLOAD: u8 = 0x06;

/// Correlation id carried by handshake frames, echoed in the answer.
pub type CorrelationId = [u8; 8];

/// A parsed inbound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// KRPC bytes, handed to the DHT layer undecoded.
    Dht(Bytes),
    /// Liveness probe from `sender`.
    Ping(NodeId),
    /// Probe reply from `sender`.
    Pong(NodeId),
    /// Handshake opener.
    HandshakeInit {
        /// Echoed back in the matching answer.
        correlation: CorrelationId,
        /// The initiator's node id.
        sender: NodeId,
        /// The initiator's ephemeral public key.
        public_key: [u8; 32],
    },
    /// Handshake answer.
    HandshakeResp {
        /// Correlation id from the opener being answered.
        correlation: CorrelationId,
        /// The responder's node id.
        sender: NodeId,
        /// The responder's ephemeral public key.
        public_key: [u8; 32],
    },
    /// Encrypted envelope, still sealed.
    Payload(Bytes),
}

impl Frame {
    /// Parses a raw datagram.
    ///
    /// Returns `None` for unknown tags and truncated frames. Stray
    /// internet noise on the shared port is expected and dropped.
    #[must_use]
    pub fn parse(data: &[u8]) -> Option<Self> {
        let (&tag, rest) = data.split_first()?;
        match tag {
            TAG_DHT => Some(Self::Dht(Bytes::copy_from_slice(rest))),
            TAG_PING => Some(Self::Ping(NodeId::from_slice(rest)?)),
            TAG_PONG => Some(Self::Pong(NodeId::from_slice(rest)?)),
            TAG_HANDSHAKE_INIT | TAG_HANDSHAKE_RESP => {
                if rest.len() != 8 + NodeId::LEN + 32 {
                    return None;
                }
                let mut correlation = [0u8; 8];
                correlation.copy_from_slice(&rest[..8]);
                let sender = NodeId::from_slice(&rest[8..8 + NodeId::LEN])?;
                let mut public_key = [0u8; 32];
                public_key.copy_from_slice(&rest[8 + NodeId::LEN..]);
                if tag == TAG_HANDSHAKE_INIT {
                    Some(Self::HandshakeInit { correlation, sender, public_key })
                } else {
                    Some(Self::HandshakeResp { correlation, sender, public_key })
                }
            }
            TAG_PAYLOAD => Some(Self::Payload(Bytes::copy_from_slice(rest))),
            _ => None,
        }
    }

    /// Serializes the frame for the wire.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::Dht(body) => {
                buf.put_u8(TAG_DHT);
                buf.put_slice(body);
            }
            Self::Ping(sender) => {
                buf.put_u8(TAG_PING);
                buf.put_slice(sender.as_bytes());
            }
            Self::Pong(sender) => {
                buf.put_u8(TAG_PONG);
                buf.put_slice(sender.as_bytes());
            }
            Self::HandshakeInit { correlation, sender, public_key } => {
                buf.put_u8(TAG_HANDSHAKE_INIT);
                buf.put_slice(correlation);
                buf.put_slice(sender.as_bytes());
                buf.put_slice(public_key);
            }
            Self::HandshakeResp { correlation, sender, public_key } => {
                buf.put_u8(TAG_HANDSHAKE_RESP);
                buf.put_slice(correlation);
                buf.put_slice(sender.as_bytes());
                buf.put_slice(public_key);
            }
            Self::Payload(envelope) => {
                buf.put_u8(TAG_PAYLOAD);
                buf.put_slice(envelope);
            }
        }
        buf.freeze()
    }
}
