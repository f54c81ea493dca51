//! KRPC message layer
//!
//! Every DHT datagram is a single bencode dictionary with a
//! transaction id (`t`), a message type (`y` of `q`, `r`, or `e`), and
//! either a query method with arguments, a response dictionary, or an
//! error list. Peer endpoints travel as packed 6-byte records (IPv4
//! plus big-endian port) and routing entries as 26-byte records (node
//! id plus endpoint).

use bytes::Bytes;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::bencode::{self, Value};
use crate::error::DhtError;
use crate::node_id::NodeId;

/// Size of a packed IPv4 endpoint.
pub const COMPACT_PEER_LEN: usize = 6;

/// Size of a packed node record (id + endpoint).
pub const COMPACT_NODE_LEN: usize = NodeId::LEN + COMPACT_PEER_LEN;

/// KRPC error code for a generic server error.
pub const ERROR_GENERIC: i64 = 201;

/// KRPC error code for a protocol violation (bad token, malformed args).
pub const ERROR_PROTOCOL: i64 = 203;

/// KRPC error code for an unknown method.
pub const ERROR_UNKNOWN_METHOD: i64 = 204;

/// Query methods understood by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryBody {
    /// Liveness check and identity exchange.
    Ping,
    /// Ask for the responder's closest known peers to a target id.
    FindNode {
        /// Id to search toward.
        target: NodeId,
    },
    /// Ask for peers announced under a topic, plus closer nodes.
    GetPeers {
        /// 160-bit rendezvous key.
        info_hash: NodeId,
    },
    /// Register the sender as a peer for a topic.
    AnnouncePeer {
        /// 160-bit rendezvous key.
        info_hash: NodeId,
        /// Port the announcer accepts traffic on.
        port: u16,
        /// Write token previously issued by a `get_peers` response.
        token: Bytes,
    },
}

impl QueryBody {
    /// Wire name of the method.
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            QueryBody::Ping => "ping",
            QueryBody::FindNode { .. } => "find_node",
            QueryBody::GetPeers { .. } => "get_peers",
            QueryBody::AnnouncePeer { .. } => "announce_peer",
        }
    }
}

/// Fields a responder may return.
///
/// `ping` responses carry only the id. `find_node` fills `nodes`.
/// `get_peers` fills `token` and either `values` (announced peers) or
/// `nodes` (closer nodes to keep walking toward).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseBody {
    /// Responder's node id.
    pub id: Option<NodeId>,
    /// Closer nodes, packed 26 bytes each.
    pub nodes: Vec<NodeInfo>,
    /// Announced peer endpoints for the queried topic.
    pub values: Vec<SocketAddrV4>,
    /// Write token for a later `announce_peer`.
    pub token: Option<Bytes>,
}

/// A complete KRPC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// An incoming or outgoing query.
    Query {
        /// Transaction id echoed by the response.
        txn: Bytes,
        /// Sender's node id.
        id: NodeId,
        /// Method and arguments.
        body: QueryBody,
    },
    /// A response to a query.
    Response {
        /// Transaction id of the query being answered.
        txn: Bytes,
        /// Response fields.
        body: ResponseBody,
    },
    /// An error reply.
    Error {
        /// Transaction id of the query being answered.
        txn: Bytes,
        /// Numeric error code.
        code: i64,
        /// Human-readable description.
        message: String,
    },
}

/// A node id paired with its UDP endpoint, as found in `nodes` lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    /// The node's 160-bit id.
    pub id: NodeId,
    /// The node's IPv4 endpoint.
    pub addr: SocketAddrV4,
}

impl Message {
    /// Transaction id of this message.
    #[must_use]
    pub fn txn(&self) -> &Bytes {
        match self {
            Message::Query { txn, .. }
            | Message::Response { txn, .. }
            | Message::Error { txn, .. } => txn,
        }
    }

    /// Serialize to bencode bytes.
    ///
    /// # Errors
    ///
    /// Returns [`DhtError::Bencode`] if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>, DhtError> {
        let mut root = BTreeMap::new();
        match self {
            Message::Query { txn, id, body } => {
                let mut args = BTreeMap::new();
                args.insert(key("id"), Value::bytes(id.as_bytes()));
                match body {
                    QueryBody::Ping => {}
                    QueryBody::FindNode { target } => {
                        args.insert(key("target"), Value::bytes(target.as_bytes()));
                    }
                    QueryBody::GetPeers { info_hash } => {
                        args.insert(key("info_hash"), Value::bytes(info_hash.as_bytes()));
                    }
                    QueryBody::AnnouncePeer {
                        info_hash,
                        port,
                        token,
                    } => {
                        args.insert(key("info_hash"), Value::bytes(info_hash.as_bytes()));
                        args.insert(key("port"), Value::Integer(i64::from(*port)));
                        args.insert(key("token"), Value::Bytes(token.clone()));
                    }
                }
                root.insert(key("t"), Value::Bytes(txn.clone()));
                root.insert(key("y"), Value::string("q"));
                root.insert(key("q"), Value::string(body.method()));
                root.insert(key("a"), Value::Dict(args));
            }
            Message::Response { txn, body } => {
                let mut fields = BTreeMap::new();
                if let Some(id) = &body.id {
                    fields.insert(key("id"), Value::bytes(id.as_bytes()));
                }
                if !body.nodes.is_empty() {
                    fields.insert(key("nodes"), Value::bytes(&pack_nodes(&body.nodes)));
                }
                if !body.values.is_empty() {
                    let packed = body
                        .values
                        .iter()
                        .map(|addr| Value::bytes(&pack_peer(*addr)))
                        .collect();
                    fields.insert(key("values"), Value::List(packed));
                }
                if let Some(token) = &body.token {
                    fields.insert(key("token"), Value::Bytes(token.clone()));
                }
                root.insert(key("t"), Value::Bytes(txn.clone()));
                root.insert(key("y"), Value::string("r"));
                root.insert(key("r"), Value::Dict(fields));
            }
            Message::Error { txn, code, message } => {
                root.insert(key("t"), Value::Bytes(txn.clone()));
                root.insert(key("y"), Value::string("e"));
                root.insert(
                    key("e"),
                    Value::List(vec![Value::Integer(*code), Value::string(message)]),
                );
            }
        }
        Ok(bencode::encode(&Value::Dict(root))?)
    }

    /// Parse a KRPC message from raw datagram bytes.
    ///
    /// # Errors
    ///
    /// Returns [`DhtError::Bencode`] on malformed bencode and
    /// [`DhtError::Malformed`] on a structurally invalid message.
    pub fn decode(data: &[u8]) -> Result<Self, DhtError> {
        let value = bencode::decode(data)?;
        let txn = value
            .get(b"t")
            .and_then(Value::as_bytes)
            .cloned()
            .ok_or_else(|| DhtError::Malformed("missing transaction id".into()))?;
        let kind = value
            .get(b"y")
            .and_then(Value::as_str)
            .ok_or_else(|| DhtError::Malformed("missing message type".into()))?;

        match kind {
            "q" => decode_query(txn, &value),
            "r" => decode_response(txn, &value),
            "e" => decode_error(txn, &value),
            other => Err(DhtError::Malformed(format!("unknown message type {other:?}"))),
        }
    }
}

fn decode_query(txn: Bytes, value: &Value) -> Result<Message, DhtError> {
    let method = value
        .get(b"q")
        .and_then(Value::as_str)
        .ok_or_else(|| DhtError::Malformed("query without method".into()))?;
    let args = value
        .get(b"a")
        .ok_or_else(|| DhtError::Malformed("query without arguments".into()))?;
    let id = required_id(args, b"id")?;

    let body = match method {
        "ping" => QueryBody::Ping,
        "find_node" => QueryBody::FindNode {
            target: required_id(args, b"target")?,
        },
        "get_peers" => QueryBody::GetPeers {
            info_hash: required_id(args, b"info_hash")?,
        },
        "announce_peer" => {
            let port = args
                .get(b"port")
                .and_then(Value::as_integer)
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| DhtError::Malformed("announce_peer without port".into()))?;
            let token = args
                .get(b"token")
                .and_then(Value::as_bytes)
                .cloned()
                .ok_or_else(|| DhtError::Malformed("announce_peer without token".into()))?;
            QueryBody::AnnouncePeer {
                info_hash: required_id(args, b"info_hash")?,
                port,
                token,
            }
        }
        other => return Err(DhtError::UnknownMethod(other.into())),
    };

    Ok(Message::Query { txn, id, body })
}

fn decode_response(txn: Bytes, value: &Value) -> Result<Message, DhtError> {
    let fields = value
        .get(b"r")
        .ok_or_else(|| DhtError::Malformed("response without fields".into()))?;

    let id = fields
        .get(b"id")
        .and_then(Value::as_bytes)
        .and_then(|b| NodeId::from_slice(b));

    let nodes = match fields.get(b"nodes").and_then(Value::as_bytes) {
        Some(packed) => unpack_nodes(packed)?,
        None => Vec::new(),
    };

    let mut values = Vec::new();
    if let Some(list) = fields.get(b"values").and_then(Value::as_list) {
        for item in list {
            let packed = item
                .as_bytes()
                .ok_or_else(|| DhtError::Malformed("non-string peer value".into()))?;
            values.push(unpack_peer(packed)?);
        }
    }

    let token = fields.get(b"token").and_then(Value::as_bytes).cloned();

    Ok(Message::Response {
        txn,
        body: ResponseBody {
            id,
            nodes,
            values,
            token,
        },
    })
}

fn decode_error(txn: Bytes, value: &Value) -> Result<Message, DhtError> {
    let list = value
        .get(b"e")
        .and_then(Value::as_list)
        .ok_or_else(|| DhtError::Malformed("error without detail list".into()))?;
    let code = list
        .first()
        .and_then(Value::as_integer)
        .ok_or_else(|| DhtError::Malformed("error without code".into()))?;
    let message = list
        .get(1)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok(Message::Error { txn, code, message })
}

fn required_id(args: &Value, field: &[u8]) -> Result<NodeId, DhtError> {
    args.get(field)
        .and_then(Value::as_bytes)
        .and_then(|b| NodeId::from_slice(b))
        .ok_or_else(|| {
            DhtError::Malformed(format!(
                "missing or misshapen id field {:?}",
                String::from_utf8_lossy(field)
            ))
        })
}

fn key(name: &str) -> Bytes {
    Bytes::copy_from_slice(name.as_bytes())
}

/// Pack an IPv4 endpoint into 6 bytes.
#[must_use]
pub fn pack_peer(addr: SocketAddrV4) -> [u8; COMPACT_PEER_LEN] {
    let mut out = [0u8; COMPACT_PEER_LEN];
    out[..4].copy_from_slice(&addr.ip().octets());
    out[4..].copy_from_slice(&addr.port().to_be_bytes());
    out
}

/// Unpack a 6-byte endpoint record.
///
/// # Errors
///
/// Returns [`DhtError::Malformed`] if the slice is not 6 bytes.
pub fn unpack_peer(data: &[u8]) -> Result<SocketAddrV4, DhtError> {
    if data.len() != COMPACT_PEER_LEN {
        return Err(DhtError::Malformed(format!(
            "compact peer record of {} bytes",
            data.len()
        )));
    }
    let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
    let port = u16::from_be_bytes([data[4], data[5]]);
    Ok(SocketAddrV4::new(ip, port))
}

/// Pack node records into a concatenated byte string.
#[must_use]
pub fn pack_nodes(nodes: &[NodeInfo]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * COMPACT_NODE_LEN);
    for node in nodes {
        out.extend_from_slice(node.id.as_bytes());
        out.extend_from_slice(&pack_peer(node.addr));
    }
    out
}

/// Unpack concatenated 26-byte node records.
///
/// # Errors
///
/// Returns [`DhtError::Malformed`] if the length is not a multiple of
/// the record size.
pub fn unpack_nodes(data: &[u8]) -> Result<Vec<NodeInfo>, DhtError> {
    if data.len() % COMPACT_NODE_LEN != 0 {
        return Err(DhtError::Malformed(format!(
            "nodes blob of {} bytes",
            data.len()
        )));
    }
    let mut nodes = Vec::with_capacity(data.len() / COMPACT_NODE_LEN);
    for chunk in data.chunks_exact(COMPACT_NODE_LEN) {
        let id = NodeId::from_slice(&chunk[..NodeId::LEN])
            .ok_or_else(|| DhtError::Malformed("truncated node id".into()))?;
        let addr = unpack_peer(&chunk[NodeId::LEN..])?;
        nodes.push(NodeInfo { id, addr });
    }
    Ok(nodes)
}

/// Normalize a socket address to IPv4.
///
/// The wire format only carries IPv4; IPv6-mapped addresses are
/// unwrapped and native IPv6 endpoints rejected.
#[must_use]
pub fn to_v4(addr: SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Some(v4),
        SocketAddr::V6(v6) => v6
            .ip()
            .to_ipv4_mapped()
            .map(|ip| SocketAddrV4::new(ip, v6.port())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn() -> Bytes {
        Bytes::from_static(b"aa")
    }

    #[test]
    fn test_ping_roundtrip() {
        let msg = Message::Query {
            txn: txn(),
            id: NodeId::from_bytes([7u8; 20]),
            body: QueryBody::Ping,
        };
        let wire = msg.encode().unwrap();
        assert_eq!(Message::decode(&wire).unwrap(), msg);
    }

    #[test]
    fn test_find_node_roundtrip() {
        let msg = Message::Query {
            txn: txn(),
            id: NodeId::random(),
            body: QueryBody::FindNode {
                target: NodeId::random(),
            },
        };
        let wire = msg.encode().unwrap();
        assert_eq!(Message::decode(&wire).unwrap(), msg);
    }

    #[test]
    fn test_announce_roundtrip() {
        let msg = Message::Query {
            txn: txn(),
            id: NodeId::random(),
            body: QueryBody::AnnouncePeer {
                info_hash: NodeId::random(),
                port: 6881,
                token: Bytes::from_static(b"tok12345"),
            },
        };
        let wire = msg.encode().unwrap();
        assert_eq!(Message::decode(&wire).unwrap(), msg);
    }

    #[test]
    fn test_response_with_nodes_and_values() {
        let node = NodeInfo {
            id: NodeId::from_bytes([3u8; 20]),
            addr: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 4000),
        };
        let msg = Message::Response {
            txn: txn(),
            body: ResponseBody {
                id: Some(NodeId::from_bytes([1u8; 20])),
                nodes: vec![node],
                values: vec![SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 2), 9999)],
                token: Some(Bytes::from_static(b"t")),
            },
        };
        let wire = msg.encode().unwrap();
        assert_eq!(Message::decode(&wire).unwrap(), msg);
    }

    #[test]
    fn test_error_roundtrip() {
        let msg = Message::Error {
            txn: txn(),
            code: ERROR_PROTOCOL,
            message: "bad token".into(),
        };
        let wire = msg.encode().unwrap();
        assert_eq!(Message::decode(&wire).unwrap(), msg);
    }

    #[test]
    fn test_compact_peer_is_network_order() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 0x1234);
        assert_eq!(pack_peer(addr), [1, 2, 3, 4, 0x12, 0x34]);
        assert_eq!(unpack_peer(&[1, 2, 3, 4, 0x12, 0x34]).unwrap(), addr);
    }

    #[test]
    fn test_unpack_nodes_rejects_ragged_length() {
        assert!(unpack_nodes(&[0u8; 25]).is_err());
        assert!(unpack_nodes(&[0u8; 52]).is_ok());
    }

    #[test]
    fn test_decode_rejects_missing_txn() {
        assert!(Message::decode(b"d1:y1:qe").is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_method() {
        let wire = b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaae1:q4:stop1:t2:aa1:y1:qe";
        assert!(matches!(
            Message::decode(wire),
            Err(DhtError::UnknownMethod(_))
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Message::decode(b"\xffnot bencode").is_err());
        assert!(Message::decode(b"i42e").is_err());
    }

    #[test]
    fn test_to_v4() {
        let v4: SocketAddr = "1.2.3.4:5000".parse().unwrap();
        assert!(to_v4(v4).is_some());
        let v6: SocketAddr = "[::1]:5000".parse().unwrap();
        assert!(to_v4(v6).is_none());
        let mapped: SocketAddr = "[::ffff:1.2.3.4]:5000".parse().unwrap();
        assert_eq!(to_v4(mapped), Some("1.2.3.4:5000".parse().unwrap()));
    }
}
