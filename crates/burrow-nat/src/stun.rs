//! STUN binding subset (RFC 5389)
//!
//! Just enough of STUN to learn the node's public mapping: a binding
//! request, and response parsing for MAPPED-ADDRESS and
//! XOR-MAPPED-ADDRESS. Probes run over the node's shared socket so
//! the mapping the server reports is the one peers will punch toward.
//!
//! A response that fails the magic-cookie check, the transaction-id
//! match, or the success-type check is discarded and the probe keeps
//! waiting; only the timeout ends it.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use crate::error::StunError;

/// STUN magic cookie.
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Fixed STUN header size.
pub const HEADER_SIZE: usize = 20;

/// Binding request message type.
const BINDING_REQUEST: u16 = 0x0001;

/// Binding success response message type.
const BINDING_SUCCESS: u16 = 0x0101;

/// MAPPED-ADDRESS attribute.
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;

/// XOR-MAPPED-ADDRESS attribute.
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// Default per-server probe timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// A binding request with its random 96-bit transaction id.
#[derive(Debug, Clone, Copy)]
pub struct BindingRequest {
    /// Transaction id that the response must echo.
    pub transaction_id: [u8; 12],
}

impl BindingRequest {
    /// Create a request with a fresh random transaction id.
    #[must_use]
    pub fn new() -> Self {
        let mut transaction_id = [0u8; 12];
        use rand::RngCore;
        rand::thread_rng().fill_bytes(&mut transaction_id);
        Self { transaction_id }
    }

    /// Encode the 20-byte request datagram.
    ///
    /// A bare binding request carries no attributes, so the length
    /// field is zero.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
        // out[2..4] stays zero: no attributes.
        out[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        out[8..20].copy_from_slice(&self.transaction_id);
        out
    }
}

impl Default for BindingRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a binding success response and extract the mapped address.
///
/// Unknown attributes are skipped using their declared length padded
/// to a 4-byte boundary. XOR-MAPPED-ADDRESS wins over MAPPED-ADDRESS
/// when both are present. Only IPv4 mappings are understood.
///
/// # Errors
///
/// Returns an error when the datagram is not a success response for
/// `transaction_id` or carries no usable mapping. Callers treat these
/// as "discard and keep waiting", not failures.
pub fn parse_binding_response(
    data: &[u8],
    transaction_id: &[u8; 12],
) -> Result<SocketAddr, StunError> {
    if data.len() < HEADER_SIZE {
        return Err(StunError::Truncated);
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != BINDING_SUCCESS {
        return Err(StunError::NotASuccessResponse(msg_type));
    }

    let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if cookie != MAGIC_COOKIE {
        return Err(StunError::BadMagicCookie);
    }

    if &data[8..20] != transaction_id {
        return Err(StunError::TransactionMismatch);
    }

    let declared_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let end = HEADER_SIZE + declared_len.min(data.len() - HEADER_SIZE);

    let mut mapped = None;
    let mut xor_mapped = None;

    let mut offset = HEADER_SIZE;
    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;
        if offset + attr_len > end {
            break;
        }
        let value = &data[offset..offset + attr_len];

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => xor_mapped = parse_address(value, true),
            ATTR_MAPPED_ADDRESS => mapped = parse_address(value, false),
            _ => trace!(attr_type, attr_len, "skipping stun attribute"),
        }

        offset += attr_len;
        offset += (4 - (attr_len % 4)) % 4;
    }

    xor_mapped.or(mapped).ok_or(StunError::NoMappedAddress)
}

/// Decode an address attribute value, undoing the XOR obfuscation
/// when asked. The port is XORed with the high 16 bits of the magic
/// cookie, the IPv4 address bytewise with the cookie itself.
fn parse_address(value: &[u8], xored: bool) -> Option<SocketAddr> {
    if value.len() < 8 || value[1] != 0x01 {
        // Family 0x01 is IPv4; anything else is skipped.
        return None;
    }

    let raw_port = u16::from_be_bytes([value[2], value[3]]);
    let port = if xored {
        raw_port ^ (MAGIC_COOKIE >> 16) as u16
    } else {
        raw_port
    };

    let cookie = MAGIC_COOKIE.to_be_bytes();
    let mut octets = [value[4], value[5], value[6], value[7]];
    if xored {
        for (octet, key) in octets.iter_mut().zip(cookie) {
            *octet ^= key;
        }
    }

    Some(SocketAddr::new(
        IpAddr::V4(Ipv4Addr::from(octets)),
        port,
    ))
}

/// Ask one STUN server for this socket's public mapping.
///
/// Datagrams that do not match the outstanding transaction are
/// discarded; the shared socket may deliver unrelated traffic while
/// the probe is outstanding.
///
/// # Errors
///
/// Returns [`StunError::Timeout`] when no valid response arrives in
/// time, or [`StunError::Io`] when the socket fails.
pub async fn probe(
    socket: &UdpSocket,
    server: SocketAddr,
    timeout: Duration,
) -> Result<SocketAddr, StunError> {
    let request = BindingRequest::new();
    socket.send_to(&request.encode(), server).await?;

    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 1024];
    loop {
        let (len, from) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => return Err(StunError::Timeout),
        };
        match parse_binding_response(&buf[..len], &request.transaction_id) {
            Ok(addr) => {
                debug!(%server, public = %addr, "stun mapping discovered");
                return Ok(addr);
            }
            Err(err) => {
                trace!(%from, %err, "discarding datagram during stun probe");
            }
        }
    }
}

/// Try servers in order and return the first successful mapping.
///
/// `None` means every server failed: the caller proceeds with its
/// local address and traversal may be degraded.
pub async fn first_mapping(
    socket: &UdpSocket,
    servers: &[SocketAddr],
    timeout: Duration,
) -> Option<SocketAddr> {
    for server in servers {
        match probe(socket, *server, timeout).await {
            Ok(addr) => return Some(addr),
            Err(err) => debug!(%server, %err, "stun probe failed"),
        }
    }
    None
}
