//! # Burrow DHT
//!
//! Kademlia-style distributed hash table client: 160-bit node ids
//! under the XOR metric, a k-bucket routing table, KRPC bencode
//! messages, iterative lookup, and topic announce/discover.
//!
//! The crate is transport-agnostic. The socket owner implements
//! [`QueryTransport`] for outbound queries and feeds inbound queries
//! to [`DhtClient::handle_query`]; everything here is pure protocol
//! state.
//!
//! ## Discovery flow
//!
//! 1. [`DhtClient::bootstrap`] joins through well-known peers.
//! 2. [`DhtClient::announce`] registers the local node under a topic
//!    and returns peers announced by others.
//! 3. Periodic re-announce and [`DhtClient::refresh_stale_buckets`]
//!    keep the view fresh under churn.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod bencode;
pub mod client;
pub mod error;
pub mod krpc;
pub mod lookup;
pub mod node_id;
pub mod routing;

pub use client::{DhtClient, DhtConfig, LookupResult, QueryTransport};
pub use error::DhtError;
pub use krpc::{Message, NodeInfo, QueryBody, ResponseBody};
pub use lookup::LookupState;
pub use node_id::{Distance, NodeId};
pub use routing::{InsertOutcome, PeerRecord, RoutingTable};
