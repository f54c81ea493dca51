//! # Burrow Node
//!
//! The orchestrator tying the Burrow crates together into a running
//! peer: one UDP socket shared by the DHT, STUN discovery, hole
//! punching, and the encrypted session layer.
//!
//! ## Lifecycle
//!
//! 1. [`Node::new`] builds a node from a [`NodeConfig`] and hands
//!    back the [`NodeEvent`] stream.
//! 2. [`Node::start`] binds the socket, probes STUN, bootstraps the
//!    DHT, and begins announcing the configured topic.
//! 3. [`Node::connect`] punches toward a peer and runs the key
//!    exchange; [`Node::send`] and [`Node::broadcast`] move encrypted
//!    payloads.
//! 4. [`Node::stop`] closes every session and releases the socket.
//!
//! Discovery is hands-off: peers announcing the same topic surface as
//! [`NodeEvent::PeerDiscovered`] and can be connected to by address.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod identity;
pub mod node;
pub mod packet;

pub use config::{ConnectionSettings, DiscoverySettings, NatSettings, NodeConfig};
pub use connection::{Connection, ConnectionState};
pub use error::NodeError;
pub use event::{CloseReason, NodeEvent};
pub use node::Node;
