//! # Burrow NAT
//!
//! NAT traversal building blocks: a STUN binding subset for
//! discovering the node's public mapping, and jittered UDP probe
//! bursts for hole punching. Both operate on a socket owned by the
//! caller so discovery and traversal share one NAT binding.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod punch;
pub mod stun;

pub use error::StunError;
pub use punch::{punch, PunchConfig, PunchHandle};
pub use stun::{first_mapping, probe, BindingRequest};
