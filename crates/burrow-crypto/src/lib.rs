//! # Burrow Crypto
//!
//! Cryptographic primitives for the Burrow rendezvous protocol.
//!
//! This crate provides:
//! - `XChaCha20-Poly1305` AEAD envelopes with per-message random nonces
//! - X25519 ephemeral key exchange for session establishment
//! - BLAKE3 hashing, context KDF, and topic hash derivation
//! - Argon2id passphrase-derived group keys (offline shared-key mode)
//! - Secure random number generation
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Exchange | X25519 | 128-bit |
//! | AEAD | XChaCha20-Poly1305 | 256-bit key |
//! | Hash | BLAKE3 | 128-bit collision |
//! | KDF | BLAKE3 keyed/XOF | 128-bit |
//! | Passphrase KDF | Argon2id | memory-hard |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod error;
pub mod hash;
pub mod passphrase;
pub mod random;
pub mod x25519;

pub use aead::{AeadKey, SecureChannel};
pub use error::CryptoError;

/// X25519 public key size
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// X25519 secret key size
pub const X25519_SECRET_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 key size
pub const XCHACHA_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce size
pub const XCHACHA_NONCE_SIZE: usize = 24;

/// AEAD authentication tag size
pub const AUTH_TAG_SIZE: usize = 16;

/// BLAKE3 output size
pub const BLAKE3_OUTPUT_SIZE: usize = 32;

/// Topic hash size (160 bits, matching DHT node id width)
pub const TOPIC_HASH_SIZE: usize = 20;
