//! X25519 Diffie-Hellman key exchange (RFC 7748).
//!
//! Session establishment uses one ephemeral key pair per connection
//! attempt. The shared secret is never used directly: both sides feed
//! it through a BLAKE3 KDF bound to the sorted pair of public keys, so
//! the derived session key is identical regardless of which side
//! initiated.

use crate::aead::AeadKey;
use crate::error::CryptoError;
use rand_core::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// X25519 private key (32 bytes).
#[derive(Clone, ZeroizeOnDrop, Zeroize)]
pub struct PrivateKey(x25519_dalek::StaticSecret);

/// X25519 public key (32 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey(x25519_dalek::PublicKey);

/// X25519 shared secret (32 bytes).
#[derive(ZeroizeOnDrop, Zeroize)]
pub struct SharedSecret(x25519_dalek::SharedSecret);

impl PrivateKey {
    /// Generate a new random private key with RFC 7748 clamping.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(x25519_dalek::StaticSecret::random_from_rng(rng))
    }

    /// Derive the public key from this private key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.0))
    }

    /// Perform Diffie-Hellman key exchange.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::LowOrderPoint` if the peer's public key is a
    /// low-order point.
    pub fn exchange(&self, peer_public: &PublicKey) -> Result<SharedSecret, CryptoError> {
        let shared = self.0.diffie_hellman(&peer_public.0);

        if shared.as_bytes() == &[0u8; 32] {
            return Err(CryptoError::LowOrderPoint);
        }

        Ok(SharedSecret(shared))
    }
}

impl PublicKey {
    /// Export public key as bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        *self.0.as_bytes()
    }

    /// Import public key from bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::PublicKey::from(bytes))
    }

    /// Get bytes as a reference.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl SharedSecret {
    /// Get shared secret as bytes.
    ///
    /// # Security
    ///
    /// Use [`derive_session_key`] rather than the raw secret.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

/// Derive the symmetric session key for a handshake.
///
/// The KDF input binds the shared secret to both ephemeral public keys,
/// sorted bytewise, so initiator and responder compute the same key
/// without agreeing on roles.
#[must_use]
pub fn derive_session_key(shared: &SharedSecret, ours: &PublicKey, theirs: &PublicKey) -> AeadKey {
    let (lo, hi) = if ours.as_bytes() <= theirs.as_bytes() {
        (ours, theirs)
    } else {
        (theirs, ours)
    };

    let key_hash = blake3::hash(shared.as_bytes());
    let mut hasher = blake3::Hasher::new_keyed(key_hash.as_bytes());
    hasher.update(b"burrow-session-key");
    hasher.update(lo.as_bytes());
    hasher.update(hi.as_bytes());
    AeadKey::new(*hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn test_key_generation() {
        let private = PrivateKey::generate(&mut OsRng);
        let public = private.public_key();
        assert_ne!(public.to_bytes(), [0u8; 32]);
    }

    #[test]
    fn test_key_exchange_agreement() {
        let alice_private = PrivateKey::generate(&mut OsRng);
        let alice_public = alice_private.public_key();

        let bob_private = PrivateKey::generate(&mut OsRng);
        let bob_public = bob_private.public_key();

        let alice_shared = alice_private.exchange(&bob_public).unwrap();
        let bob_shared = bob_private.exchange(&alice_public).unwrap();

        assert_eq!(alice_shared.as_bytes(), bob_shared.as_bytes());
    }

    #[test]
    fn test_reject_low_order_points() {
        let private = PrivateKey::generate(&mut OsRng);
        let zero_public = PublicKey::from_bytes([0u8; 32]);
        assert!(matches!(
            private.exchange(&zero_public),
            Err(CryptoError::LowOrderPoint)
        ));
    }

    #[test]
    fn test_session_key_role_independent() {
        let alice_private = PrivateKey::generate(&mut OsRng);
        let alice_public = alice_private.public_key();
        let bob_private = PrivateKey::generate(&mut OsRng);
        let bob_public = bob_private.public_key();

        let alice_shared = alice_private.exchange(&bob_public).unwrap();
        let bob_shared = bob_private.exchange(&alice_public).unwrap();

        // Each side passes (ours, theirs) in its own order.
        let alice_key = derive_session_key(&alice_shared, &alice_public, &bob_public);
        let bob_key = derive_session_key(&bob_shared, &bob_public, &alice_public);

        assert_eq!(alice_key.as_bytes(), bob_key.as_bytes());
    }

    #[test]
    fn test_session_key_differs_per_pairing() {
        let a = PrivateKey::generate(&mut OsRng);
        let b = PrivateKey::generate(&mut OsRng);
        let c = PrivateKey::generate(&mut OsRng);

        let ab = derive_session_key(
            &a.exchange(&b.public_key()).unwrap(),
            &a.public_key(),
            &b.public_key(),
        );
        let ac = derive_session_key(
            &a.exchange(&c.public_key()).unwrap(),
            &a.public_key(),
            &c.public_key(),
        );

        assert_ne!(ab.as_bytes(), ac.as_bytes());
    }

    #[test]
    fn test_public_key_roundtrip() {
        let private = PrivateKey::generate(&mut OsRng);
        let public = private.public_key();
        let restored = PublicKey::from_bytes(public.to_bytes());
        assert_eq!(public, restored);
    }
}
