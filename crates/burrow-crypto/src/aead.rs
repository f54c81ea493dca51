//! `XChaCha20-Poly1305` AEAD envelopes.
//!
//! Every application payload travels in a self-contained envelope:
//! a fresh random 24-byte nonce followed by the ciphertext and its
//! 16-byte authentication tag. The extended nonce makes random
//! generation safe (birthday bound 2^96 messages), so no counter
//! state needs to survive reordering or loss on the UDP path.
//!
//! An envelope that fails authentication is rejected as a unit; a
//! flipped bit anywhere in nonce, ciphertext, or tag yields
//! [`CryptoError::DecryptionFailed`].

use crate::error::CryptoError;
use chacha20poly1305::{
    XChaCha20Poly1305,
    aead::{Aead, KeyInit},
};
use rand_core::{CryptoRng, RngCore};
use zeroize::ZeroizeOnDrop;

/// Authentication tag size (16 bytes / 128 bits).
pub const TAG_SIZE: usize = 16;

/// XChaCha20-Poly1305 nonce size (24 bytes / 192 bits).
pub const NONCE_SIZE: usize = 24;

/// AEAD key size (32 bytes / 256 bits).
pub const KEY_SIZE: usize = 32;

/// AEAD encryption key (32 bytes).
///
/// Wraps the raw key material and provides envelope seal/open methods.
/// Key is zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from slice.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if slice length is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Generate a random key.
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Get raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with care - this exposes the raw key material.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Seal a plaintext into an envelope: `nonce || ciphertext || tag`.
    ///
    /// A fresh random nonce is drawn per call.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if AEAD encryption fails,
    /// `CryptoError::RandomFailed` if nonce generation fails.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        crate::random::fill_random(&mut nonce)?;
        self.seal_with_nonce(&nonce, plaintext, aad)
    }

    /// Seal with an explicit nonce. Exposed for tests and vectors; callers
    /// must never reuse a nonce under the same key.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if AEAD encryption fails.
    pub fn seal_with_nonce(
        &self,
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new((&self.0).into());
        let ciphertext = cipher
            .encrypt(
                nonce.into(),
                chacha20poly1305::aead::Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut envelope = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        envelope.extend_from_slice(nonce);
        envelope.extend_from_slice(&ciphertext);
        Ok(envelope)
    }

    /// Open an envelope produced by [`AeadKey::seal`].
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EnvelopeTruncated` if the input cannot hold a
    /// nonce and tag, `CryptoError::DecryptionFailed` on authentication
    /// failure.
    pub fn open(&self, envelope: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if envelope.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::EnvelopeTruncated(envelope.len()));
        }
        let (nonce, ciphertext) = envelope.split_at(NONCE_SIZE);

        let cipher = XChaCha20Poly1305::new((&self.0).into());
        cipher
            .decrypt(
                chacha20poly1305::XNonce::from_slice(nonce),
                chacha20poly1305::aead::Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeadKey").field("key", &"[REDACTED]").finish()
    }
}

/// Per-peer authenticated-encryption session.
///
/// Wraps a derived session key and counts traffic in both directions.
/// Both sides of a connection hold a `SecureChannel` over the same key;
/// direction is unambiguous because every envelope carries its own nonce.
pub struct SecureChannel {
    key: AeadKey,
    sealed: u64,
    opened: u64,
}

impl SecureChannel {
    /// Create a channel over a derived session key.
    #[must_use]
    pub fn new(key: AeadKey) -> Self {
        Self {
            key,
            sealed: 0,
            opened: 0,
        }
    }

    /// Encrypt an outbound payload into an envelope.
    ///
    /// # Errors
    ///
    /// Returns a `CryptoError` if encryption or nonce generation fails.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let envelope = self.key.seal(plaintext, &[])?;
        self.sealed += 1;
        Ok(envelope)
    }

    /// Decrypt an inbound envelope.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` on tag mismatch; callers
    /// drop the datagram rather than tearing down the session.
    pub fn open(&mut self, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let plaintext = self.key.open(envelope, &[])?;
        self.opened += 1;
        Ok(plaintext)
    }

    /// Number of envelopes sealed on this channel.
    #[must_use]
    pub fn sealed_count(&self) -> u64 {
        self.sealed
    }

    /// Number of envelopes successfully opened on this channel.
    #[must_use]
    pub fn opened_count(&self) -> u64 {
        self.opened
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("sealed", &self.sealed)
            .field("opened", &self.opened)
            .finish()
    }
}
