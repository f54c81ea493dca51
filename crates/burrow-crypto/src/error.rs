//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Envelope too short to contain a nonce and tag
    #[error("envelope truncated: {0} bytes")]
    EnvelopeTruncated(usize),

    /// Key exchange produced a low-order result
    #[error("key exchange rejected: low-order public key")]
    LowOrderPoint,

    /// Passphrase key derivation failed
    #[error("passphrase derivation failed: {0}")]
    PassphraseDerivation(String),

    /// OS CSPRNG failure
    #[error("random generation failed")]
    RandomFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            CryptoError::EncryptionFailed.to_string(),
            "encryption failed"
        );
        assert!(
            CryptoError::DecryptionFailed
                .to_string()
                .contains("authentication failure")
        );
        let err = CryptoError::InvalidKeyLength {
            expected: 32,
            actual: 16,
        };
        assert!(err.to_string().contains("expected 32"));
        assert!(
            CryptoError::EnvelopeTruncated(3)
                .to_string()
                .contains("3 bytes")
        );
    }
}
