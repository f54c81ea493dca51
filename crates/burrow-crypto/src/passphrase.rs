//! Passphrase-based group keys via Argon2id.
//!
//! A topic passphrase plus a topic-derived salt yields the same
//! symmetric key for every participant with no key exchange. Peers
//! that know the passphrase can decrypt group traffic; peers that do
//! not see only ciphertext.

use argon2::{Algorithm, Argon2, Params, Version};

use crate::aead::AeadKey;
use crate::error::CryptoError;
use crate::hash::topic_salt;

/// Argon2id memory cost in KiB.
const MEMORY_COST_KIB: u32 = 19 * 1024;

/// Argon2id iteration count.
const TIME_COST: u32 = 2;

/// Argon2id parallelism.
const PARALLELISM: u32 = 1;

/// Derive a group key from a passphrase and topic.
///
/// The salt is derived from the topic, so all peers on the same topic
/// with the same passphrase compute the same key offline.
///
/// # Errors
///
/// Returns [`CryptoError::PassphraseDerivation`] if Argon2 rejects the
/// parameters or derivation fails.
pub fn derive_group_key(passphrase: &str, topic: &str) -> Result<AeadKey, CryptoError> {
    let salt = topic_salt(topic);

    let params = Params::new(MEMORY_COST_KIB, TIME_COST, PARALLELISM, Some(32))
        .map_err(|e| CryptoError::PassphraseDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(passphrase.as_bytes(), &salt, &mut key)
        .map_err(|e| CryptoError::PassphraseDerivation(e.to_string()))?;

    Ok(AeadKey::new(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_inputs_same_key() {
        let k1 = derive_group_key("hunter2", "topic").unwrap();
        let k2 = derive_group_key("hunter2", "topic").unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_different_passphrase_different_key() {
        let k1 = derive_group_key("hunter2", "topic").unwrap();
        let k2 = derive_group_key("hunter3", "topic").unwrap();
        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_different_topic_different_key() {
        let k1 = derive_group_key("hunter2", "topic-a").unwrap();
        let k2 = derive_group_key("hunter2", "topic-b").unwrap();
        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_key_encrypts() {
        let key = derive_group_key("hunter2", "topic").unwrap();
        let envelope = key.seal(b"group message", b"").unwrap();
        let plain = key.open(&envelope, b"").unwrap();
        assert_eq!(plain, b"group message");
    }
}
