//! BLAKE3 hashing, context KDF, and topic hash derivation.

/// BLAKE3 hash output (32 bytes).
pub type HashOutput = [u8; 32];

/// Compute BLAKE3 hash of input data.
#[must_use]
pub fn hash(data: &[u8]) -> HashOutput {
    *blake3::hash(data).as_bytes()
}

/// BLAKE3 Key Derivation Function with context.
pub struct Kdf {
    context: &'static str,
}

impl Kdf {
    /// Create a KDF with a specific context string.
    #[must_use]
    pub fn new(context: &'static str) -> Self {
        Self { context }
    }

    /// Derive output from input key material.
    pub fn derive(&self, ikm: &[u8], output: &mut [u8]) {
        let key_hash = hash(ikm);
        let mut hasher = blake3::Hasher::new_keyed(&key_hash);
        hasher.update(self.context.as_bytes());

        let mut reader = hasher.finalize_xof();
        reader.fill(output);
    }

    /// Derive a 32-byte key.
    #[must_use]
    pub fn derive_key(&self, ikm: &[u8]) -> [u8; 32] {
        let mut output = [0u8; 32];
        self.derive(ikm, &mut output);
        output
    }
}

/// Derive a 160-bit topic hash from an application-chosen string.
///
/// The topic hash is the DHT key under which peers announce and
/// discover each other. Derivation is one-way and domain-separated;
/// the rendezvous string itself never appears on the wire.
#[must_use]
pub fn topic_hash(topic: &str) -> [u8; 20] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(topic.as_bytes());
    hasher.update(b"burrow-topic");

    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest.as_bytes()[..20]);
    out
}

/// Derive the 16-byte passphrase KDF salt for a topic.
///
/// Every participant on a topic derives the same salt offline, so a
/// shared passphrase converges on one group key without an exchange.
#[must_use]
pub fn topic_salt(topic: &str) -> [u8; 16] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(topic.as_bytes());
    hasher.update(b"burrow-topic-salt");

    let digest = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest.as_bytes()[..16]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(hash(b"burrow"), hash(b"burrow"));
        assert_ne!(hash(b"burrow"), hash(b"barrow"));
    }

    #[test]
    fn test_kdf_context_separation() {
        let ikm = b"input key material";
        let k1 = Kdf::new("context-one").derive_key(ikm);
        let k2 = Kdf::new("context-two").derive_key(ikm);
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_kdf_deterministic() {
        let kdf = Kdf::new("burrow-test");
        assert_eq!(kdf.derive_key(b"ikm"), kdf.derive_key(b"ikm"));
    }

    #[test]
    fn test_kdf_variable_output() {
        let kdf = Kdf::new("burrow-test");
        let mut long = [0u8; 64];
        kdf.derive(b"ikm", &mut long);
        let short = kdf.derive_key(b"ikm");
        // XOF prefix property: the 32-byte key is the prefix of longer output
        assert_eq!(&long[..32], &short);
    }

    #[test]
    fn test_topic_hash_stable() {
        let h1 = topic_hash("my-rendezvous");
        let h2 = topic_hash("my-rendezvous");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 20);
    }

    #[test]
    fn test_topic_hash_distinct() {
        assert_ne!(topic_hash("topic-a"), topic_hash("topic-b"));
    }

    #[test]
    fn test_topic_hash_not_raw_input() {
        // One-way: the hash must not embed the topic string
        let h = topic_hash("aaaaaaaaaaaaaaaaaaaa");
        assert_ne!(&h, b"aaaaaaaaaaaaaaaaaaaa");
    }

    #[test]
    fn test_topic_salt_independent_of_hash() {
        let topic = "same-topic";
        let h = topic_hash(topic);
        let s = topic_salt(topic);
        assert_ne!(&h[..16], &s);
    }
}
