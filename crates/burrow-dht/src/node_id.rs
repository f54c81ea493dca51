//! DHT Node Identity and Distance Metric
//!
//! This module provides the `NodeId` type, a 160-bit identifier used in
//! the Kademlia overlay. Node ids and topic hashes share the same
//! address space, and routing uses the XOR distance metric.

use rand::Rng;
use std::cmp::Ordering;
use std::fmt;

/// 160-bit node identifier for the Kademlia DHT
///
/// Node ids live in the same 160-bit space as topic hashes, so a
/// lookup walks toward either kind of target with one metric. The XOR
/// metric is symmetric and unidirectional, which gives Kademlia its
/// convergence guarantee.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId([u8; 20]);

impl NodeId {
    /// Number of bits in a `NodeId`
    pub const BITS: usize = 160;

    /// Number of bytes in a `NodeId`
    pub const LEN: usize = 20;

    /// Generate a random `NodeId`
    ///
    /// # Examples
    ///
    /// ```
    /// use burrow_dht::NodeId;
    ///
    /// let id = NodeId::random();
    /// assert_eq!(id.as_bytes().len(), 20);
    /// ```
    #[must_use]
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let mut bytes = [0u8; 20];
        rng.fill(&mut bytes[..]);
        Self(bytes)
    }

    /// Create a `NodeId` from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Create a `NodeId` from a slice
    ///
    /// Returns `None` if the slice is not exactly 20 bytes.
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; 20] = slice.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Get the raw bytes of the `NodeId`
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Calculate XOR distance to another `NodeId`
    ///
    /// # Examples
    ///
    /// ```
    /// use burrow_dht::NodeId;
    ///
    /// let id1 = NodeId::from_bytes([1u8; 20]);
    /// let id2 = NodeId::from_bytes([2u8; 20]);
    /// assert_eq!(id1.distance(&id2).as_bytes()[0], 3);
    /// ```
    #[must_use]
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut result = [0u8; 20];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(result)
    }

    /// Get the bucket index for this id relative to a local id
    ///
    /// The index is determined by the position of the first differing
    /// bit: ids sharing `i` leading bits with the local id land in
    /// bucket `159 - i`. Returns `None` when the ids are identical.
    ///
    /// # Examples
    ///
    /// ```
    /// use burrow_dht::NodeId;
    ///
    /// let local = NodeId::from_bytes([0u8; 20]);
    /// let mut bytes = [0u8; 20];
    /// bytes[0] = 0b1000_0000;
    /// let remote = NodeId::from_bytes(bytes);
    /// assert_eq!(remote.bucket_index(&local), Some(159));
    /// ```
    #[must_use]
    pub fn bucket_index(&self, local_id: &NodeId) -> Option<usize> {
        let distance = self.distance(local_id);
        let leading = distance.leading_zeros();
        if leading == Self::BITS {
            None
        } else {
            Some(Self::BITS - 1 - leading)
        }
    }

    /// Generate a random id that falls into a given bucket of `local_id`
    ///
    /// Used by bucket refresh: looking up an id in a stale bucket
    /// repopulates that region of the routing table. The returned id
    /// shares exactly `159 - bucket` leading bits with `local_id`.
    ///
    /// # Panics
    ///
    /// Panics if `bucket >= 160`.
    #[must_use]
    pub fn random_in_bucket(local_id: &NodeId, bucket: usize) -> Self {
        assert!(bucket < Self::BITS, "bucket index out of range");

        let mut bytes = *local_id.as_bytes();
        let mut rng = rand::thread_rng();

        // Bit positions count down from the most significant bit.
        let diff_bit = Self::BITS - 1 - bucket;
        let byte_index = diff_bit / 8;
        let bit_in_byte = 7 - (diff_bit % 8);

        // Flip the first differing bit, then randomize everything below it.
        bytes[byte_index] ^= 1 << bit_in_byte;

        let mask = (1u8 << bit_in_byte).wrapping_sub(1);
        bytes[byte_index] = (bytes[byte_index] & !mask) | (rng.r#gen::<u8>() & mask);
        for b in bytes.iter_mut().skip(byte_index + 1) {
            *b = rng.r#gen();
        }

        Self(bytes)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// XOR distance between two ids
///
/// Distances compare as 160-bit big-endian unsigned integers, so a
/// plain byte comparison gives the Kademlia ordering.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Distance([u8; 20]);

impl Distance {
    /// Get the raw bytes of the distance
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Count leading zero bits
    #[must_use]
    pub fn leading_zeros(&self) -> usize {
        let mut count = 0;
        for byte in &self.0 {
            if *byte == 0 {
                count += 8;
            } else {
                count += byte.leading_zeros() as usize;
                break;
            }
        }
        count.min(NodeId::BITS)
    }
}

impl PartialOrd for Distance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Distance {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(&self.0[..8]))
    }
}
