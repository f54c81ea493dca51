//! Kademlia routing table
//!
//! 160 buckets indexed by shared-prefix length with the local id.
//! Each bucket holds at most `k` peers ordered least-recently-seen
//! first, so the head is always the eviction candidate. A full bucket
//! never evicts on its own: `insert` hands the oldest entry back to
//! the caller, who pings it and calls [`RoutingTable::replace`] only
//! if it stays silent. Long-lived peers are statistically more likely
//! to remain reachable, so stability wins over freshness.

use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use crate::node_id::NodeId;

/// Default bucket capacity.
pub const DEFAULT_K: usize = 8;

/// Number of buckets, one per possible prefix length.
pub const NUM_BUCKETS: usize = NodeId::BITS;

/// A known peer and its liveness bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// The peer's node id.
    pub id: NodeId,
    /// The peer's UDP endpoint.
    pub addr: SocketAddrV4,
    /// Last time any message arrived from this peer.
    pub last_seen: Instant,
    /// Smoothed round-trip estimate, if a query has completed.
    pub rtt: Option<Duration>,
}

impl PeerRecord {
    /// Create a record seen just now, with no RTT sample yet.
    #[must_use]
    pub fn new(id: NodeId, addr: SocketAddrV4) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            rtt: None,
        }
    }
}

/// Result of a routing-table insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The peer was appended to a bucket with room.
    Inserted,
    /// The peer was already present; its entry was refreshed and
    /// moved to most-recently-seen.
    Updated,
    /// The bucket is full. The caller should ping `oldest` and call
    /// [`RoutingTable::replace`] if it does not answer.
    Full {
        /// Least-recently-seen occupant of the target bucket.
        oldest: PeerRecord,
    },
    /// The peer's id equals the local id and was ignored.
    SelfId,
}

/// One k-bucket, least-recently-seen first.
#[derive(Debug, Default)]
struct Bucket {
    peers: Vec<PeerRecord>,
}

/// The Kademlia routing table.
#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Bucket>,
    k: usize,
}

impl RoutingTable {
    /// Create an empty table around a local id with bucket capacity `k`.
    #[must_use]
    pub fn new(local_id: NodeId, k: usize) -> Self {
        let mut buckets = Vec::with_capacity(NUM_BUCKETS);
        buckets.resize_with(NUM_BUCKETS, Bucket::default);
        Self {
            local_id,
            buckets,
            k,
        }
    }

    /// The id this table is centered on.
    #[must_use]
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Total number of peers across all buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.peers.len()).sum()
    }

    /// True when no peer is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.peers.is_empty())
    }

    /// Record contact with a peer.
    ///
    /// An existing entry is refreshed in place and moved to the tail.
    /// A new peer is appended if its bucket has room; otherwise the
    /// bucket's oldest entry is returned for a liveness check.
    pub fn insert(&mut self, peer: PeerRecord) -> InsertOutcome {
        let Some(index) = peer.id.bucket_index(&self.local_id) else {
            return InsertOutcome::SelfId;
        };
        let bucket = &mut self.buckets[index];

        if let Some(pos) = bucket.peers.iter().position(|p| p.id == peer.id) {
            let mut existing = bucket.peers.remove(pos);
            existing.addr = peer.addr;
            existing.last_seen = peer.last_seen;
            if peer.rtt.is_some() {
                existing.rtt = peer.rtt;
            }
            bucket.peers.push(existing);
            return InsertOutcome::Updated;
        }

        if bucket.peers.len() < self.k {
            bucket.peers.push(peer);
            return InsertOutcome::Inserted;
        }

        InsertOutcome::Full {
            oldest: bucket.peers[0].clone(),
        }
    }

    /// Evict `stale` and insert `replacement` in its place.
    ///
    /// No-op if `stale` has already left the table or the two ids map
    /// to different buckets.
    pub fn replace(&mut self, stale: &NodeId, replacement: PeerRecord) {
        let Some(stale_index) = stale.bucket_index(&self.local_id) else {
            return;
        };
        let Some(new_index) = replacement.id.bucket_index(&self.local_id) else {
            return;
        };
        if stale_index != new_index {
            return;
        }

        let bucket = &mut self.buckets[stale_index];
        if let Some(pos) = bucket.peers.iter().position(|p| p.id == *stale) {
            bucket.peers.remove(pos);
            if bucket.peers.len() < self.k {
                bucket.peers.push(replacement);
            }
        }
    }

    /// Remove a peer wherever it is.
    pub fn remove(&mut self, id: &NodeId) {
        if let Some(index) = id.bucket_index(&self.local_id) {
            self.buckets[index].peers.retain(|p| p.id != *id);
        }
    }

    /// Find a peer by id.
    #[must_use]
    pub fn get(&self, id: &NodeId) -> Option<&PeerRecord> {
        let index = id.bucket_index(&self.local_id)?;
        self.buckets[index].peers.iter().find(|p| p.id == *id)
    }

    /// The `n` known peers closest to `target`, ascending by XOR
    /// distance.
    #[must_use]
    pub fn closest(&self, target: &NodeId, n: usize) -> Vec<PeerRecord> {
        let mut all: Vec<&PeerRecord> = self
            .buckets
            .iter()
            .flat_map(|b| b.peers.iter())
            .collect();
        all.sort_by_key(|p| p.id.distance(target));
        all.into_iter().take(n).cloned().collect()
    }

    /// Drop peers not heard from within `ttl`.
    ///
    /// Returns the number of evicted entries.
    pub fn prune(&mut self, ttl: Duration) -> usize {
        let cutoff = Instant::now();
        let mut removed = 0;
        for bucket in &mut self.buckets {
            let before = bucket.peers.len();
            bucket
                .peers
                .retain(|p| cutoff.duration_since(p.last_seen) < ttl);
            removed += before - bucket.peers.len();
        }
        removed
    }

    /// Indexes of buckets with no entry seen within `staleness`.
    ///
    /// Empty buckets are skipped; there is nothing to refresh toward
    /// until at least one peer in that region is known.
    #[must_use]
    pub fn stale_buckets(&self, staleness: Duration) -> Vec<usize> {
        let now = Instant::now();
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                !b.peers.is_empty()
                    && b.peers
                        .iter()
                        .all(|p| now.duration_since(p.last_seen) >= staleness)
            })
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), port)
    }

    fn peer(id: NodeId) -> PeerRecord {
        PeerRecord::new(id, addr(4000))
    }

    #[test]
    fn test_insert_and_get() {
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local, DEFAULT_K);

        let id = NodeId::from_bytes([1u8; 20]);
        assert_eq!(table.insert(peer(id)), InsertOutcome::Inserted);
        assert!(table.get(&id).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_insert_self_ignored() {
        let local = NodeId::random();
        let mut table = RoutingTable::new(local, DEFAULT_K);
        assert_eq!(table.insert(peer(local)), InsertOutcome::SelfId);
        assert!(table.is_empty());
    }

    #[test]
    fn test_reinsert_moves_to_tail() {
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local, 4);

        // Same bucket: all ids share no leading bits with local.
        let mut ids = Vec::new();
        for i in 0..4u8 {
            let mut bytes = [0u8; 20];
            bytes[0] = 0x80 | i;
            ids.push(NodeId::from_bytes(bytes));
        }
        for id in &ids {
            table.insert(peer(*id));
        }

        // Refreshing the head makes the next head the former second entry.
        assert_eq!(table.insert(peer(ids[0])), InsertOutcome::Updated);
        match table.insert(peer(NodeId::from_bytes({
            let mut b = [0u8; 20];
            b[0] = 0x80 | 0x10;
            b
        }))) {
            InsertOutcome::Full { oldest } => assert_eq!(oldest.id, ids[1]),
            other => panic!("expected full bucket, got {other:?}"),
        }
    }

    #[test]
    fn test_bucket_capacity_invariant() {
        let local = NodeId::from_bytes([0u8; 20]);
        let k = 8;
        let mut table = RoutingTable::new(local, k);

        for _ in 0..2000 {
            let outcome = table.insert(peer(NodeId::random()));
            if let InsertOutcome::Full { .. } = outcome {
                // Caller-side eviction; the table itself never grows.
            }
        }

        for bucket in &table.buckets {
            assert!(bucket.peers.len() <= k);
        }
    }

    #[test]
    fn test_full_bucket_reports_oldest() {
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local, 2);

        let mut make = |tag: u8| {
            let mut bytes = [0u8; 20];
            bytes[0] = 0x80;
            bytes[19] = tag;
            NodeId::from_bytes(bytes)
        };
        let first = make(1);
        let second = make(2);
        let third = make(3);

        table.insert(peer(first));
        table.insert(peer(second));
        match table.insert(peer(third)) {
            InsertOutcome::Full { oldest } => assert_eq!(oldest.id, first),
            other => panic!("expected full bucket, got {other:?}"),
        }
    }

    #[test]
    fn test_replace_evicts_stale() {
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local, 2);

        let mut make = |tag: u8| {
            let mut bytes = [0u8; 20];
            bytes[0] = 0x80;
            bytes[19] = tag;
            NodeId::from_bytes(bytes)
        };
        let stale = make(1);
        let kept = make(2);
        let fresh = make(3);

        table.insert(peer(stale));
        table.insert(peer(kept));
        table.replace(&stale, peer(fresh));

        assert!(table.get(&stale).is_none());
        assert!(table.get(&kept).is_some());
        assert!(table.get(&fresh).is_some());
    }

    #[test]
    fn test_replace_ignores_departed_stale() {
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local, 2);

        let mut bytes = [0u8; 20];
        bytes[0] = 0x80;
        let absent = NodeId::from_bytes(bytes);
        bytes[19] = 1;
        let fresh = NodeId::from_bytes(bytes);

        table.replace(&absent, peer(fresh));
        assert!(table.is_empty());
    }

    #[test]
    fn test_closest_matches_brute_force() {
        let local = NodeId::random();
        let mut table = RoutingTable::new(local, 16);
        let mut inserted = Vec::new();

        for _ in 0..200 {
            let p = peer(NodeId::random());
            if table.insert(p.clone()) == InsertOutcome::Inserted {
                inserted.push(p);
            }
        }

        let target = NodeId::random();
        let got = table.closest(&target, 10);

        inserted.sort_by_key(|p| p.id.distance(&target));
        let want: Vec<_> = inserted.iter().take(10).map(|p| p.id).collect();
        let got_ids: Vec<_> = got.iter().map(|p| p.id).collect();
        assert_eq!(got_ids, want);

        // Ascending order.
        for pair in got.windows(2) {
            assert!(pair[0].id.distance(&target) <= pair[1].id.distance(&target));
        }
    }

    #[test]
    fn test_prune_by_ttl() {
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local, DEFAULT_K);

        let old_id = NodeId::from_bytes([1u8; 20]);
        let mut old = peer(old_id);
        old.last_seen = Instant::now() - Duration::from_secs(600);
        table.insert(old);
        table.insert(peer(NodeId::from_bytes([2u8; 20])));

        let removed = table.prune(Duration::from_secs(300));
        assert_eq!(removed, 1);
        assert!(table.get(&old_id).is_none());
    }

    #[test]
    fn test_stale_buckets() {
        let local = NodeId::from_bytes([0u8; 20]);
        let mut table = RoutingTable::new(local, DEFAULT_K);

        let mut bytes = [0u8; 20];
        bytes[0] = 0x80;
        let mut stale = peer(NodeId::from_bytes(bytes));
        stale.last_seen = Instant::now() - Duration::from_secs(3600);
        table.insert(stale);

        let stale_list = table.stale_buckets(Duration::from_secs(900));
        assert_eq!(stale_list, vec![159]);
        assert!(table.stale_buckets(Duration::from_secs(7200)).is_empty());
    }
}
