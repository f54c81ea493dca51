//! Iterative lookup state
//!
//! A lookup walks the id space toward a target by querying the alpha
//! closest unqueried candidates each round and merging whatever they
//! return into a shortlist capped at the k closest seen so far. The
//! walk stops when a round brings nothing closer than the best known
//! candidate, when no unqueried candidate remains, or when the round
//! budget runs out. Driving the queries is the caller's job; this type
//! only holds the shortlist bookkeeping.

use std::collections::HashSet;

use crate::krpc::NodeInfo;
use crate::node_id::{Distance, NodeId};

/// Default query parallelism per round.
pub const DEFAULT_ALPHA: usize = 3;

/// Default round budget. Generous for any realistic network size;
/// exists to stop lookups against adversarial or looping peers.
pub const DEFAULT_MAX_ROUNDS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateState {
    Fresh,
    InFlight,
    Responded,
    Failed,
}

#[derive(Debug, Clone)]
struct Candidate {
    info: NodeInfo,
    distance: Distance,
    state: CandidateState,
}

/// Shortlist state for one in-progress lookup.
#[derive(Debug)]
pub struct LookupState {
    target: NodeId,
    k: usize,
    alpha: usize,
    max_rounds: usize,
    rounds: usize,
    candidates: Vec<Candidate>,
    seen: HashSet<NodeId>,
    best_at_issue: Option<Distance>,
    improved: bool,
    done: bool,
}

impl LookupState {
    /// Start a lookup toward `target`, seeded from the local table.
    #[must_use]
    pub fn new(target: NodeId, seeds: Vec<NodeInfo>, k: usize, alpha: usize) -> Self {
        let mut state = Self {
            target,
            k,
            alpha,
            max_rounds: DEFAULT_MAX_ROUNDS,
            rounds: 0,
            candidates: Vec::new(),
            seen: HashSet::new(),
            best_at_issue: None,
            improved: false,
            done: false,
        };
        for seed in seeds {
            state.merge(seed);
        }
        state
    }

    /// The id this lookup is walking toward.
    #[must_use]
    pub fn target(&self) -> &NodeId {
        &self.target
    }

    /// Rounds issued so far.
    #[must_use]
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// True once the lookup has converged or run out of budget.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.done
    }

    /// Pick the next batch of candidates to query.
    ///
    /// Returns up to alpha fresh candidates from the k closest known.
    /// An empty batch means the lookup is complete; the caller should
    /// stop driving it.
    pub fn next_batch(&mut self) -> Vec<NodeInfo> {
        if self.done {
            return Vec::new();
        }
        if self.rounds >= self.max_rounds {
            self.done = true;
            return Vec::new();
        }
        // A round that brought nothing closer means convergence.
        if self.rounds > 0 && !self.improved {
            self.done = true;
            return Vec::new();
        }

        self.sort_and_truncate();
        let batch: Vec<NodeInfo> = self
            .candidates
            .iter()
            .filter(|c| c.state == CandidateState::Fresh)
            .take(self.alpha)
            .map(|c| c.info)
            .collect();

        if batch.is_empty() {
            self.done = true;
            return Vec::new();
        }

        self.best_at_issue = self.best_distance();
        self.improved = false;
        self.rounds += 1;

        for info in &batch {
            if let Some(c) = self.candidates.iter_mut().find(|c| c.info.id == info.id) {
                c.state = CandidateState::InFlight;
            }
        }
        batch
    }

    /// Record a response from `responder` containing closer nodes.
    pub fn on_response(&mut self, responder: &NodeId, nodes: &[NodeInfo]) {
        if let Some(c) = self
            .candidates
            .iter_mut()
            .find(|c| c.info.id == *responder)
        {
            c.state = CandidateState::Responded;
        }
        for node in nodes {
            self.merge(*node);
        }
    }

    /// Record that `peer` did not answer within the query timeout.
    ///
    /// The peer is dropped from the shortlist for the remainder of
    /// this lookup; it is not retried.
    pub fn on_failure(&mut self, peer: &NodeId) {
        if let Some(c) = self.candidates.iter_mut().find(|c| c.info.id == *peer) {
            c.state = CandidateState::Failed;
        }
    }

    /// The closest peers that actually responded, ascending, at most k.
    ///
    /// These are the targets for a subsequent announce.
    #[must_use]
    pub fn closest_responded(&self) -> Vec<NodeInfo> {
        let mut responded: Vec<&Candidate> = self
            .candidates
            .iter()
            .filter(|c| c.state == CandidateState::Responded)
            .collect();
        responded.sort_by_key(|c| c.distance);
        responded.iter().take(self.k).map(|c| c.info).collect()
    }

    fn merge(&mut self, info: NodeInfo) {
        if !self.seen.insert(info.id) {
            return;
        }
        let distance = info.id.distance(&self.target);
        if self.best_at_issue.is_none_or(|best| distance < best) {
            self.improved = true;
        }
        self.candidates.push(Candidate {
            info,
            distance,
            state: CandidateState::Fresh,
        });
    }

    fn best_distance(&self) -> Option<Distance> {
        self.candidates
            .iter()
            .filter(|c| c.state != CandidateState::Failed)
            .map(|c| c.distance)
            .min()
    }

    fn sort_and_truncate(&mut self) {
        self.candidates.sort_by_key(|c| c.distance);
        // Cap the shortlist at k live candidates; failed entries are
        // dropped, in-flight and responded ones are kept for bookkeeping.
        let mut live = 0;
        self.candidates.retain(|c| {
            if c.state == CandidateState::Failed {
                return false;
            }
            if c.state == CandidateState::Fresh {
                live += 1;
                return live <= self.k * 2;
            }
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{PeerRecord, RoutingTable};
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn info(id: NodeId, port: u16) -> NodeInfo {
        NodeInfo {
            id,
            addr: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), port),
        }
    }

    #[test]
    fn test_empty_seed_completes_immediately() {
        let mut lookup = LookupState::new(NodeId::random(), Vec::new(), 8, DEFAULT_ALPHA);
        assert!(lookup.next_batch().is_empty());
        assert!(lookup.is_complete());
    }

    #[test]
    fn test_batch_respects_alpha() {
        let target = NodeId::random();
        let seeds: Vec<NodeInfo> = (0..10).map(|i| info(NodeId::random(), 4000 + i)).collect();
        let mut lookup = LookupState::new(target, seeds, 8, 3);
        assert_eq!(lookup.next_batch().len(), 3);
    }

    #[test]
    fn test_failed_peer_not_retried() {
        let target = NodeId::from_bytes([0u8; 20]);
        let near = info(NodeId::from_bytes([1u8; 20]), 4000);
        let mut lookup = LookupState::new(target, vec![near], 8, 3);

        let batch = lookup.next_batch();
        assert_eq!(batch.len(), 1);
        lookup.on_failure(&batch[0].id);

        assert!(lookup.next_batch().is_empty());
        assert!(lookup.is_complete());
    }

    #[test]
    fn test_converges_when_nothing_closer_returned() {
        let target = NodeId::from_bytes([0u8; 20]);
        let seed = info(NodeId::from_bytes([1u8; 20]), 4000);
        let far = info(NodeId::from_bytes([0xFFu8; 20]), 4001);
        let mut lookup = LookupState::new(target, vec![seed], 8, 3);

        let batch = lookup.next_batch();
        lookup.on_response(&batch[0].id, &[far]);

        // The only new candidate is farther than the responder.
        assert!(lookup.next_batch().is_empty());
        assert!(lookup.is_complete());
        assert_eq!(lookup.closest_responded()[0].id, seed.id);
    }

    #[test]
    fn test_round_budget_bounds_adversarial_peers() {
        // Each "response" hands back a fresh, slightly closer peer
        // forever; the round cap must stop the walk.
        let target = NodeId::from_bytes([0u8; 20]);
        let mut next_id = [0xFFu8; 20];
        let seed = info(NodeId::from_bytes(next_id), 4000);
        let mut lookup = LookupState::new(target, vec![seed], 8, 1);

        let mut rounds = 0;
        loop {
            let batch = lookup.next_batch();
            if batch.is_empty() {
                break;
            }
            rounds += 1;
            next_id[0] = next_id[0].wrapping_sub(1);
            lookup.on_response(&batch[0].id, &[info(NodeId::from_bytes(next_id), 5000)]);
            assert!(rounds <= DEFAULT_MAX_ROUNDS, "lookup failed to terminate");
        }
        assert_eq!(rounds, DEFAULT_MAX_ROUNDS);
    }

    #[test]
    fn test_simulated_network_converges_in_log_rounds() {
        // 1000 synthetic peers, each holding a real routing table over
        // the rest of the population. The walk must find the node
        // closest to the target within O(log N) rounds.
        let n = 1000;
        let ids: Vec<NodeId> = (0..n).map(|_| NodeId::random()).collect();

        let mut tables: Vec<RoutingTable> = ids
            .iter()
            .map(|id| RoutingTable::new(*id, 8))
            .collect();
        for (i, table) in tables.iter_mut().enumerate() {
            for (j, id) in ids.iter().enumerate() {
                if i != j {
                    table.insert(PeerRecord::new(
                        *id,
                        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 4000 + j as u16),
                    ));
                }
            }
        }

        let target = NodeId::random();
        let mut global: Vec<NodeId> = ids.clone();
        global.sort_by_key(|id| id.distance(&target));
        let true_closest = global[0];

        // Seed from an arbitrary node's view, as a bootstrap would.
        let seeds: Vec<NodeInfo> = tables[0]
            .closest(&target, 8)
            .into_iter()
            .map(|p| NodeInfo { id: p.id, addr: p.addr })
            .collect();

        let mut lookup = LookupState::new(target, seeds, 8, 3);
        loop {
            let batch = lookup.next_batch();
            if batch.is_empty() {
                break;
            }
            for peer in batch {
                let idx = ids.iter().position(|id| *id == peer.id).unwrap();
                let nodes: Vec<NodeInfo> = tables[idx]
                    .closest(&target, 8)
                    .into_iter()
                    .map(|p| NodeInfo { id: p.id, addr: p.addr })
                    .collect();
                lookup.on_response(&peer.id, &nodes);
            }
        }

        assert!(
            lookup.rounds() <= 12,
            "took {} rounds for n={n}",
            lookup.rounds()
        );
        let found: Vec<NodeId> = lookup
            .closest_responded()
            .iter()
            .map(|i| i.id)
            .collect();
        assert!(
            found.contains(&true_closest),
            "closest node not discovered"
        );
    }
}
