//! DHT client
//!
//! Query-side logic (bootstrap, iterative lookup, announce) and
//! server-side handling of inbound queries, built over an abstract
//! transport so it never touches the socket directly. The owner of
//! the socket implements [`QueryTransport`] and routes inbound DHT
//! datagrams to [`DhtClient::handle_query`].

use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::error::DhtError;
use crate::krpc::{self, Message, NodeInfo, QueryBody, ResponseBody};
use crate::lookup::{LookupState, DEFAULT_ALPHA};
use crate::node_id::NodeId;
use crate::routing::{InsertOutcome, PeerRecord, RoutingTable, DEFAULT_K};

/// Length of an announce write token.
pub const TOKEN_LEN: usize = 8;

/// Tunables for the DHT client.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Bucket capacity and lookup shortlist width.
    pub k: usize,
    /// Lookup parallelism per round.
    pub alpha: usize,
    /// How long an announced peer stays in the local store.
    pub peer_ttl: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            peer_ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// Sends a query to a remote peer and awaits the matching response.
///
/// Implementors own the socket, correlate responses by transaction
/// id, and enforce the per-query timeout. A timeout surfaces as
/// [`DhtError::Timeout`]; a KRPC error reply as [`DhtError::Remote`].
pub trait QueryTransport: Send + Sync {
    /// Issue one query and wait for its response or timeout.
    fn query(
        &self,
        addr: SocketAddrV4,
        body: QueryBody,
    ) -> impl Future<Output = Result<ResponseBody, DhtError>> + Send;
}

/// Result of a topic lookup.
#[derive(Debug, Default)]
pub struct LookupResult {
    /// Announced peer endpoints, in discovery order.
    ///
    /// Not deduplicated: the same endpoint may appear once per DHT
    /// branch that returned it. Callers dedupe by endpoint if they
    /// need uniqueness.
    pub peers: Vec<SocketAddrV4>,
    /// The closest responding nodes, paired with the write token each
    /// returned. These are the announce targets.
    pub closest: Vec<(NodeInfo, Option<Bytes>)>,
}

struct StoredPeer {
    addr: SocketAddrV4,
    announced_at: Instant,
}

/// The Kademlia client: routing table, lookup driver, query server.
pub struct DhtClient {
    local_id: NodeId,
    config: DhtConfig,
    routing: Mutex<RoutingTable>,
    store: Mutex<HashMap<NodeId, Vec<StoredPeer>>>,
    token_secret: [u8; 32],
}

impl DhtClient {
    /// Create a client around a local id.
    #[must_use]
    pub fn new(local_id: NodeId, config: DhtConfig) -> Self {
        let routing = Mutex::new(RoutingTable::new(local_id, config.k));
        // Token secret only needs process-lifetime unpredictability.
        let mut token_secret = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut token_secret[..]);
        Self {
            local_id,
            config,
            routing,
            store: Mutex::new(HashMap::new()),
            token_secret,
        }
    }

    /// The local node id.
    #[must_use]
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Number of peers currently in the routing table.
    pub async fn table_len(&self) -> usize {
        self.routing.lock().await.len()
    }

    /// Join the network through a list of bootstrap endpoints.
    ///
    /// Runs a `find_node` for the local id against each bootstrap
    /// node, then walks the table outward. Individual failures are
    /// logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`DhtError::BootstrapFailed`] when no bootstrap node
    /// answered at all. The caller should treat this as degraded, not
    /// fatal: the node keeps listening and can still be found by
    /// peers that already know it.
    pub async fn bootstrap<T>(
        self: &Arc<Self>,
        transport: &Arc<T>,
        bootstrap: &[SocketAddrV4],
    ) -> Result<(), DhtError>
    where
        T: QueryTransport + 'static,
    {
        let mut reached = false;
        for addr in bootstrap {
            match transport
                .query(*addr, QueryBody::FindNode { target: self.local_id })
                .await
            {
                Ok(body) => {
                    reached = true;
                    if let Some(id) = body.id {
                        self.record_contact(transport, id, *addr).await;
                    }
                    let mut routing = self.routing.lock().await;
                    for node in &body.nodes {
                        let _ = routing.insert(PeerRecord::new(node.id, node.addr));
                    }
                }
                Err(err) => {
                    debug!(%addr, %err, "bootstrap node unreachable");
                }
            }
        }
        if !reached {
            return Err(DhtError::BootstrapFailed);
        }

        // Walk toward the local id to fill nearby buckets.
        let _ = self.find_node(transport, self.local_id).await;
        let peers = self.table_len().await;
        debug!(peers, "bootstrap complete");
        Ok(())
    }

    /// Iterative `find_node` toward an arbitrary target.
    ///
    /// Used by bootstrap and bucket refresh. Returns the closest
    /// responding nodes.
    pub async fn find_node<T>(
        self: &Arc<Self>,
        transport: &Arc<T>,
        target: NodeId,
    ) -> Vec<NodeInfo>
    where
        T: QueryTransport + 'static,
    {
        let lookup = self
            .drive_lookup(transport, target, false)
            .await;
        lookup
            .closest
            .into_iter()
            .map(|(info, _)| info)
            .collect()
    }

    /// Look up peers announced under a topic.
    ///
    /// Emits every peer endpoint returned by any responder; see
    /// [`LookupResult::peers`] for the deduplication contract.
    pub async fn lookup<T>(
        self: &Arc<Self>,
        transport: &Arc<T>,
        topic: NodeId,
    ) -> LookupResult
    where
        T: QueryTransport + 'static,
    {
        self.drive_lookup(transport, topic, true).await
    }

    /// Announce the local node as a peer for `topic` on `port`.
    ///
    /// Performs a `get_peers` walk, then sends `announce_peer` to the
    /// closest responders using the tokens they issued. Returns the
    /// peers discovered along the way, so one walk serves both sides
    /// of the rendezvous.
    pub async fn announce<T>(
        self: &Arc<Self>,
        transport: &Arc<T>,
        topic: NodeId,
        port: u16,
    ) -> LookupResult
    where
        T: QueryTransport + 'static,
    {
        let result = self.drive_lookup(transport, topic, true).await;

        let mut announced = 0usize;
        for (node, token) in &result.closest {
            let Some(token) = token else {
                continue;
            };
            let body = QueryBody::AnnouncePeer {
                info_hash: topic,
                port,
                token: token.clone(),
            };
            match transport.query(node.addr, body).await {
                Ok(_) => announced += 1,
                Err(err) => debug!(addr = %node.addr, %err, "announce_peer failed"),
            }
        }
        debug!(%topic, announced, "announce round finished");
        result
    }

    async fn drive_lookup<T>(
        self: &Arc<Self>,
        transport: &Arc<T>,
        target: NodeId,
        get_peers: bool,
    ) -> LookupResult
    where
        T: QueryTransport + 'static,
    {
        let seeds: Vec<NodeInfo> = {
            let routing = self.routing.lock().await;
            routing
                .closest(&target, self.config.k)
                .into_iter()
                .map(|p| NodeInfo { id: p.id, addr: p.addr })
                .collect()
        };

        let mut state = LookupState::new(target, seeds, self.config.k, self.config.alpha);
        let mut result = LookupResult::default();
        let mut tokens: HashMap<NodeId, Bytes> = HashMap::new();

        loop {
            let batch = state.next_batch();
            if batch.is_empty() {
                break;
            }

            let mut inflight = JoinSet::new();
            for peer in batch {
                let transport = Arc::clone(transport);
                let body = if get_peers {
                    QueryBody::GetPeers { info_hash: target }
                } else {
                    QueryBody::FindNode { target }
                };
                inflight.spawn(async move {
                    let outcome = transport.query(peer.addr, body).await;
                    (peer, outcome)
                });
            }

            while let Some(joined) = inflight.join_next().await {
                let Ok((peer, outcome)) = joined else {
                    continue;
                };
                match outcome {
                    Ok(body) => {
                        state.on_response(&peer.id, &body.nodes);
                        if let Some(token) = &body.token {
                            tokens.insert(peer.id, token.clone());
                        }
                        result.peers.extend(body.values.iter().copied());
                        self.record_contact(transport, peer.id, peer.addr).await;
                        let mut routing = self.routing.lock().await;
                        for node in &body.nodes {
                            let _ = routing.insert(PeerRecord::new(node.id, node.addr));
                        }
                    }
                    Err(err) => {
                        trace!(addr = %peer.addr, %err, "lookup query failed");
                        state.on_failure(&peer.id);
                    }
                }
            }
        }

        result.closest = state
            .closest_responded()
            .into_iter()
            .map(|info| {
                let token = tokens.get(&info.id).cloned();
                (info, token)
            })
            .collect();
        result
    }

    /// Record a live contact, applying the full bucket policy.
    ///
    /// On a full bucket the oldest occupant is pinged; only silence
    /// evicts it. A responsive incumbent keeps its slot and the new
    /// peer is dropped.
    pub async fn record_contact<T>(
        self: &Arc<Self>,
        transport: &Arc<T>,
        id: NodeId,
        addr: SocketAddrV4,
    ) where
        T: QueryTransport + 'static,
    {
        let outcome = {
            let mut routing = self.routing.lock().await;
            routing.insert(PeerRecord::new(id, addr))
        };
        if let InsertOutcome::Full { oldest } = outcome {
            match transport.query(oldest.addr, QueryBody::Ping).await {
                Ok(_) => {
                    let mut routing = self.routing.lock().await;
                    let _ = routing.insert(PeerRecord::new(oldest.id, oldest.addr));
                    trace!(incumbent = %oldest.id, "kept responsive incumbent");
                }
                Err(_) => {
                    let mut routing = self.routing.lock().await;
                    routing.replace(&oldest.id, PeerRecord::new(id, addr));
                    trace!(evicted = %oldest.id, new = %id, "evicted silent incumbent");
                }
            }
        }
    }

    /// Refresh buckets not touched within `staleness`.
    ///
    /// Synthesizes an id in each stale bucket and walks toward it,
    /// repopulating that region of the table.
    pub async fn refresh_stale_buckets<T>(
        self: &Arc<Self>,
        transport: &Arc<T>,
        staleness: Duration,
    ) where
        T: QueryTransport + 'static,
    {
        let stale = {
            let routing = self.routing.lock().await;
            routing.stale_buckets(staleness)
        };
        for bucket in stale {
            let target = NodeId::random_in_bucket(&self.local_id, bucket);
            let _ = self.find_node(transport, target).await;
        }
    }

    /// Drop table entries and stored announcements past their TTL.
    pub async fn prune(&self, peer_ttl: Duration) {
        let removed = {
            let mut routing = self.routing.lock().await;
            routing.prune(peer_ttl)
        };
        if removed > 0 {
            debug!(removed, "pruned stale routing entries");
        }
        let mut store = self.store.lock().await;
        let cutoff = self.config.peer_ttl;
        store.retain(|_, peers| {
            peers.retain(|p| p.announced_at.elapsed() < cutoff);
            !peers.is_empty()
        });
    }

    /// Answer one inbound query.
    ///
    /// Pure request handling: the caller updates the routing table
    /// for the querier separately via [`DhtClient::record_contact`].
    pub async fn handle_query(
        &self,
        from: SocketAddrV4,
        txn: Bytes,
        body: &QueryBody,
    ) -> Message {
        match body {
            QueryBody::Ping => Message::Response {
                txn,
                body: ResponseBody {
                    id: Some(self.local_id),
                    ..ResponseBody::default()
                },
            },
            QueryBody::FindNode { target } => {
                let nodes = self.closest_nodes(target).await;
                Message::Response {
                    txn,
                    body: ResponseBody {
                        id: Some(self.local_id),
                        nodes,
                        ..ResponseBody::default()
                    },
                }
            }
            QueryBody::GetPeers { info_hash } => {
                let values = self.stored_peers(info_hash).await;
                let nodes = if values.is_empty() {
                    self.closest_nodes(info_hash).await
                } else {
                    Vec::new()
                };
                Message::Response {
                    txn,
                    body: ResponseBody {
                        id: Some(self.local_id),
                        nodes,
                        values,
                        token: Some(self.issue_token(&from)),
                    },
                }
            }
            QueryBody::AnnouncePeer {
                info_hash,
                port,
                token,
            } => {
                if !self.verify_token(&from, token) {
                    warn!(%from, "announce_peer with invalid token");
                    return Message::Error {
                        txn,
                        code: krpc::ERROR_PROTOCOL,
                        message: "invalid token".into(),
                    };
                }
                let peer_addr = SocketAddrV4::new(*from.ip(), *port);
                let mut store = self.store.lock().await;
                let peers = store.entry(*info_hash).or_default();
                peers.retain(|p| p.addr != peer_addr);
                peers.push(StoredPeer {
                    addr: peer_addr,
                    announced_at: Instant::now(),
                });
                trace!(topic = %info_hash, peer = %peer_addr, "stored announced peer");
                Message::Response {
                    txn,
                    body: ResponseBody {
                        id: Some(self.local_id),
                        ..ResponseBody::default()
                    },
                }
            }
        }
    }

    async fn closest_nodes(&self, target: &NodeId) -> Vec<NodeInfo> {
        let routing = self.routing.lock().await;
        routing
            .closest(target, self.config.k)
            .into_iter()
            .map(|p| NodeInfo { id: p.id, addr: p.addr })
            .collect()
    }

    async fn stored_peers(&self, topic: &NodeId) -> Vec<SocketAddrV4> {
        let ttl = self.config.peer_ttl;
        let mut store = self.store.lock().await;
        match store.get_mut(topic) {
            Some(peers) => {
                peers.retain(|p| p.announced_at.elapsed() < ttl);
                peers.iter().map(|p| p.addr).collect()
            }
            None => Vec::new(),
        }
    }

    fn issue_token(&self, from: &SocketAddrV4) -> Bytes {
        let digest = blake3::keyed_hash(&self.token_secret, &from.ip().octets());
        Bytes::copy_from_slice(&digest.as_bytes()[..TOKEN_LEN])
    }

    fn verify_token(&self, from: &SocketAddrV4, token: &Bytes) -> bool {
        token.as_ref() == self.issue_token(from).as_ref()
    }
}
