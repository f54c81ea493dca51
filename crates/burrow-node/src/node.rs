//! The node orchestrator
//!
//! One UDP socket carries everything: KRPC traffic for the DHT, punch
//! probes and keepalives, handshakes, and encrypted payloads. The read
//! loop routes each datagram by its tag byte and resumes whichever
//! pending operation it answers, correlated by transaction id for DHT
//! queries and by correlation id for handshakes.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use burrow_crypto::x25519::{derive_session_key, PrivateKey, PublicKey};
use burrow_crypto::{AeadKey, SecureChannel};
use burrow_dht::krpc::to_v4;
use burrow_dht::{
    DhtClient, DhtConfig, DhtError, Message, NodeId, QueryBody, QueryTransport, ResponseBody,
};
use burrow_nat::{first_mapping, punch, PunchHandle};

use crate::config::NodeConfig;
use crate::connection::{Connection, ConnectionState};
use crate::error::NodeError;
use crate::event::{CloseReason, NodeEvent};
use crate::identity::load_or_generate;
use crate::packet::Frame;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const MAX_DATAGRAM: usize = 65_535;
const HANDSHAKE_RESEND: Duration = Duration::from_millis(500);
const DHT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Outbound DHT query side of the shared socket.
///
/// Each query picks a random transaction id, parks a oneshot sender
/// under it, and waits. The read loop completes the oneshot when the
/// matching response or error reply arrives.
pub(crate) struct DhtTransport {
    socket: Arc<UdpSocket>,
    local_id: NodeId,
    pending: Arc<DashMap<u32, oneshot::Sender<Result<ResponseBody, DhtError>>>>,
    timeout: Duration,
}

impl QueryTransport for DhtTransport {
    async fn query(&self, addr: SocketAddrV4, body: QueryBody) -> Result<ResponseBody, DhtError> {
        let txn_id: u32 = rand::random();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(txn_id, tx);

        let message = Message::Query {
            txn: Bytes::copy_from_slice(&txn_id.to_be_bytes()),
            id: self.local_id,
            body,
        };
        let wire = match message.encode() {
            Ok(wire) => wire,
            Err(err) => {
                self.pending.remove(&txn_id);
                return Err(err);
            }
        };
        if let Err(err) = self
            .socket
            .send_to(&Frame::Dht(Bytes::from(wire)).encode(), SocketAddr::V4(addr))
            .await
        {
            self.pending.remove(&txn_id);
            return Err(DhtError::Transport(err));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped at shutdown.
            Ok(Err(_)) => Err(DhtError::Timeout),
            Err(_) => {
                self.pending.remove(&txn_id);
                Err(DhtError::Timeout)
            }
        }
    }
}

struct PendingHandshake {
    correlation: [u8; 8],
    private: PrivateKey,
}

struct NodeInner {
    config: NodeConfig,
    local_id: NodeId,
    running: AtomicBool,
    socket: StdMutex<Option<Arc<UdpSocket>>>,
    transport: StdMutex<Option<Arc<DhtTransport>>>,
    public_addr: StdMutex<Option<SocketAddr>>,
    dht: Arc<DhtClient>,
    topic: Option<NodeId>,
    group_key: Option<AeadKey>,
    connections: DashMap<SocketAddr, Arc<Connection>>,
    pending_queries: Arc<DashMap<u32, oneshot::Sender<Result<ResponseBody, DhtError>>>>,
    pending_punches: DashMap<SocketAddr, PunchHandle>,
    pending_handshakes: DashMap<SocketAddr, PendingHandshake>,
    // Last answer sent per address, replayed when the initiator
    // resends an opener whose answer was lost.
    handshake_replies: DashMap<SocketAddr, ([u8; 8], Bytes)>,
    handshake_slots: Arc<Semaphore>,
    events: mpsc::Sender<NodeEvent>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// A running rendezvous node.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Builds a node and the event stream it will feed.
    ///
    /// Nothing touches the network until [`Node::start`].
    ///
    /// # Errors
    ///
    /// Returns an error when a passphrase is configured without a
    /// topic, or when group key derivation fails.
    pub fn new(config: NodeConfig) -> Result<(Self, mpsc::Receiver<NodeEvent>), NodeError> {
        let local_id = match &config.identity_path {
            Some(path) => load_or_generate(path),
            None => NodeId::random(),
        };

        let topic = config
            .topic
            .as_deref()
            .map(|t| NodeId::from_bytes(burrow_crypto::hash::topic_hash(t)));

        let group_key = match (&config.passphrase, config.topic.as_deref()) {
            (Some(passphrase), Some(t)) => {
                Some(burrow_crypto::passphrase::derive_group_key(passphrase, t)?)
            }
            (Some(_), None) => {
                return Err(NodeError::InvalidState("passphrase requires a topic"));
            }
            (None, _) => None,
        };

        let dht = Arc::new(DhtClient::new(
            local_id,
            DhtConfig {
                k: config.discovery.k,
                peer_ttl: config.discovery.peer_ttl,
                ..DhtConfig::default()
            },
        ));

        let (events, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(NodeInner {
            handshake_slots: Arc::new(Semaphore::new(config.connection.max_inflight_handshakes)),
            config,
            local_id,
            running: AtomicBool::new(false),
            socket: StdMutex::new(None),
            transport: StdMutex::new(None),
            public_addr: StdMutex::new(None),
            dht,
            topic,
            group_key,
            connections: DashMap::new(),
            pending_queries: Arc::new(DashMap::new()),
            pending_punches: DashMap::new(),
            pending_handshakes: DashMap::new(),
            handshake_replies: DashMap::new(),
            events,
            tasks: StdMutex::new(Vec::new()),
        });
        Ok((Self { inner }, event_rx))
    }

    /// The local node id.
    #[must_use]
    pub fn local_id(&self) -> NodeId {
        self.inner.local_id
    }

    /// The bound socket address, once the node is started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let guard = self.inner.socket.lock().unwrap();
        guard.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// The reflexive public address learned from STUN, if any.
    #[must_use]
    pub fn public_addr(&self) -> Option<SocketAddr> {
        *self.inner.public_addr.lock().unwrap()
    }

    /// Binds the socket and brings the node online.
    ///
    /// STUN discovery runs first so the reflexive address is known
    /// before anything is announced; a failed probe only degrades to
    /// the local address. Bootstrap failure is reported as an event
    /// and the node keeps listening.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Bind`] when the listen address cannot be
    /// bound, or [`NodeError::InvalidState`] when already started.
    pub async fn start(&self) -> Result<(), NodeError> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NodeError::InvalidState("node already started"));
        }

        let socket = Arc::new(
            UdpSocket::bind(self.inner.config.listen_addr)
                .await
                .map_err(NodeError::Bind)?,
        );
        let local = socket.local_addr()?;
        info!(%local, id = %self.inner.local_id, "node listening");

        // Probe before the read loop exists; both want the socket's
        // inbound traffic.
        let stun = &self.inner.config.nat;
        if !stun.stun_servers.is_empty() {
            match first_mapping(&socket, &stun.stun_servers, stun.stun_timeout).await {
                Some(mapped) => {
                    info!(%mapped, "reflexive address discovered");
                    *self.inner.public_addr.lock().unwrap() = Some(mapped);
                }
                None => warn!("no stun server answered, announcing local address"),
            }
        }

        let transport = Arc::new(DhtTransport {
            socket: Arc::clone(&socket),
            local_id: self.inner.local_id,
            pending: Arc::clone(&self.inner.pending_queries),
            timeout: self.inner.config.discovery.query_timeout,
        });
        *self.inner.socket.lock().unwrap() = Some(Arc::clone(&socket));
        *self.inner.transport.lock().unwrap() = Some(Arc::clone(&transport));

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(
            Arc::clone(&self.inner).read_loop(Arc::clone(&socket), Arc::clone(&transport)),
        ));

        let bootstrap: Vec<SocketAddrV4> = self
            .inner
            .config
            .discovery
            .bootstrap_nodes
            .iter()
            .copied()
            .filter_map(to_v4)
            .collect();
        if !bootstrap.is_empty() {
            let inner = Arc::clone(&self.inner);
            let transport = Arc::clone(&transport);
            tasks.push(tokio::spawn(async move {
                if let Err(err) = inner.dht.bootstrap(&transport, &bootstrap).await {
                    warn!(%err, "bootstrap failed, running isolated");
                    inner
                        .emit(NodeEvent::Error {
                            message: format!("bootstrap failed: {err}"),
                        })
                        .await;
                }
            }));
        }

        if self.inner.topic.is_some() {
            tasks.push(tokio::spawn(
                Arc::clone(&self.inner).announce_loop(Arc::clone(&transport)),
            ));
        }
        tasks.push(tokio::spawn(Arc::clone(&self.inner).keepalive_loop()));
        tasks.push(tokio::spawn(
            Arc::clone(&self.inner).dht_maintenance_loop(Arc::clone(&transport)),
        ));

        *self.inner.tasks.lock().unwrap() = tasks;
        Ok(())
    }

    /// Stops the node, closing every connection with `Shutdown`.
    ///
    /// Idempotent.
    pub async fn stop(&self) {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap());
        for task in tasks {
            task.abort();
        }

        let open: Vec<_> = self
            .inner
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for conn in open {
            let peer = conn.peer_id();
            if conn.close(CloseReason::Shutdown) {
                self.inner
                    .emit(NodeEvent::Closed {
                        peer,
                        addr: conn.addr(),
                        reason: CloseReason::Shutdown,
                    })
                    .await;
            }
        }
        self.inner.connections.clear();
        self.inner.pending_queries.clear();
        self.inner.pending_punches.clear();
        self.inner.pending_handshakes.clear();
        self.inner.handshake_replies.clear();
        self.inner.transport.lock().unwrap().take();
        self.inner.socket.lock().unwrap().take();
        info!("node stopped");
    }

    /// Opens a secure session to `addr`, punching through NAT first.
    ///
    /// Idempotent under concurrency: callers racing on the same
    /// address share one handshake and all resolve when it finishes.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::PunchFailed`] when no path opened,
    /// [`NodeError::HandshakeTimeout`] when the peer never answered
    /// the key exchange, [`NodeError::Busy`] when too many handshakes
    /// are already in flight.
    pub async fn connect(&self, addr: SocketAddr) -> Result<NodeId, NodeError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(NodeError::InvalidState("node not started"));
        }

        let (conn, drive) = match self.inner.connections.entry(addr) {
            Entry::Occupied(mut occupied) => {
                if matches!(occupied.get().state(), ConnectionState::Closed(_)) {
                    let conn = Arc::new(Connection::new(addr, rand::random()));
                    occupied.insert(Arc::clone(&conn));
                    (conn, true)
                } else {
                    (Arc::clone(occupied.get()), false)
                }
            }
            Entry::Vacant(vacant) => {
                let conn = Arc::new(Connection::new(addr, rand::random()));
                vacant.insert(Arc::clone(&conn));
                (conn, true)
            }
        };

        if drive {
            let permit = match Arc::clone(&self.inner.handshake_slots).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.inner.connections.remove(&addr);
                    conn.close(CloseReason::Explicit);
                    return Err(NodeError::Busy);
                }
            };
            let inner = Arc::clone(&self.inner);
            let driver_conn = Arc::clone(&conn);
            tokio::spawn(async move {
                inner.drive_handshake(driver_conn).await;
                drop(permit);
            });
        }

        conn.wait_established().await
    }

    /// Sends an encrypted payload to an established peer.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidState`] when no established
    /// connection to the peer exists.
    pub async fn send(&self, peer: &NodeId, payload: &[u8]) -> Result<(), NodeError> {
        let Some(conn) = self.connection_by_peer(peer) else {
            return Err(NodeError::InvalidState("no established connection to peer"));
        };
        self.inner.send_payload(&conn, payload).await
    }

    /// Sends a payload to every established peer.
    ///
    /// Per-peer failures are logged and skipped; returns how many
    /// peers were reached.
    pub async fn broadcast(&self, payload: &[u8]) -> usize {
        let established: Vec<_> = self
            .inner
            .connections
            .iter()
            .filter(|entry| matches!(entry.value().state(), ConnectionState::Established(_)))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut sent = 0;
        for conn in established {
            match self.inner.send_payload(&conn, payload).await {
                Ok(()) => sent += 1,
                Err(err) => debug!(addr = %conn.addr(), %err, "broadcast send failed"),
            }
        }
        sent
    }

    /// Closes the session with a peer.
    pub async fn disconnect(&self, peer: &NodeId) {
        let Some(conn) = self.connection_by_peer(peer) else {
            return;
        };
        if conn.close(CloseReason::Explicit) {
            self.inner
                .emit(NodeEvent::Closed {
                    peer: Some(*peer),
                    addr: conn.addr(),
                    reason: CloseReason::Explicit,
                })
                .await;
        }
        self.inner.connections.remove(&conn.addr());
        self.inner.handshake_replies.remove(&conn.addr());
    }

    /// Node ids of all established peers.
    #[must_use]
    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.inner
            .connections
            .iter()
            .filter_map(|entry| entry.value().peer_id())
            .collect()
    }

    fn connection_by_peer(&self, peer: &NodeId) -> Option<Arc<Connection>> {
        self.inner
            .connections
            .iter()
            .find(|entry| entry.value().peer_id().as_ref() == Some(peer))
            .map(|entry| Arc::clone(entry.value()))
    }
}

impl NodeInner {
    async fn emit(&self, event: NodeEvent) {
        // A dropped receiver means the application stopped listening.
        let _ = self.events.send(event).await;
    }

    fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.lock().unwrap().clone()
    }

    async fn send_payload(&self, conn: &Connection, payload: &[u8]) -> Result<(), NodeError> {
        let envelope = conn.seal(payload)?;
        let socket = self
            .socket()
            .ok_or(NodeError::InvalidState("node not started"))?;
        socket
            .send_to(&Frame::Payload(Bytes::from(envelope)).encode(), conn.addr())
            .await?;
        Ok(())
    }

    /// Punch, then key exchange. Runs once per connection attempt in
    /// its own task so callers can be cancelled freely.
    async fn drive_handshake(self: Arc<Self>, conn: Arc<Connection>) {
        let addr = conn.addr();
        let Some(socket) = self.socket() else {
            conn.close(CloseReason::Shutdown);
            return;
        };

        let (handle, opened) = PunchHandle::new();
        self.pending_punches.insert(addr, handle);
        let probe = Frame::Ping(self.local_id).encode();
        let outcome = punch(&socket, addr, &probe, &self.config.nat.punch, opened).await;
        self.pending_punches.remove(&addr);
        match outcome {
            Ok(true) => {}
            Ok(false) => {
                debug!(%addr, "punch exhausted, no path");
                self.fail_handshake(&conn, CloseReason::Unreachable).await;
                return;
            }
            Err(err) => {
                debug!(%addr, %err, "punch send failed");
                self.fail_handshake(&conn, CloseReason::SocketError).await;
                return;
            }
        }

        let private = PrivateKey::generate(&mut rand::rngs::OsRng);
        let public = private.public_key();
        self.pending_handshakes.insert(
            addr,
            PendingHandshake {
                correlation: conn.correlation(),
                private,
            },
        );
        let init = Frame::HandshakeInit {
            correlation: conn.correlation(),
            sender: self.local_id,
            public_key: public.to_bytes(),
        }
        .encode();

        // Resend until answered; UDP drops are expected right after a
        // punch.
        let deadline = Instant::now() + self.config.connection.handshake_timeout;
        loop {
            if let Err(err) = socket.send_to(&init, addr).await {
                debug!(%addr, %err, "handshake send failed");
                self.fail_handshake(&conn, CloseReason::SocketError).await;
                return;
            }
            tokio::select! {
                outcome = conn.wait_established() => {
                    if outcome.is_ok() {
                        trace!(%addr, "handshake complete");
                    }
                    return;
                }
                () = tokio::time::sleep_until(
                    std::cmp::min(deadline, Instant::now() + HANDSHAKE_RESEND),
                ) => {
                    if Instant::now() >= deadline {
                        debug!(%addr, "handshake timed out");
                        self.fail_handshake(&conn, CloseReason::HandshakeTimeout).await;
                        return;
                    }
                }
            }
        }
    }

    async fn fail_handshake(&self, conn: &Connection, reason: CloseReason) {
        self.pending_handshakes.remove(&conn.addr());
        self.handshake_replies.remove(&conn.addr());
        if conn.close(reason) {
            self.emit(NodeEvent::Closed {
                peer: None,
                addr: conn.addr(),
                reason,
            })
            .await;
        }
    }

    async fn read_loop(self: Arc<Self>, socket: Arc<UdpSocket>, transport: Arc<DhtTransport>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    warn!(%err, "socket receive failed");
                    self.emit(NodeEvent::Error {
                        message: format!("socket receive failed: {err}"),
                    })
                    .await;
                    continue;
                }
            };
            let Some(frame) = Frame::parse(&buf[..len]) else {
                trace!(%from, len, "dropped unrecognized datagram");
                continue;
            };

            match frame {
                Frame::Dht(wire) => self.on_dht(&socket, &transport, from, &wire),
                Frame::Ping(sender) => {
                    self.open_punched_path(from);
                    if let Some(conn) = self.connections.get(&from) {
                        conn.touch();
                    }
                    trace!(%from, %sender, "ping");
                    let _ = socket
                        .send_to(&Frame::Pong(self.local_id).encode(), from)
                        .await;
                }
                Frame::Pong(sender) => {
                    self.open_punched_path(from);
                    if let Some(conn) = self.connections.get(&from) {
                        conn.touch();
                    }
                    trace!(%from, %sender, "pong");
                }
                Frame::HandshakeInit {
                    correlation,
                    sender,
                    public_key,
                } => {
                    self.on_handshake_init(&socket, from, correlation, sender, public_key)
                        .await;
                }
                Frame::HandshakeResp {
                    correlation,
                    sender,
                    public_key,
                } => {
                    self.on_handshake_resp(from, correlation, sender, public_key)
                        .await;
                }
                Frame::Payload(envelope) => self.on_payload(from, &envelope).await,
            }
        }
    }

    /// Any datagram from a peer we are punching toward proves the
    /// path is open.
    fn open_punched_path(&self, from: SocketAddr) {
        if let Some((_, handle)) = self.pending_punches.remove(&from) {
            handle.resolve();
        }
    }

    fn on_dht(
        self: &Arc<Self>,
        socket: &Arc<UdpSocket>,
        transport: &Arc<DhtTransport>,
        from: SocketAddr,
        wire: &[u8],
    ) {
        let message = match Message::decode(wire) {
            Ok(message) => message,
            Err(err) => {
                trace!(%from, %err, "undecodable krpc datagram");
                return;
            }
        };
        match message {
            Message::Query { txn, id, body } => {
                let Some(v4) = to_v4(from) else {
                    return;
                };
                // Answering can itself query (the full-bucket ping),
                // which needs the read loop free to see the reply.
                let inner = Arc::clone(self);
                let socket = Arc::clone(socket);
                let transport = Arc::clone(transport);
                tokio::spawn(async move {
                    inner.dht.record_contact(&transport, id, v4).await;
                    let reply = inner.dht.handle_query(v4, txn, &body).await;
                    match reply.encode() {
                        Ok(wire) => {
                            let _ = socket
                                .send_to(&Frame::Dht(Bytes::from(wire)).encode(), from)
                                .await;
                        }
                        Err(err) => debug!(%err, "failed to encode krpc reply"),
                    }
                });
            }
            Message::Response { txn, body } => {
                if let Some(txn_id) = parse_txn(&txn) {
                    if let Some((_, tx)) = self.pending_queries.remove(&txn_id) {
                        let _ = tx.send(Ok(body));
                    }
                }
            }
            Message::Error { txn, code, message } => {
                if let Some(txn_id) = parse_txn(&txn) {
                    if let Some((_, tx)) = self.pending_queries.remove(&txn_id) {
                        let _ = tx.send(Err(DhtError::Remote { code, message }));
                    }
                }
            }
        }
    }

    async fn on_handshake_init(
        self: &Arc<Self>,
        socket: &Arc<UdpSocket>,
        from: SocketAddr,
        correlation: [u8; 8],
        sender: NodeId,
        public_key: [u8; 32],
    ) {
        self.open_punched_path(from);

        let existing_state = self.connections.get(&from).map(|c| c.state());
        if let Some(state) = existing_state {
            match state {
                ConnectionState::Established(_) => {
                    // Our answer to this opener may have been lost;
                    // replay it so the initiator can still derive the
                    // session key we are already using.
                    let cached = self
                        .handshake_replies
                        .get(&from)
                        .filter(|entry| entry.0 == correlation)
                        .map(|entry| entry.1.clone());
                    match cached {
                        Some(reply) => {
                            trace!(%from, "replaying handshake answer");
                            let _ = socket.send_to(&reply, from).await;
                        }
                        None => {
                            trace!(%from, "ignoring stale opener on established connection");
                        }
                    }
                    return;
                }
                ConnectionState::Handshaking if self.pending_handshakes.contains_key(&from) => {
                    // Simultaneous open. The smaller node id stays the
                    // initiator; the larger one abandons its opener
                    // and answers instead.
                    if self.local_id.as_bytes() < sender.as_bytes() {
                        trace!(%from, "simultaneous open, keeping initiator role");
                        return;
                    }
                    trace!(%from, "simultaneous open, yielding to peer's opener");
                    self.pending_handshakes.remove(&from);
                }
                _ => {}
            }
        }

        let private = PrivateKey::generate(&mut rand::rngs::OsRng);
        let public = private.public_key();
        let key = match self.session_key(&private, &public, &public_key) {
            Ok(key) => key,
            Err(err) => {
                debug!(%from, %err, "rejecting handshake init");
                return;
            }
        };

        let resp = Frame::HandshakeResp {
            correlation,
            sender: self.local_id,
            public_key: public.to_bytes(),
        }
        .encode();
        if let Err(err) = socket.send_to(&resp, from).await {
            debug!(%from, %err, "handshake answer send failed");
            return;
        }
        self.handshake_replies.insert(from, (correlation, resp));

        let conn = match self.connections.entry(from) {
            Entry::Occupied(mut occupied) => {
                if matches!(occupied.get().state(), ConnectionState::Closed(_)) {
                    let conn = Arc::new(Connection::new(from, correlation));
                    occupied.insert(Arc::clone(&conn));
                    conn
                } else {
                    Arc::clone(occupied.get())
                }
            }
            Entry::Vacant(vacant) => {
                let conn = Arc::new(Connection::new(from, correlation));
                vacant.insert(Arc::clone(&conn));
                conn
            }
        };
        if conn.establish(sender, SecureChannel::new(key)) {
            debug!(%from, peer = %sender, "session established (responder)");
            self.emit(NodeEvent::Connected { peer: sender, addr: from }).await;
        }
    }

    async fn on_handshake_resp(
        &self,
        from: SocketAddr,
        correlation: [u8; 8],
        sender: NodeId,
        public_key: [u8; 32],
    ) {
        self.open_punched_path(from);

        let Some(conn) = self.connections.get(&from).map(|c| Arc::clone(&c)) else {
            trace!(%from, "handshake answer without a connection");
            return;
        };
        if conn.correlation() != correlation {
            trace!(%from, "handshake answer with stale correlation id");
            return;
        }
        let Some((_, pending)) = self.pending_handshakes.remove(&from) else {
            return;
        };

        let public = pending.private.public_key();
        let key = match self.session_key(&pending.private, &public, &public_key) {
            Ok(key) => key,
            Err(err) => {
                debug!(%from, %err, "rejecting handshake answer");
                return;
            }
        };
        if conn.establish(sender, SecureChannel::new(key)) {
            debug!(%from, peer = %sender, "session established (initiator)");
            self.emit(NodeEvent::Connected { peer: sender, addr: from }).await;
        }
    }

    /// Session key for a handshake: the shared group key when a
    /// passphrase is configured, an ephemeral exchange otherwise.
    fn session_key(
        &self,
        private: &PrivateKey,
        ours: &PublicKey,
        theirs: &[u8; 32],
    ) -> Result<AeadKey, NodeError> {
        if let Some(group) = &self.group_key {
            return Ok(group.clone());
        }
        let theirs = PublicKey::from_bytes(*theirs);
        let shared = private.exchange(&theirs)?;
        Ok(derive_session_key(&shared, ours, &theirs))
    }

    async fn on_payload(&self, from: SocketAddr, envelope: &[u8]) {
        let Some(conn) = self.connections.get(&from).map(|c| Arc::clone(&c)) else {
            trace!(%from, "payload without a connection");
            return;
        };
        let Some(peer) = conn.peer_id() else {
            trace!(%from, "payload before handshake finished");
            return;
        };
        match conn.open(envelope) {
            Ok(plaintext) => {
                conn.touch();
                self.emit(NodeEvent::Data {
                    peer,
                    payload: Bytes::from(plaintext),
                })
                .await;
            }
            Err(err) => {
                // Forged or corrupted envelope; the session stays up.
                debug!(%from, %err, "dropping undecryptable payload");
            }
        }
    }

    /// Whether `addr` is one of this node's own mappings.
    ///
    /// Announced addresses come back from the DHT as seen by the
    /// responder, so without a STUN mapping the reflexive address is
    /// unknown and the socket's bound address has to stand in.
    fn is_own_address(&self, addr: SocketAddr) -> bool {
        if *self.public_addr.lock().unwrap() == Some(addr) {
            return true;
        }
        let Some(local) = self.socket().and_then(|s| s.local_addr().ok()) else {
            return false;
        };
        if addr.port() != local.port() {
            return false;
        }
        addr.ip() == local.ip() || (local.ip().is_unspecified() && addr.ip().is_loopback())
    }

    async fn announce_loop(self: Arc<Self>, transport: Arc<DhtTransport>) {
        let Some(topic) = self.topic else {
            return;
        };
        let mut ticker = tokio::time::interval(self.config.discovery.announce_interval);
        loop {
            ticker.tick().await;
            let reflexive = *self.public_addr.lock().unwrap();
            let advertised_port = reflexive
                .or_else(|| self.socket().and_then(|s| s.local_addr().ok()))
                .map_or(0, |a| a.port());
            if advertised_port == 0 {
                continue;
            }

            let result = self.dht.announce(&transport, topic, advertised_port).await;
            let mut seen = std::collections::HashSet::new();
            for peer in result.peers {
                let addr = SocketAddr::V4(peer);
                if self.is_own_address(addr) || !seen.insert(addr) {
                    continue;
                }
                if self
                    .connections
                    .get(&addr)
                    .is_some_and(|c| !matches!(c.state(), ConnectionState::Closed(_)))
                {
                    continue;
                }
                debug!(%addr, "peer discovered on topic");
                self.emit(NodeEvent::PeerDiscovered { addr }).await;
            }
        }
    }

    async fn keepalive_loop(self: Arc<Self>) {
        let interval = self.config.connection.keepalive_interval;
        let grace = self.config.connection.keepalive_grace;
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let established: Vec<_> = self
                .connections
                .iter()
                .filter(|entry| matches!(entry.value().state(), ConnectionState::Established(_)))
                .map(|entry| Arc::clone(entry.value()))
                .collect();

            for conn in established {
                if conn.idle() > interval + grace {
                    let peer = conn.peer_id();
                    if conn.close(CloseReason::Unreachable) {
                        debug!(addr = %conn.addr(), "peer unreachable, closing");
                        self.emit(NodeEvent::Closed {
                            peer,
                            addr: conn.addr(),
                            reason: CloseReason::Unreachable,
                        })
                        .await;
                    }
                    self.connections.remove(&conn.addr());
                    self.handshake_replies.remove(&conn.addr());
                    continue;
                }
                if let Some(socket) = self.socket() {
                    let _ = socket
                        .send_to(&Frame::Ping(self.local_id).encode(), conn.addr())
                        .await;
                }
            }
        }
    }

    async fn dht_maintenance_loop(self: Arc<Self>, transport: Arc<DhtTransport>) {
        let mut ticker = tokio::time::interval(DHT_MAINTENANCE_INTERVAL);
        ticker.tick().await;
        let mut last_refresh = Instant::now();
        loop {
            ticker.tick().await;
            self.dht.prune(self.config.discovery.peer_ttl).await;
            if last_refresh.elapsed() >= self.config.discovery.bucket_refresh {
                last_refresh = Instant::now();
                self.dht
                    .refresh_stale_buckets(&transport, self.config.discovery.bucket_refresh)
                    .await;
            }
        }
    }
}

fn parse_txn(txn: &Bytes) -> Option<u32> {
    let bytes: [u8; 4] = txn.as_ref().try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quiet_config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.listen_addr = "127.0.0.1:0".parse().unwrap();
        // Fast punch bursts keep failure-path tests quick.
        config.nat.punch.attempts = 3;
        config.nat.punch.interval = Duration::from_millis(30);
        config.connection.handshake_timeout = Duration::from_secs(2);
        config
    }

    #[test]
    fn test_passphrase_without_topic_rejected() {
        let mut config = quiet_config();
        config.passphrase = Some("hunter2".into());
        assert!(matches!(
            Node::new(config),
            Err(NodeError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_start_is_exclusive_and_stop_idempotent() {
        let (node, _events) = Node::new(quiet_config()).unwrap();
        node.start().await.unwrap();
        assert!(matches!(
            node.start().await,
            Err(NodeError::InvalidState(_))
        ));
        node.stop().await;
        node.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let mut config = quiet_config();
        // TEST-NET-3 is never a local interface address.
        config.listen_addr = "203.0.113.1:0".parse().unwrap();
        let (node, _events) = Node::new(config).unwrap();
        assert!(matches!(node.start().await, Err(NodeError::Bind(_))));
    }

    #[tokio::test]
    async fn test_connect_requires_running() {
        let (node, _events) = Node::new(quiet_config()).unwrap();
        let result = node.connect("127.0.0.1:9999".parse().unwrap()).await;
        assert!(matches!(result, Err(NodeError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_connect_to_silent_peer_fails_unreachable() {
        let (node, _events) = Node::new(quiet_config()).unwrap();
        node.start().await.unwrap();

        // A bound socket that never answers.
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let result = node.connect(sink.local_addr().unwrap()).await;
        assert!(matches!(result, Err(NodeError::Unreachable)));
        node.stop().await;
    }

    #[tokio::test]
    async fn test_two_nodes_connect_and_exchange() {
        let (a, mut a_events) = Node::new(quiet_config()).unwrap();
        let (b, mut b_events) = Node::new(quiet_config()).unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();

        let peer = a.connect(b.local_addr().unwrap()).await.unwrap();
        assert_eq!(peer, b.local_id());

        // Both sides report the session.
        let connected = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(NodeEvent::Connected { peer, .. }) = b_events.recv().await {
                    return peer;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(connected, a.local_id());

        a.send(&b.local_id(), b"hello from a").await.unwrap();
        let payload = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(NodeEvent::Data { payload, .. }) = b_events.recv().await {
                    return payload;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(&payload[..], b"hello from a");

        b.send(&a.local_id(), b"hello back").await.unwrap();
        let payload = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(NodeEvent::Data { payload, .. }) = a_events.recv().await {
                    return payload;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(&payload[..], b"hello back");

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_connect_shares_one_handshake() {
        let (a, _a_events) = Node::new(quiet_config()).unwrap();
        let (b, _b_events) = Node::new(quiet_config()).unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();
        let target = b.local_addr().unwrap();

        let mut joins = tokio::task::JoinSet::new();
        for _ in 0..4 {
            let a = a.clone();
            joins.spawn(async move { a.connect(target).await });
        }
        while let Some(joined) = joins.join_next().await {
            assert_eq!(joined.unwrap().unwrap(), b.local_id());
        }
        assert_eq!(a.connected_peers().len(), 1);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_group_key_nodes_interoperate() {
        let make = |pass: &str| {
            let mut config = quiet_config();
            config.topic = Some("den".into());
            config.passphrase = Some(pass.into());
            // Announce traffic would need a DHT; topic alone is fine.
            config.discovery.announce_interval = Duration::from_secs(3600);
            Node::new(config).unwrap()
        };
        let (a, _a_events) = make("swordfish");
        let (b, mut b_events) = make("swordfish");
        a.start().await.unwrap();
        b.start().await.unwrap();

        a.connect(b.local_addr().unwrap()).await.unwrap();
        a.send(&b.local_id(), b"group secret").await.unwrap();
        let payload = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(NodeEvent::Data { payload, .. }) = b_events.recv().await {
                    return payload;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(&payload[..], b"group secret");

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_disconnect_emits_closed() {
        let (a, mut a_events) = Node::new(quiet_config()).unwrap();
        let (b, _b_events) = Node::new(quiet_config()).unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();

        let peer = a.connect(b.local_addr().unwrap()).await.unwrap();
        a.disconnect(&peer).await;
        assert!(a.connected_peers().is_empty());

        let reason = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(NodeEvent::Closed { reason, .. }) = a_events.recv().await {
                    return reason;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(reason, CloseReason::Explicit);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_own_address_filter() {
        let (node, _events) = Node::new(quiet_config()).unwrap();
        node.start().await.unwrap();
        let local = node.local_addr().unwrap();

        // Without a reflexive mapping the bound address stands in.
        assert!(node.inner.is_own_address(local));
        let other = SocketAddr::new(local.ip(), local.port().wrapping_add(1));
        assert!(!node.inner.is_own_address(other));

        let reflexive: SocketAddr = "203.0.113.9:4444".parse().unwrap();
        assert!(!node.inner.is_own_address(reflexive));
        *node.inner.public_addr.lock().unwrap() = Some(reflexive);
        assert!(node.inner.is_own_address(reflexive));
        node.stop().await;

        // A wildcard bind still recognizes its loopback mapping.
        let mut config = quiet_config();
        config.listen_addr = SocketAddr::from(([0, 0, 0, 0], 0));
        let (wild, _wild_events) = Node::new(config).unwrap();
        wild.start().await.unwrap();
        let port = wild.local_addr().unwrap().port();
        assert!(wild.inner.is_own_address(SocketAddr::from(([127, 0, 0, 1], port))));
        wild.stop().await;
    }

    #[tokio::test]
    async fn test_disconnect_drops_cached_handshake_answer() {
        let (a, _a_events) = Node::new(quiet_config()).unwrap();
        let (b, _b_events) = Node::new(quiet_config()).unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();

        a.connect(b.local_addr().unwrap()).await.unwrap();
        // The responder cached its answer for replay.
        assert!(!b.inner.handshake_replies.is_empty());

        b.disconnect(&a.local_id()).await;
        assert!(b.inner.handshake_replies.is_empty());

        a.stop().await;
        b.stop().await;
    }
}
