//! UDP Edge Listener
//!
//! Multiplexes many logical edges over a single UDP socket. Every
//! datagram starts with an 8-byte header carrying the two edge ids, named
//! from the receiver's perspective:
//!
//! ```text
//! [remote_id:4 BE][local_id:4 BE][payload...]
//! ```
//!
//! A negative `local_id` marks a control packet; its payload begins with
//! an `i32` control code. Control sends invert the peer's id so the far
//! side can recognize and re-complement it.
//!
//! | Code | Meaning          |
//! |------|------------------|
//! | 1    | EdgeClosed       |
//! | 2    | EdgeDataAnnounce |
//! | 3    | Null (no-op)     |
//!
//! The listener owns exactly two tasks: a reader (sole socket reader) and
//! a writer draining a bounded send queue (sole socket writer). Queue
//! overflow drops the new message rather than blocking the caller.

use crate::config::UdpConfig;
use crate::transport::edge::{Edge, EdgeError, EdgeEventSink, EdgeSink};
use crate::transport::nat::{NatHistory, NatPoint};
use crate::transport::{TaAuthorizer, TaError, TaType, TransportAddress};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

// ============================================================================
// Constants
// ============================================================================

/// Size of the id header on every datagram.
pub const HEADER_SIZE: usize = 8;

/// Control code: the peer closed the edge (or never had it).
pub const CONTROL_EDGE_CLOSED: i32 = 1;

/// Control code: endpoint announcement carrying both observed TAs.
pub const CONTROL_EDGE_DATA_ANNOUNCE: i32 = 2;

/// Control code: no-op wakeup.
pub const CONTROL_NULL: i32 = 3;

/// Receive buffer size; comfortably above any path MTU.
const RECV_BUFFER_SIZE: usize = 8192;

/// Attempts at drawing an unused random edge id before giving up.
const ID_ALLOC_MAX_ATTEMPTS: usize = 100;

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by the UDP edge listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("listener not started")]
    NotStarted,

    #[error("listener cannot be started twice")]
    RestartAttempted,

    #[error("wrong transport address type: {0}")]
    WrongTaType(TaType),

    #[error("endpoint not authorized: {0}")]
    Unauthorized(TransportAddress),

    #[error("invalid transport address: {0}")]
    InvalidTa(#[from] TaError),

    #[error("bind failed: {0}")]
    Bind(#[from] std::io::Error),

    #[error("edge id space exhausted")]
    IdSpaceExhausted,
}

// ============================================================================
// Wire Codec
// ============================================================================

/// Parse the id header. Returns `(remote_id, local_id)` from the
/// receiver's perspective, or None for a runt datagram.
fn parse_header(data: &[u8]) -> Option<(i32, i32)> {
    if data.len() < HEADER_SIZE {
        return None;
    }
    let remote_id = i32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let local_id = i32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    Some((remote_id, local_id))
}

/// Assemble a datagram. `local_id` is the sender's own edge id and lands
/// in the receiver's `remote_id` field; `remote_field` is the sender's
/// view of the peer id, already complemented for control packets.
fn encode_datagram(local_id: i32, remote_field: i32, payload: &[u8]) -> Vec<u8> {
    let mut wire = Vec::with_capacity(HEADER_SIZE + payload.len());
    wire.extend_from_slice(&local_id.to_be_bytes());
    wire.extend_from_slice(&remote_field.to_be_bytes());
    wire.extend_from_slice(payload);
    wire
}

/// Assemble a control payload: `[code:4 BE][body...]`.
fn encode_control(code: i32, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + body.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(body);
    payload
}

/// Body of an `EdgeDataAnnounce` control packet.
///
/// Field names are from the *sender's* perspective: the receiver's local
/// endpoint is the sender's `RemoteTA`. The string keys are fixed for
/// wire interoperability.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceBody {
    /// The peer of the announcing node, i.e. the receiver.
    #[serde(rename = "RemoteTA")]
    pub remote_ta: String,
    /// The announcing node's own endpoint.
    #[serde(rename = "LocalTA")]
    pub local_ta: String,
}

// ============================================================================
// Send Queue
// ============================================================================

/// One queued outbound datagram.
#[derive(Debug)]
struct UdpMessage {
    local_id: i32,
    /// Peer id, complemented when the payload is control.
    remote_field: i32,
    payload: Vec<u8>,
    dest: SocketAddr,
}

/// Writer-queue entry; the sentinel unblocks the writer at shutdown.
#[derive(Debug)]
enum Outbound {
    Datagram(UdpMessage),
    Shutdown,
}

type OutboundTx = mpsc::Sender<Outbound>;

// ============================================================================
// Edge Registry
// ============================================================================

struct EdgeTables {
    by_local: HashMap<i32, Arc<UdpEdge>>,
    by_remote: HashMap<i32, Arc<UdpEdge>>,
}

/// Owner of the edge maps and the NAT history.
///
/// Edges hold a weak handle back here so a local close can unregister
/// itself; the registry never keeps an edge alive on its own account
/// beyond the maps.
pub(crate) struct EdgeRegistry {
    tables: Mutex<EdgeTables>,
    pub(crate) nat: NatHistory,
}

impl EdgeRegistry {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            tables: Mutex::new(EdgeTables {
                by_local: HashMap::new(),
                by_remote: HashMap::new(),
            }),
            nat: NatHistory::new(),
        })
    }

    fn get_local(&self, id: i32) -> Option<Arc<UdpEdge>> {
        self.tables
            .lock()
            .expect("edge table lock poisoned")
            .by_local
            .get(&id)
            .cloned()
    }

    fn get_remote(&self, id: i32) -> Option<Arc<UdpEdge>> {
        self.tables
            .lock()
            .expect("edge table lock poisoned")
            .by_remote
            .get(&id)
            .cloned()
    }

    /// Draw an unused positive 31-bit id and register a new edge under it.
    ///
    /// The draw and the insert share one critical section so concurrent
    /// registrations can never collide.
    fn register(
        self: &Arc<Self>,
        remote_id: i32,
        end: SocketAddr,
        local_addr: SocketAddr,
        inbound: bool,
        outbound: OutboundTx,
    ) -> Result<Arc<UdpEdge>, ListenerError> {
        let mut tables = self.tables.lock().expect("edge table lock poisoned");

        let mut rng = rand::rng();
        let mut local_id = 0;
        for _ in 0..ID_ALLOC_MAX_ATTEMPTS {
            let candidate: i32 = rng.random_range(1..=i32::MAX);
            if !tables.by_local.contains_key(&candidate) {
                local_id = candidate;
                break;
            }
        }
        if local_id == 0 {
            return Err(ListenerError::IdSpaceExhausted);
        }

        let edge = Arc::new(UdpEdge {
            local_id,
            remote_id: AtomicI32::new(remote_id),
            end: Mutex::new(end),
            local_addr,
            peer_view: Mutex::new(None),
            inbound,
            closed: AtomicBool::new(false),
            sink: RwLock::new(None),
            outbound,
            registry: Arc::downgrade(self),
        });

        tables.by_local.insert(local_id, edge.clone());
        if remote_id != 0 {
            tables.by_remote.insert(remote_id, edge.clone());
        }
        Ok(edge)
    }

    /// Index an edge under its freshly learned remote id.
    fn index_remote(&self, remote_id: i32, edge: &Arc<UdpEdge>) {
        self.tables
            .lock()
            .expect("edge table lock poisoned")
            .by_remote
            .insert(remote_id, edge.clone());
    }

    /// Drop an edge from both maps. The remote index is only removed when
    /// it still points at this edge: an id coincidence may have replaced
    /// the entry with a newer edge.
    fn unregister(&self, edge: &UdpEdge) {
        let mut tables = self.tables.lock().expect("edge table lock poisoned");
        tables.by_local.remove(&edge.local_id);
        let remote_id = edge.remote_id();
        if let Some(current) = tables.by_remote.get(&remote_id) {
            if current.local_id == edge.local_id {
                tables.by_remote.remove(&remote_id);
            }
        }
    }

    fn edges(&self) -> Vec<Arc<UdpEdge>> {
        self.tables
            .lock()
            .expect("edge table lock poisoned")
            .by_local
            .values()
            .cloned()
            .collect()
    }

    fn len(&self) -> usize {
        self.tables
            .lock()
            .expect("edge table lock poisoned")
            .by_local
            .len()
    }
}

// ============================================================================
// UdpEdge
// ============================================================================

/// One logical edge multiplexed over the listener's socket.
pub struct UdpEdge {
    local_id: i32,
    remote_id: AtomicI32,
    /// Remote endpoint as currently observed; a NAT remap mutates it.
    end: Mutex<SocketAddr>,
    local_addr: SocketAddr,
    /// What the peer last reported seeing us as.
    peer_view: Mutex<Option<TransportAddress>>,
    inbound: bool,
    closed: AtomicBool,
    sink: RwLock<Option<Arc<dyn EdgeSink>>>,
    /// Send capability: a clone of the listener's writer queue.
    outbound: OutboundTx,
    registry: Weak<EdgeRegistry>,
}

impl UdpEdge {
    fn end(&self) -> SocketAddr {
        *self.end.lock().expect("edge end lock poisoned")
    }

    fn set_end(&self, end: SocketAddr) {
        *self.end.lock().expect("edge end lock poisoned") = end;
    }

    /// Adopt the remote id exactly once; later attempts fail silently.
    fn try_set_remote_id(&self, remote_id: i32) -> bool {
        self.remote_id
            .compare_exchange(0, remote_id, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn peer_view(&self) -> Option<TransportAddress> {
        self.peer_view
            .lock()
            .expect("edge peer view lock poisoned")
            .clone()
    }

    fn set_peer_view(&self, view: TransportAddress) {
        *self.peer_view.lock().expect("edge peer view lock poisoned") = Some(view);
    }

    /// Hand a payload to the registered sink, if any.
    fn deliver(&self, payload: &[u8]) {
        let sink = self
            .sink
            .read()
            .expect("edge sink lock poisoned")
            .clone();
        match sink {
            Some(sink) => sink.on_packet(payload),
            None => trace!(
                local_id = self.local_id,
                len = payload.len(),
                "No sink registered, dropping payload"
            ),
        }
    }

    /// Queue a datagram regardless of the closed flag. Queue overflow
    /// drops the message: this layer must never stall its caller.
    fn enqueue_raw(&self, remote_field: i32, payload: Vec<u8>) {
        let msg = Outbound::Datagram(UdpMessage {
            local_id: self.local_id,
            remote_field,
            payload,
            dest: self.end(),
        });
        match self.outbound.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(local_id = self.local_id, "Send queue full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(local_id = self.local_id, "Send queue gone, dropping message");
            }
        }
    }

    /// Queue a control packet on this edge.
    fn send_control(&self, code: i32, body: &[u8]) {
        let remote_id = self.remote_id();
        self.enqueue_raw(!remote_id, encode_control(code, body));
    }

    /// Transition to Closed, optionally telling the peer first.
    fn close_internal(&self, notify_peer: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if notify_peer {
            self.send_control(CONTROL_EDGE_CLOSED, &[]);
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self);
            registry
                .nat
                .record(NatPoint::edge_close(self.local_id, self.remote_ta()));
        }
        let sink = self
            .sink
            .read()
            .expect("edge sink lock poisoned")
            .clone();
        if let Some(sink) = sink {
            sink.on_close();
        }
        debug!(local_id = self.local_id, "Edge closed");
    }
}

impl Edge for UdpEdge {
    fn send(&self, payload: &[u8]) -> Result<(), EdgeError> {
        if self.is_closed() {
            return Err(EdgeError::Closed);
        }
        if payload.len() > RECV_BUFFER_SIZE - HEADER_SIZE {
            return Err(EdgeError::PayloadTooLarge(payload.len()));
        }
        self.enqueue_raw(self.remote_id(), payload.to_vec());
        Ok(())
    }

    fn close(&self) {
        self.close_internal(true);
    }

    fn local_id(&self) -> i32 {
        self.local_id
    }

    fn remote_id(&self) -> i32 {
        self.remote_id.load(Ordering::Acquire)
    }

    fn remote_ta(&self) -> TransportAddress {
        TransportAddress::from_socket_addr(self.end())
    }

    fn local_ta(&self) -> TransportAddress {
        TransportAddress::from_socket_addr(self.local_addr)
    }

    fn peer_view_of_local_ta(&self) -> Option<TransportAddress> {
        self.peer_view()
    }

    fn is_inbound(&self) -> bool {
        self.inbound
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn set_sink(&self, sink: Arc<dyn EdgeSink>) {
        *self.sink.write().expect("edge sink lock poisoned") = Some(sink);
    }
}

impl fmt::Debug for UdpEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpEdge")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id())
            .field("end", &self.end())
            .field("inbound", &self.inbound)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// Listener State
// ============================================================================

/// Listener lifecycle. Start is permitted exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ListenerState {
    Created,
    Running,
    Stopped,
}

// ============================================================================
// UdpEdgeListener
// ============================================================================

/// State shared between the listener handle and its reader task.
struct Shared {
    registry: Arc<EdgeRegistry>,
    authorizer: Arc<dyn TaAuthorizer>,
    event_sink: RwLock<Option<Arc<dyn EdgeEventSink>>>,
    outbound_tx: RwLock<Option<OutboundTx>>,
    local_addr: RwLock<Option<SocketAddr>>,
}

/// The UDP edge transport: one socket, many edges.
pub struct UdpEdgeListener {
    config: UdpConfig,
    shared: Arc<Shared>,
    state: Mutex<ListenerState>,
    shutdown: Arc<Notify>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpEdgeListener {
    /// Create a listener from configuration and an authorization
    /// capability. Nothing is bound until [`UdpEdgeListener::start`].
    pub fn new(config: UdpConfig, authorizer: Arc<dyn TaAuthorizer>) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                registry: EdgeRegistry::new(),
                authorizer,
                event_sink: RwLock::new(None),
                outbound_tx: RwLock::new(None),
                local_addr: RwLock::new(None),
            }),
            state: Mutex::new(ListenerState::Created),
            shutdown: Arc::new(Notify::new()),
            reader_task: Mutex::new(None),
            writer_task: Mutex::new(None),
        }
    }

    /// The transport type this listener serves.
    pub fn ta_type(&self) -> TaType {
        TaType::Udp
    }

    /// Register the sink told about every new edge.
    pub fn set_event_sink(&self, sink: Arc<dyn EdgeEventSink>) {
        *self
            .shared
            .event_sink
            .write()
            .expect("event sink lock poisoned") = Some(sink);
    }

    /// Bound socket address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .shared
            .local_addr
            .read()
            .expect("local addr lock poisoned")
    }

    /// The ranked list of addresses to advertise to peers.
    pub fn local_tas(&self) -> Arc<[TransportAddress]> {
        self.shared.registry.nat.local_tas()
    }

    /// The NAT event history backing the advertised-address list.
    pub fn nat_history(&self) -> &NatHistory {
        &self.shared.registry.nat
    }

    /// Number of live edges.
    pub fn edge_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// True while the listener is serving traffic.
    pub fn is_running(&self) -> bool {
        *self.state.lock().expect("listener state lock poisoned") == ListenerState::Running
    }

    /// Bind the socket and spawn the reader and writer tasks.
    ///
    /// A listener can be started at most once; a second call fails even
    /// after a stop.
    pub async fn start(&self) -> Result<(), ListenerError> {
        {
            let mut state = self.state.lock().expect("listener state lock poisoned");
            if *state != ListenerState::Created {
                return Err(ListenerError::RestartAttempted);
            }
            *state = ListenerState::Running;
        }

        let bind = self.config.bind_addr();
        let socket = match UdpSocket::bind(&bind).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                *self.state.lock().expect("listener state lock poisoned") =
                    ListenerState::Stopped;
                return Err(ListenerError::Bind(e));
            }
        };
        let local_addr = socket.local_addr()?;
        *self
            .shared
            .local_addr
            .write()
            .expect("local addr lock poisoned") = Some(local_addr);

        // Advertised addresses: configured overrides, else the bound socket.
        let base_tas = match self.config.parsed_local_tas()? {
            tas if !tas.is_empty() => tas,
            _ => vec![TransportAddress::from_socket_addr(local_addr)],
        };
        self.shared.registry.nat.set_base_tas(base_tas);

        let (tx, rx) = mpsc::channel(self.config.send_queue_cap());
        *self
            .shared
            .outbound_tx
            .write()
            .expect("outbound tx lock poisoned") = Some(tx);

        let reader_socket = socket.clone();
        let reader_shared = self.shared.clone();
        let shutdown = self.shutdown.clone();
        *self.reader_task.lock().expect("reader task lock poisoned") =
            Some(tokio::spawn(async move {
                reader_loop(reader_socket, reader_shared, shutdown).await;
            }));

        *self.writer_task.lock().expect("writer task lock poisoned") =
            Some(tokio::spawn(async move {
                writer_loop(socket, rx).await;
            }));

        info!(local_addr = %local_addr, "UDP edge listener started");
        Ok(())
    }

    /// Stop the listener: unblock and join both tasks, close all edges.
    ///
    /// Idempotent; calling stop on a never-started listener just marks it
    /// stopped.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().expect("listener state lock poisoned");
            match *state {
                ListenerState::Running => *state = ListenerState::Stopped,
                ListenerState::Created => {
                    *state = ListenerState::Stopped;
                    return;
                }
                ListenerState::Stopped => return,
            }
        }

        self.shutdown.notify_one();

        let tx = self
            .shared
            .outbound_tx
            .write()
            .expect("outbound tx lock poisoned")
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(Outbound::Shutdown).await;
        }

        let reader = self.reader_task.lock().expect("reader task lock poisoned").take();
        if let Some(task) = reader {
            let _ = task.await;
        }
        let writer = self.writer_task.lock().expect("writer task lock poisoned").take();
        if let Some(task) = writer {
            let _ = task.await;
        }

        for edge in self.shared.registry.edges() {
            edge.close_internal(false);
        }

        info!("UDP edge listener stopped");
    }

    /// Create an outbound edge to a UDP transport address.
    ///
    /// The edge starts inside its handshake window (`remote_id == 0`);
    /// the peer's id is adopted from its first reply.
    pub fn create_edge_to(&self, ta: &TransportAddress) -> Result<Arc<UdpEdge>, ListenerError> {
        if !self.is_running() {
            return Err(ListenerError::NotStarted);
        }
        if ta.ta_type() != TaType::Udp {
            return Err(ListenerError::WrongTaType(ta.ta_type()));
        }
        if !self.shared.authorizer.authorize(ta) {
            return Err(ListenerError::Unauthorized(ta.clone()));
        }
        let dest = ta.to_socket_addr()?;

        let outbound = self
            .shared
            .outbound_tx
            .read()
            .expect("outbound tx lock poisoned")
            .clone()
            .ok_or(ListenerError::NotStarted)?;
        let local_addr = self.local_addr().ok_or(ListenerError::NotStarted)?;

        let edge = self
            .shared
            .registry
            .register(0, dest, local_addr, false, outbound)?;
        self.shared
            .registry
            .nat
            .record(NatPoint::new_edge(edge.local_id(), ta.clone()));

        debug!(local_id = edge.local_id(), dest = %dest, "Outbound edge created");
        self.shared.fire_edge_event(edge.clone());
        Ok(edge)
    }
}

impl Shared {
    fn fire_edge_event(&self, edge: Arc<UdpEdge>) {
        let sink = self
            .event_sink
            .read()
            .expect("event sink lock poisoned")
            .clone();
        if let Some(sink) = sink {
            sink.on_edge(edge);
        }
    }

    /// Our best advertised endpoint for announce bodies.
    fn primary_local_ta(&self) -> TransportAddress {
        if let Some(ta) = self.registry.nat.local_tas().first() {
            return ta.clone();
        }
        let addr = self
            .local_addr
            .read()
            .expect("local addr lock poisoned")
            .expect("listener running without a bound address");
        TransportAddress::from_socket_addr(addr)
    }

    /// Queue a control packet for an endpoint we hold no edge for.
    ///
    /// `local_id`/`remote_id` are the ids as read from the offending
    /// datagram; the complement on `remote_id` routes the reply to the
    /// sender's edge.
    fn send_raw_control(&self, dest: SocketAddr, local_id: i32, remote_id: i32, code: i32) {
        let tx = self
            .outbound_tx
            .read()
            .expect("outbound tx lock poisoned")
            .clone();
        let Some(tx) = tx else { return };
        let msg = Outbound::Datagram(UdpMessage {
            local_id,
            remote_field: !remote_id,
            payload: encode_control(code, &[]),
            dest,
        });
        if tx.try_send(msg).is_err() {
            debug!(dest = %dest, "Send queue full, dropping control reply");
        }
    }

    /// Queue an `EdgeDataAnnounce` on an edge, reporting both endpoints
    /// as we currently observe them.
    fn send_announce(&self, edge: &UdpEdge) {
        let body = AnnounceBody {
            remote_ta: edge.remote_ta().to_string(),
            local_ta: self.primary_local_ta().to_string(),
        };
        let json = serde_json::to_vec(&body).expect("announce body serializes");
        edge.send_control(CONTROL_EDGE_DATA_ANNOUNCE, &json);
    }

    /// Dispatch one inbound datagram.
    fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        let Some((remote_id, local_id)) = parse_header(data) else {
            debug!(len = data.len(), from = %from, "Dropping malformed datagram");
            return;
        };
        let payload = &data[HEADER_SIZE..];

        if local_id < 0 {
            self.handle_control(!local_id, payload, from);
        } else if local_id == 0 {
            self.handle_handshake(remote_id, payload, from);
        } else {
            self.handle_data(remote_id, local_id, payload, from);
        }
    }

    /// A datagram with `local_id == 0`: the sender has no id for us yet.
    fn handle_handshake(&self, remote_id: i32, payload: &[u8], from: SocketAddr) {
        if let Some(edge) = self.registry.get_remote(remote_id) {
            if edge.end() == from {
                // The peer resent its first packet before our reply made
                // it back; same edge.
                edge.deliver(payload);
                return;
            }
            // Different endpoint chose the same id: a coincidence, not a
            // duplicate. Allocate a fresh edge below.
        }

        let ta = TransportAddress::from_socket_addr(from);
        if !self.authorizer.authorize(&ta) {
            debug!(from = %from, "Unauthorized inbound endpoint, dropping");
            return;
        }

        let outbound = self
            .outbound_tx
            .read()
            .expect("outbound tx lock poisoned")
            .clone();
        let Some(outbound) = outbound else { return };
        let local_addr = self
            .local_addr
            .read()
            .expect("local addr lock poisoned")
            .expect("listener running without a bound address");

        let edge = match self
            .registry
            .register(remote_id, from, local_addr, true, outbound)
        {
            Ok(edge) => edge,
            Err(e) => {
                warn!(error = %e, from = %from, "Failed to create inbound edge");
                return;
            }
        };
        self.registry
            .nat
            .record(NatPoint::new_edge(edge.local_id(), ta));

        debug!(
            local_id = edge.local_id(),
            remote_id, from = %from,
            "Inbound edge created"
        );
        self.fire_edge_event(edge.clone());
        self.send_announce(&edge);
        edge.deliver(payload);
    }

    /// A data datagram addressed to an existing edge id.
    fn handle_data(&self, remote_id: i32, local_id: i32, payload: &[u8], from: SocketAddr) {
        let Some(edge) = self.registry.get_local(local_id) else {
            self.send_raw_control(from, local_id, remote_id, CONTROL_EDGE_CLOSED);
            return;
        };

        if edge.remote_id() == 0 {
            if remote_id != 0 && edge.try_set_remote_id(remote_id) {
                self.registry.index_remote(remote_id, &edge);
                debug!(local_id, remote_id, "Outbound edge adopted remote id");
            }
            edge.deliver(payload);
            return;
        }

        if edge.remote_id() != remote_id {
            debug!(
                local_id,
                expected = edge.remote_id(),
                got = remote_id,
                "Remote id mismatch, dropping"
            );
            self.send_raw_control(from, local_id, remote_id, CONTROL_EDGE_CLOSED);
            return;
        }

        if edge.end() != from {
            // The peer's apparent endpoint moved: a NAT remapped it.
            let new_ta = TransportAddress::from_socket_addr(from);
            if self.authorizer.authorize(&new_ta) {
                info!(
                    local_id,
                    old = %edge.end(),
                    new = %from,
                    "Remote NAT mapping changed"
                );
                edge.set_end(from);
                self.registry
                    .nat
                    .record(NatPoint::remote_mapping_change(local_id, new_ta));
                self.registry.nat.refresh();
                self.send_announce(&edge);
            } else {
                debug!(local_id, from = %from, "Remapped endpoint not authorized, closing");
                self.send_raw_control(from, local_id, remote_id, CONTROL_EDGE_CLOSED);
                edge.close_internal(false);
                return;
            }
        }

        edge.deliver(payload);
    }

    /// A control packet: the edge id arrives complemented.
    fn handle_control(&self, edge_id: i32, payload: &[u8], from: SocketAddr) {
        let Some(edge) = self.registry.get_local(edge_id) else {
            trace!(edge_id, from = %from, "Control for unknown edge, ignoring");
            return;
        };
        if payload.len() < 4 {
            debug!(edge_id, "Runt control packet, dropping");
            return;
        }
        let code = i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let body = &payload[4..];

        match code {
            CONTROL_EDGE_CLOSED => {
                debug!(edge_id, "Peer closed edge");
                edge.close_internal(false);
            }
            CONTROL_EDGE_DATA_ANNOUNCE => match serde_json::from_slice::<AnnounceBody>(body) {
                Ok(announce) => self.apply_announce(&edge, &announce),
                Err(e) => {
                    debug!(edge_id, error = %e, "Undecodable announce body, closing edge");
                    edge.close_internal(true);
                }
            },
            CONTROL_NULL => {}
            other => trace!(edge_id, code = other, "Unknown control code, ignoring"),
        }
    }

    /// The peer told us what it sees: its `RemoteTA` is our endpoint.
    fn apply_announce(&self, edge: &Arc<UdpEdge>, announce: &AnnounceBody) {
        let view: TransportAddress = match announce.remote_ta.parse() {
            Ok(view) => view,
            Err(e) => {
                debug!(
                    local_id = edge.local_id(),
                    error = %e,
                    "Unparseable TA in announce, closing edge"
                );
                edge.close_internal(true);
                return;
            }
        };
        if edge.peer_view() == Some(view.clone()) {
            return;
        }
        info!(local_id = edge.local_id(), view = %view, "Peer reports new view of our endpoint");
        edge.set_peer_view(view.clone());
        self.registry
            .nat
            .record(NatPoint::local_mapping_change(edge.local_id(), view));
        self.registry.nat.refresh();
    }
}

/// Sole reader of the socket. Exits only on the shutdown notification;
/// receive errors are transient and logged.
async fn reader_loop(socket: Arc<UdpSocket>, shared: Arc<Shared>, shutdown: Arc<Notify>) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    debug!("UDP reader task starting");
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, from)) => shared.handle_datagram(&buf[..len], from),
                Err(e) => warn!(error = %e, "UDP receive error"),
            },
            _ = shutdown.notified() => break,
        }
    }
    debug!("UDP reader task stopped");
}

/// Sole writer of the socket. Drains the bounded queue until the
/// shutdown sentinel arrives.
async fn writer_loop(socket: Arc<UdpSocket>, mut rx: mpsc::Receiver<Outbound>) {
    debug!("UDP writer task starting");
    while let Some(out) = rx.recv().await {
        let msg = match out {
            Outbound::Shutdown => break,
            Outbound::Datagram(msg) => msg,
        };
        let wire = encode_datagram(msg.local_id, msg.remote_field, &msg.payload);
        if let Err(e) = socket.send_to(&wire, msg.dest).await {
            warn!(error = %e, dest = %msg.dest, "UDP send error");
        }
    }
    debug!("UDP writer task stopped");
}

// ============================================================================
// Tests
// ============================================================================
