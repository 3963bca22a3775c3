//! Ringmesh Node Entity
//!
//! Top-level structure tying the overlay together: the local ring
//! address, the connection table, the router, the UDP edge listener, and
//! the listeners that react to table churn (network-size tracking and
//! the status exchange). Connection policy — deciding *which* peers to
//! connect — lives above this layer; the node exposes the capabilities
//! policy code consumes.

use crate::address::Address;
use crate::config::{Config, ConfigError};
use crate::connection::{Connection, ConnectionClass, ConnectionTable, TableListener};
use crate::estimator::estimate_network_size;
use crate::router::{HopDecision, PacketHeader, Router};
use crate::shortcut;
use crate::status::{StatusExchange, StatusRpc};
use crate::transport::edge::Edge;
use crate::transport::udp::{ListenerError, UdpEdge, UdpEdgeListener};
use crate::transport::{AllowAll, TaAuthorizer, TransportAddress};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Errors related to node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node already started")]
    AlreadyStarted,

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("listener error: {0}")]
    Listener(#[from] ListenerError),
}

/// Node operational state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Created but not started.
    Created,
    /// Starting up (binding the listener).
    Starting,
    /// Fully operational.
    Running,
    /// Shutting down.
    Stopping,
    /// Stopped. A node does not restart.
    Stopped,
}

impl NodeState {
    /// Check if the node is operational.
    pub fn is_operational(&self) -> bool {
        matches!(self, NodeState::Running)
    }

    /// Check if the node can be started.
    pub fn can_start(&self) -> bool {
        matches!(self, NodeState::Created)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Created => "created",
            NodeState::Starting => "starting",
            NodeState::Running => "running",
            NodeState::Stopping => "stopping",
            NodeState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Table listener keeping the cached network-size estimate fresh.
struct SizeTracker {
    local: Address,
    estimate: Arc<AtomicU64>,
}

impl SizeTracker {
    fn refresh(&self, table: &ConnectionTable, conn: &Connection) {
        if !conn.class.is_structured() {
            return;
        }
        let near = table.get_connections(ConnectionClass::Near);
        let estimate = estimate_network_size(&self.local, &near);
        self.estimate.store(estimate, Ordering::Release);
        debug!(estimate, near = near.len(), "Network size estimate updated");
    }
}

impl TableListener for SizeTracker {
    fn on_connection(&self, table: &ConnectionTable, conn: &Connection) {
        self.refresh(table, conn);
    }

    fn on_disconnection(&self, table: &ConnectionTable, conn: &Connection) {
        self.refresh(table, conn);
    }
}

/// A running ringmesh node instance.
pub struct Node {
    /// This node's ring address.
    local: Address,
    /// Loaded configuration.
    config: Config,
    /// Node operational state.
    state: NodeState,
    /// Overlay neighbors.
    table: Arc<ConnectionTable>,
    /// Next-hop decisions.
    router: Router,
    /// The UDP edge transport.
    listener: Arc<UdpEdgeListener>,
    /// Cached density-based size estimate.
    net_size: Arc<AtomicU64>,
}

impl Node {
    /// Create a node from configuration with the default allow-all
    /// endpoint authorizer.
    pub fn new(config: Config) -> Result<Self, NodeError> {
        Self::with_authorizer(config, Arc::new(AllowAll))
    }

    /// Create a node from configuration and an endpoint authorizer.
    pub fn with_authorizer(
        config: Config,
        authorizer: Arc<dyn TaAuthorizer>,
    ) -> Result<Self, NodeError> {
        let local = config.create_address()?;

        let table = Arc::new(ConnectionTable::new());
        let net_size = Arc::new(AtomicU64::new(1));
        table.add_listener(Arc::new(SizeTracker {
            local,
            estimate: net_size.clone(),
        }));

        let router = Router::with_limits(
            local,
            config.routing.max_ttl(),
            config.routing.max_uphill_hops(),
        );
        let listener = Arc::new(UdpEdgeListener::new(
            config.transports.udp.clone(),
            authorizer,
        ));

        Ok(Self {
            local,
            config,
            state: NodeState::Created,
            table,
            router,
            listener,
            net_size,
        })
    }

    /// Wire the status exchange to an RPC capability.
    ///
    /// From this point every structured table mutation pushes neighbor
    /// lists to the affected address's ring neighbors.
    pub fn set_status_rpc(&self, rpc: Arc<dyn StatusRpc>) {
        let exchange =
            StatusExchange::with_max_neighbors(rpc, self.config.status.max_neighbors());
        self.table.add_listener(Arc::new(exchange));
    }

    // === Accessors ===

    /// This node's ring address.
    pub fn address(&self) -> &Address {
        &self.local
    }

    /// Get the node state.
    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Check if the node is operational.
    pub fn is_running(&self) -> bool {
        self.state.is_operational()
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The connection table.
    pub fn table(&self) -> &Arc<ConnectionTable> {
        &self.table
    }

    /// The UDP edge listener.
    pub fn listener(&self) -> &Arc<UdpEdgeListener> {
        &self.listener
    }

    /// Current density-based network-size estimate.
    pub fn network_size(&self) -> u64 {
        self.net_size.load(Ordering::Acquire).max(1)
    }

    /// Addresses we advertise to peers, best first.
    pub fn local_tas(&self) -> Arc<[TransportAddress]> {
        self.listener.local_tas()
    }

    // === Lifecycle ===

    /// Start the node: bind and start the edge listener.
    pub async fn start(&mut self) -> Result<(), NodeError> {
        if !self.state.can_start() {
            return Err(NodeError::AlreadyStarted);
        }
        self.state = NodeState::Starting;

        if let Err(e) = self.listener.start().await {
            self.state = NodeState::Stopped;
            return Err(e.into());
        }

        self.state = NodeState::Running;
        info!(
            address = %self.local,
            local_addr = ?self.listener.local_addr(),
            "Node running"
        );
        Ok(())
    }

    /// Stop the node: stop the listener (closing all edges) and drop all
    /// connections. Idempotent.
    pub async fn stop(&mut self) {
        if self.state == NodeState::Stopped {
            return;
        }
        self.state = NodeState::Stopping;

        self.listener.stop().await;
        while let Some(address) = self.table.get_by_index(0) {
            self.table.remove(&address);
        }

        self.state = NodeState::Stopped;
        info!(address = %self.local, "Node stopped");
    }

    // === Connections ===

    /// Record a connection to a neighbor.
    ///
    /// Returns false for a self-connection or a duplicate of an existing
    /// `(address, class)` pair. A successful add re-triggers size
    /// estimation and, when wired, the status exchange.
    pub fn register_connection(
        &self,
        address: Address,
        ta: TransportAddress,
        class: ConnectionClass,
        edge: Arc<dyn Edge>,
    ) -> bool {
        if address == self.local {
            debug!("Refusing self-connection");
            return false;
        }
        self.table.add(Connection::new(address, ta, class, edge))
    }

    /// Drop all connections to an address.
    pub fn drop_connection(&self, address: &Address) -> bool {
        self.table.remove(address)
    }

    /// Create an outbound edge for a connection being established.
    pub fn create_edge_to(&self, ta: &TransportAddress) -> Result<Arc<UdpEdge>, NodeError> {
        Ok(self.listener.create_edge_to(ta)?)
    }

    // === Routing ===

    /// Decide the next hop for a packet.
    pub fn next_hop(&self, from: Option<&Address>, packet: &PacketHeader) -> HopDecision {
        self.router.next_hop(from, packet, &self.table)
    }

    /// Sample a long-range target for a new shortcut connection.
    pub fn sample_shortcut_target(&self) -> Address {
        let mut rng = rand::rng();
        shortcut::sample_target(&mut rng, &self.local, self.network_size())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.local)
            .field("state", &self.state)
            .field("connections", &self.table.size())
            .field("edges", &self.listener.edge_count())
            .field("network_size", &self.network_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::u160;
    use crate::connection::testutil::StubEdge;
    use crate::status::StatusMessage;
    use crate::router::RoutingMode;
    use std::sync::Mutex;

    fn test_config() -> Config {
        let mut config = Config::new();
        config.transports.udp.bind_host = Some("127.0.0.1".into());
        config.transports.udp.port = Some(0);
        config
    }

    fn near(node: &Node, low: u64) -> bool {
        node.register_connection(
            Address::from_u64(low),
            TransportAddress::udp("127.0.0.1", (low & 0xFFFF) as u16),
            ConnectionClass::Near,
            StubEdge::new(),
        )
    }

    #[test]
    fn test_new_node_state() {
        let node = Node::new(test_config()).unwrap();
        assert_eq!(node.state(), NodeState::Created);
        assert!(!node.is_running());
        assert_eq!(node.network_size(), 1);
        assert_eq!(node.table().size(), 0);
    }

    #[test]
    fn test_configured_address_is_used() {
        let mut config = test_config();
        let addr = Address::from_u64(0xBEE0);
        config.node.address = Some(addr.to_hex());
        let node = Node::new(config).unwrap();
        assert_eq!(*node.address(), addr);
    }

    #[test]
    fn test_register_connection_rules() {
        let mut config = test_config();
        config.node.address = Some(Address::from_u64(0x100).to_hex());
        let node = Node::new(config).unwrap();

        assert!(near(&node, 0x10));
        assert!(!near(&node, 0x10)); // duplicate (address, class)
        assert!(!near(&node, 0x100)); // self
        assert_eq!(node.table().size(), 1);

        assert!(node.drop_connection(&Address::from_u64(0x10)));
        assert!(!node.drop_connection(&Address::from_u64(0x10)));
    }

    #[test]
    fn test_size_estimate_tracks_near_churn() {
        let mut config = test_config();
        config.node.address = Some(Address::from_u64(0x100).to_hex());
        let node = Node::new(config).unwrap();
        assert_eq!(node.network_size(), 1);

        near(&node, 0x10);
        assert_eq!(node.network_size(), 2); // one neighbor: count + 1

        // A symmetric pair still reads count + 1.
        near(&node, 0x1F0);
        assert_eq!(node.network_size(), 3);

        node.drop_connection(&Address::from_u64(0x1F0));
        assert_eq!(node.network_size(), 2);
    }

    #[test]
    fn test_next_hop_delegates_to_router() {
        let mut config = test_config();
        config.node.address = Some(Address::from_u64(0x10).to_hex());
        let node = Node::new(config).unwrap();
        near(&node, 0x50);
        near(&node, 0xA0);

        let packet = PacketHeader {
            src: *node.address(),
            dst: Address::from_u64(0xA0),
            mode: RoutingMode::Exact,
            hops: 0,
        };
        let decision = node.next_hop(None, &packet);
        assert_eq!(decision.next, Some(Address::from_u64(0xA0)));
    }

    #[test]
    fn test_shortcut_target_scales_with_estimate() {
        let mut config = test_config();
        config.node.address = Some(Address::from_u64(0).to_hex());
        let node = Node::new(config).unwrap();

        // With no connections the estimate is 1 (clamped to 2 in the
        // sampler): targets stay at whole-ring distance scales. The
        // bound leaves headroom for folds just past the antipode.
        for _ in 0..32 {
            let target = node.sample_shortcut_target();
            let d = *node.address().distance_to(&target).abs_bytes();
            assert!(d >= u160::from_u64_shifted(1, 140));
        }
    }

    struct RecordingRpc {
        pushes: Mutex<Vec<(Address, StatusMessage)>>,
    }

    impl StatusRpc for RecordingRpc {
        fn push_status(&self, target: &Connection, message: StatusMessage) {
            self.pushes.lock().unwrap().push((target.address, message));
        }
    }

    #[test]
    fn test_status_exchange_wired_through_node() {
        let mut config = test_config();
        config.node.address = Some(Address::from_u64(0x100).to_hex());
        let node = Node::new(config).unwrap();
        let rpc = Arc::new(RecordingRpc {
            pushes: Mutex::new(Vec::new()),
        });
        node.set_status_rpc(rpc.clone());

        near(&node, 0x10);
        near(&node, 0x50);
        let pushes = rpc.pushes.lock().unwrap();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].0, Address::from_u64(0x10));
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let mut node = Node::new(test_config()).unwrap();
        node.start().await.unwrap();
        assert!(node.is_running());
        assert!(node.listener().local_addr().is_some());
        assert_eq!(node.local_tas().len(), 1);

        assert!(matches!(node.start().await, Err(NodeError::AlreadyStarted)));

        node.stop().await;
        assert_eq!(node.state(), NodeState::Stopped);
        node.stop().await;
        assert_eq!(node.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_drops_connections_and_edges() {
        let mut a = Node::new(test_config()).unwrap();
        let mut b = Node::new(test_config()).unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();

        let b_ta = TransportAddress::from_socket_addr(b.listener().local_addr().unwrap());
        let edge = a.create_edge_to(&b_ta).unwrap();
        a.register_connection(
            Address::from_u64(0x50),
            b_ta,
            ConnectionClass::Near,
            edge.clone(),
        );
        assert_eq!(a.table().size(), 1);

        a.stop().await;
        assert!(edge.is_closed());
        assert_eq!(a.table().size(), 0);
        b.stop().await;
    }
}
