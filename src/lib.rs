//! Ringmesh: a structured ring overlay network
//!
//! Nodes carry pseudo-random 160-bit addresses on a circular space and
//! cooperate to form a routable ring augmented with long-range
//! small-world shortcuts. The crate provides the overlay core: the
//! connection table, the next-hop router (greedy, exact, annealing), the
//! 1/d shortcut sampler, and a UDP edge transport multiplexing many
//! logical edges over one socket while surviving NAT remaps.

pub mod address;
pub mod config;
pub mod connection;
pub mod estimator;
pub mod node;
pub mod router;
pub mod shortcut;
pub mod status;
pub mod transport;

// Re-export address types
pub use address::{Address, AddressError, Distance, ADDRESS_BITS, ADDRESS_BYTES};

// Re-export config types
pub use config::{
    Config, ConfigError, NodeConfig, RoutingConfig, StatusConfig, TransportsConfig, UdpConfig,
};

// Re-export connection types
pub use connection::{Connection, ConnectionClass, ConnectionTable, TableListener};

// Re-export transport types
pub use transport::edge::{Edge, EdgeError, EdgeEventSink, EdgeSink};
pub use transport::nat::{NatHistory, NatPoint, NatPointKind};
pub use transport::udp::{AnnounceBody, ListenerError, UdpEdge, UdpEdgeListener};
pub use transport::{AllowAll, TaAuthorizer, TaError, TaType, TransportAddress};

// Re-export routing types
pub use router::{HopDecision, PacketHeader, Router, RoutingMode, MAX_TTL, MAX_UPHILL_HOPS};

// Re-export overlay services
pub use estimator::estimate_network_size;
pub use shortcut::sample_target;
pub use status::{NeighborInfo, StatusExchange, StatusMessage, StatusRpc, MAX_NEIGHBORS};

// Re-export node types
pub use node::{Node, NodeError, NodeState};
