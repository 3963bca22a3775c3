//! Overlay Connections
//!
//! A connection relates a neighbor's ring address, its transport address,
//! a connection class, and the edge carrying traffic to it. The
//! [`ConnectionTable`] keeps the per-class and global ring-sorted views
//! every other overlay component queries.

pub mod table;

pub use table::ConnectionTable;

use crate::address::Address;
use crate::transport::edge::Edge;
use crate::transport::TransportAddress;
use std::fmt;
use std::sync::Arc;

/// Class of an overlay connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionClass {
    /// Ring-adjacent (structured) neighbor.
    Near,
    /// Long-range small-world link.
    Shortcut,
    /// Leaf node attached to us without ring responsibilities.
    Leaf,
}

impl ConnectionClass {
    /// Human-readable class name.
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionClass::Near => "near",
            ConnectionClass::Shortcut => "shortcut",
            ConnectionClass::Leaf => "leaf",
        }
    }

    /// Near connections are the structured ones the ring is built from.
    pub fn is_structured(&self) -> bool {
        matches!(self, ConnectionClass::Near)
    }

    /// All classes, in lookup-priority order.
    pub const ALL: [ConnectionClass; 3] = [
        ConnectionClass::Near,
        ConnectionClass::Shortcut,
        ConnectionClass::Leaf,
    ];
}

impl fmt::Display for ConnectionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One overlay connection: a neighbor and the edge reaching it.
///
/// At most one connection exists per `(address, class)` pair.
#[derive(Clone)]
pub struct Connection {
    /// The neighbor's ring address.
    pub address: Address,
    /// The neighbor's transport address.
    pub ta: TransportAddress,
    /// Connection class.
    pub class: ConnectionClass,
    /// The edge carrying this connection's traffic.
    pub edge: Arc<dyn Edge>,
}

impl Connection {
    /// Create a connection.
    pub fn new(
        address: Address,
        ta: TransportAddress,
        class: ConnectionClass,
        edge: Arc<dyn Edge>,
    ) -> Self {
        Self {
            address,
            ta,
            class,
            edge,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("ta", &self.ta)
            .field("class", &self.class)
            .field("edge_local_id", &self.edge.local_id())
            .finish()
    }
}

/// Receiver of connection-table mutations.
///
/// Callbacks fire after the mutation is visible to new readers and
/// outside the table's internal lock, so listeners may query the table
/// freely.
pub trait TableListener: Send + Sync {
    /// A connection was added.
    fn on_connection(&self, table: &ConnectionTable, conn: &Connection);

    /// A connection was removed.
    fn on_disconnection(&self, table: &ConnectionTable, conn: &Connection);
}
