//! Neighbor Status Exchange
//!
//! When the structured ring changes around an address, its left and
//! right structured neighbors are told who now sits near that address.
//! Pushes ride an injected [`StatusRpc`] capability and are strictly
//! best-effort: a failed push is the remote's problem to discover.

use crate::address::Address;
use crate::connection::{Connection, ConnectionTable, TableListener};
use crate::transport::TransportAddress;
use std::sync::Arc;
use tracing::trace;

/// Default number of connections reported in a status push.
pub const MAX_NEIGHBORS: usize = 4;

/// RPC method name a status push is addressed to.
pub const STATUS_RPC_METHOD: &str = "sys:link.GetStatus";

/// One entry of a status message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NeighborInfo {
    /// The neighbor's ring address.
    pub address: Address,
    /// The neighbor's transport address.
    pub ta: TransportAddress,
}

/// The neighbor list pushed to a structured neighbor.
#[derive(Clone, Debug, Default)]
pub struct StatusMessage {
    /// Connections nearest the affected address, nearest first.
    pub neighbors: Vec<NeighborInfo>,
}

/// Capability for delivering status pushes.
///
/// Implementations address the remote's `sys:link.GetStatus` method and
/// swallow failures; there is no reply channel.
pub trait StatusRpc: Send + Sync {
    /// Push a status message to one connected neighbor.
    fn push_status(&self, target: &Connection, message: StatusMessage);
}

/// Table listener driving the status exchange.
pub struct StatusExchange {
    rpc: Arc<dyn StatusRpc>,
    max_neighbors: usize,
}

impl StatusExchange {
    /// Create a status exchange with the default neighbor-list size.
    pub fn new(rpc: Arc<dyn StatusRpc>) -> Self {
        Self::with_max_neighbors(rpc, MAX_NEIGHBORS)
    }

    /// Create a status exchange with an explicit neighbor-list size.
    pub fn with_max_neighbors(rpc: Arc<dyn StatusRpc>, max_neighbors: usize) -> Self {
        Self { rpc, max_neighbors }
    }

    /// Push the neighborhood of `conn.address` to its structured
    /// neighbors.
    fn push_to_neighbors(&self, table: &ConnectionTable, conn: &Connection) {
        if !conn.class.is_structured() {
            return;
        }

        let mut targets: Vec<Address> = Vec::new();
        for neighbor in [
            table.left_structured_neighbor_of(&conn.address),
            table.right_structured_neighbor_of(&conn.address),
        ]
        .into_iter()
        .flatten()
        {
            if !targets.contains(&neighbor) {
                targets.push(neighbor);
            }
        }
        if targets.is_empty() {
            return;
        }

        let message = StatusMessage {
            neighbors: table
                .get_nearest_to(&conn.address, self.max_neighbors)
                .into_iter()
                .map(|c| NeighborInfo {
                    address: c.address,
                    ta: c.ta,
                })
                .collect(),
        };

        for address in targets {
            let Some(target) = table.get_connection(&address) else {
                continue;
            };
            trace!(
                affected = %conn.address,
                target = %address,
                entries = message.neighbors.len(),
                "Pushing status"
            );
            self.rpc.push_status(&target, message.clone());
        }
    }
}

impl TableListener for StatusExchange {
    fn on_connection(&self, table: &ConnectionTable, conn: &Connection) {
        self.push_to_neighbors(table, conn);
    }

    fn on_disconnection(&self, table: &ConnectionTable, conn: &Connection) {
        self.push_to_neighbors(table, conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testutil::connection;
    use crate::connection::ConnectionClass;
    use std::sync::Mutex;

    struct RecordingRpc {
        pushes: Mutex<Vec<(Address, StatusMessage)>>,
    }

    impl RecordingRpc {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                pushes: Mutex::new(Vec::new()),
            })
        }

        fn pushes(&self) -> Vec<(Address, StatusMessage)> {
            self.pushes.lock().unwrap().clone()
        }
    }

    impl StatusRpc for RecordingRpc {
        fn push_status(&self, target: &Connection, message: StatusMessage) {
            self.pushes.lock().unwrap().push((target.address, message));
        }
    }

    fn wired_table() -> (ConnectionTable, Arc<RecordingRpc>) {
        let table = ConnectionTable::new();
        let rpc = RecordingRpc::new();
        table.add_listener(Arc::new(StatusExchange::new(rpc.clone())));
        (table, rpc)
    }

    #[test]
    fn test_first_connection_has_no_targets() {
        let (table, rpc) = wired_table();
        table.add(connection(0x10, ConnectionClass::Near));
        assert!(rpc.pushes().is_empty());
    }

    #[test]
    fn test_second_connection_pushes_once() {
        let (table, rpc) = wired_table();
        table.add(connection(0x10, ConnectionClass::Near));
        table.add(connection(0x50, ConnectionClass::Near));

        // Left and right neighbor of 0x50 are both 0x10; deduplicated.
        let pushes = rpc.pushes();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].0, Address::from_u64(0x10));
        // The message lists the affected address first (distance zero).
        assert_eq!(pushes[0].1.neighbors[0].address, Address::from_u64(0x50));
    }

    #[test]
    fn test_third_connection_pushes_to_both_sides() {
        let (table, rpc) = wired_table();
        table.add(connection(0x10, ConnectionClass::Near));
        table.add(connection(0x50, ConnectionClass::Near));
        table.add(connection(0xA0, ConnectionClass::Near));

        let pushes = rpc.pushes();
        assert_eq!(pushes.len(), 3);
        let targets: Vec<Address> = pushes[1..].iter().map(|(a, _)| *a).collect();
        assert!(targets.contains(&Address::from_u64(0x10)));
        assert!(targets.contains(&Address::from_u64(0x50)));
    }

    #[test]
    fn test_disconnection_notifies_survivors() {
        let (table, rpc) = wired_table();
        table.add(connection(0x10, ConnectionClass::Near));
        table.add(connection(0x50, ConnectionClass::Near));
        table.add(connection(0xA0, ConnectionClass::Near));
        let before = rpc.pushes().len();

        table.remove(&Address::from_u64(0x50));
        let pushes = rpc.pushes();
        assert_eq!(pushes.len(), before + 2);
        // The survivors hear about the neighborhood of the departed.
        let targets: Vec<Address> = pushes[before..].iter().map(|(a, _)| *a).collect();
        assert!(targets.contains(&Address::from_u64(0x10)));
        assert!(targets.contains(&Address::from_u64(0xA0)));
    }

    #[test]
    fn test_shortcut_events_ignored() {
        let (table, rpc) = wired_table();
        table.add(connection(0x10, ConnectionClass::Near));
        table.add(connection(0x50, ConnectionClass::Near));
        let before = rpc.pushes().len();

        table.add(connection(0x70, ConnectionClass::Shortcut));
        table.remove(&Address::from_u64(0x70));
        assert_eq!(rpc.pushes().len(), before);
    }

    #[test]
    fn test_message_respects_max_neighbors() {
        let table = ConnectionTable::new();
        let rpc = RecordingRpc::new();
        table.add_listener(Arc::new(StatusExchange::with_max_neighbors(rpc.clone(), 2)));

        for low in [0x10u64, 0x20, 0x30, 0x40, 0x50] {
            table.add(connection(low, ConnectionClass::Near));
        }
        for (_, message) in rpc.pushes() {
            assert!(message.neighbors.len() <= 2);
        }
    }
}
