//! Connection Table
//!
//! The sorted set of overlay neighbors. Each connection class keeps its
//! own ring-sorted list, and a global sorted address list spans all
//! classes. Mutations are serialized by the table's internal lock;
//! readers take cheap snapshots. Listener callbacks fire after the
//! mutation is visible.
//!
//! Indexing follows two conventions the routing code leans on:
//! - [`ConnectionTable::get_by_index`] wraps modulo the table size, with
//!   negative indices counting from the end.
//! - [`ConnectionTable::index_of`] returns the bitwise complement of the
//!   insertion point when the address is absent.

use super::{Connection, ConnectionClass, TableListener};
use crate::address::Address;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

#[derive(Default)]
struct Inner {
    /// Per-class connection lists, each sorted by ring address.
    by_class: HashMap<ConnectionClass, Vec<Connection>>,
    /// All connected addresses across classes, sorted, no duplicates.
    all: Vec<Address>,
}

/// Sorted set of overlay neighbors with per-class and global views.
pub struct ConnectionTable {
    inner: RwLock<Inner>,
    listeners: Mutex<Vec<Arc<dyn TableListener>>>,
}

impl ConnectionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Register a mutation listener.
    pub fn add_listener(&self, listener: Arc<dyn TableListener>) {
        self.listeners
            .lock()
            .expect("table listener lock poisoned")
            .push(listener);
    }

    /// Insert a connection, preserving sorted order.
    ///
    /// Returns false when the address already holds a connection of the
    /// same class.
    pub fn add(&self, conn: Connection) -> bool {
        {
            let mut guard = self.inner.write().expect("connection table lock poisoned");
            let inner = &mut *guard;
            let list = inner.by_class.entry(conn.class).or_default();
            match list.binary_search_by(|c| c.address.cmp(&conn.address)) {
                Ok(_) => return false,
                Err(pos) => list.insert(pos, conn.clone()),
            }
            if let Err(pos) = inner.all.binary_search(&conn.address) {
                inner.all.insert(pos, conn.address);
            }
        }

        debug!(address = %conn.address, class = %conn.class, "Connection added");
        for listener in self.listeners_snapshot() {
            listener.on_connection(self, &conn);
        }
        true
    }

    /// Remove an address from every index atomically.
    ///
    /// Returns false when the address held no connection.
    pub fn remove(&self, address: &Address) -> bool {
        let mut removed = Vec::new();
        {
            let mut guard = self.inner.write().expect("connection table lock poisoned");
            let inner = &mut *guard;
            for list in inner.by_class.values_mut() {
                if let Ok(pos) = list.binary_search_by(|c| c.address.cmp(address)) {
                    removed.push(list.remove(pos));
                }
            }
            if let Ok(pos) = inner.all.binary_search(address) {
                inner.all.remove(pos);
            }
        }

        if removed.is_empty() {
            return false;
        }
        debug!(address = %address, "Connection removed");
        for conn in &removed {
            for listener in self.listeners_snapshot() {
                listener.on_disconnection(self, conn);
            }
        }
        true
    }

    /// Number of connected addresses across all classes.
    pub fn size(&self) -> usize {
        self.inner
            .read()
            .expect("connection table lock poisoned")
            .all
            .len()
    }

    /// Number of connections in one class.
    pub fn count(&self, class: ConnectionClass) -> usize {
        self.inner
            .read()
            .expect("connection table lock poisoned")
            .by_class
            .get(&class)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// True when the address holds any connection.
    pub fn contains(&self, address: &Address) -> bool {
        self.index_of(address) >= 0
    }

    /// Index into the global sorted list with modular wrap.
    ///
    /// Negative indices count from the end. Returns None only when the
    /// table is empty.
    pub fn get_by_index(&self, index: isize) -> Option<Address> {
        let inner = self.inner.read().expect("connection table lock poisoned");
        if inner.all.is_empty() {
            return None;
        }
        let len = inner.all.len() as isize;
        Some(inner.all[index.rem_euclid(len) as usize])
    }

    /// Position of an address in the global sorted list.
    ///
    /// Returns the nonnegative position when present, and the bitwise
    /// complement of the insertion point when absent.
    pub fn index_of(&self, address: &Address) -> isize {
        let inner = self.inner.read().expect("connection table lock poisoned");
        match inner.all.binary_search(address) {
            Ok(pos) => pos as isize,
            Err(ins) => !(ins as isize),
        }
    }

    /// Look up the connection for an address, preferring Near, then
    /// Shortcut, then Leaf.
    pub fn get_connection(&self, address: &Address) -> Option<Connection> {
        let inner = self.inner.read().expect("connection table lock poisoned");
        for class in ConnectionClass::ALL {
            if let Some(list) = inner.by_class.get(&class) {
                if let Ok(pos) = list.binary_search_by(|c| c.address.cmp(address)) {
                    return Some(list[pos].clone());
                }
            }
        }
        None
    }

    /// Snapshot of one class's connections, in ring order.
    pub fn get_connections(&self, class: ConnectionClass) -> Vec<Connection> {
        self.inner
            .read()
            .expect("connection table lock poisoned")
            .by_class
            .get(&class)
            .cloned()
            .unwrap_or_default()
    }

    /// The structured neighbor following `address` on the ring.
    ///
    /// `address` itself is excluded when present in the table.
    pub fn left_structured_neighbor_of(&self, address: &Address) -> Option<Address> {
        self.structured_neighbor(address, true)
    }

    /// The structured neighbor preceding `address` on the ring.
    ///
    /// `address` itself is excluded when present in the table.
    pub fn right_structured_neighbor_of(&self, address: &Address) -> Option<Address> {
        self.structured_neighbor(address, false)
    }

    fn structured_neighbor(&self, address: &Address, left: bool) -> Option<Address> {
        let inner = self.inner.read().expect("connection table lock poisoned");
        let near = inner.by_class.get(&ConnectionClass::Near)?;
        let addrs: Vec<Address> = near
            .iter()
            .map(|c| c.address)
            .filter(|a| a != address)
            .collect();
        if addrs.is_empty() {
            return None;
        }
        let ins = match addrs.binary_search(address) {
            Ok(pos) => pos,
            Err(ins) => ins,
        };
        let len = addrs.len() as isize;
        let idx = if left {
            (ins as isize).rem_euclid(len)
        } else {
            (ins as isize - 1).rem_euclid(len)
        };
        Some(addrs[idx as usize])
    }

    /// The `k` connections nearest to an address by absolute ring
    /// distance, in increasing distance, one per connected address.
    pub fn get_nearest_to(&self, address: &Address, k: usize) -> Vec<Connection> {
        let inner = self.inner.read().expect("connection table lock poisoned");
        let mut seen = Vec::new();
        let mut conns: Vec<Connection> = Vec::new();
        for class in ConnectionClass::ALL {
            if let Some(list) = inner.by_class.get(&class) {
                for conn in list {
                    if !seen.contains(&conn.address) {
                        seen.push(conn.address);
                        conns.push(conn.clone());
                    }
                }
            }
        }
        conns.sort_by(|a, b| {
            address
                .distance_to(&a.address)
                .cmp_abs(&address.distance_to(&b.address))
        });
        conns.truncate(k);
        conns
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn TableListener>> {
        self.listeners
            .lock()
            .expect("table listener lock poisoned")
            .clone()
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}
