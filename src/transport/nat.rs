//! NAT Event History
//!
//! An append-only record of edge lifecycle events (new edge, close, local
//! or remote mapping change) kept for the life of a listener. Its only
//! consumer is the ranked list of local transport addresses we advertise
//! to peers: endpoints that peers have recently reported seeing us at
//! rank ahead of whatever we detected or were configured with.
//!
//! The ranked list is swapped as a whole `Arc` snapshot, so readers never
//! observe a half-updated view.

use super::{unix_ms, TransportAddress};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

/// What happened to an edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NatPointKind {
    /// An edge came into existence.
    NewEdge,
    /// An edge was closed.
    EdgeClose,
    /// A peer reported a new view of our local endpoint.
    LocalMappingChange,
    /// A peer's apparent endpoint changed mid-session.
    RemoteMappingChange,
}

impl fmt::Display for NatPointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NatPointKind::NewEdge => "new-edge",
            NatPointKind::EdgeClose => "edge-close",
            NatPointKind::LocalMappingChange => "local-mapping-change",
            NatPointKind::RemoteMappingChange => "remote-mapping-change",
        };
        write!(f, "{}", s)
    }
}

/// One timestamped entry in the NAT history.
#[derive(Clone, Debug)]
pub struct NatPoint {
    /// Event kind.
    pub kind: NatPointKind,
    /// Unix-millisecond timestamp.
    pub at_ms: u64,
    /// Local id of the edge the event belongs to.
    pub local_id: i32,
    /// The remote endpoint involved, when the event carries one.
    pub remote_ta: Option<TransportAddress>,
    /// The peer's view of our endpoint, when the event carries one.
    pub peer_view: Option<TransportAddress>,
}

impl NatPoint {
    /// Record an edge creation.
    pub fn new_edge(local_id: i32, remote_ta: TransportAddress) -> Self {
        Self {
            kind: NatPointKind::NewEdge,
            at_ms: unix_ms(),
            local_id,
            remote_ta: Some(remote_ta),
            peer_view: None,
        }
    }

    /// Record an edge close.
    pub fn edge_close(local_id: i32, remote_ta: TransportAddress) -> Self {
        Self {
            kind: NatPointKind::EdgeClose,
            at_ms: unix_ms(),
            local_id,
            remote_ta: Some(remote_ta),
            peer_view: None,
        }
    }

    /// Record a peer reporting a new view of our endpoint.
    pub fn local_mapping_change(local_id: i32, peer_view: TransportAddress) -> Self {
        Self {
            kind: NatPointKind::LocalMappingChange,
            at_ms: unix_ms(),
            local_id,
            remote_ta: None,
            peer_view: Some(peer_view),
        }
    }

    /// Record a remote endpoint changing mid-session.
    pub fn remote_mapping_change(local_id: i32, remote_ta: TransportAddress) -> Self {
        Self {
            kind: NatPointKind::RemoteMappingChange,
            at_ms: unix_ms(),
            local_id,
            remote_ta: Some(remote_ta),
            peer_view: None,
        }
    }
}

/// Append-only edge event history plus the derived ranked TA list.
pub struct NatHistory {
    points: Mutex<Vec<NatPoint>>,
    /// Addresses we detected or were configured with, lowest rank.
    base_tas: RwLock<Vec<TransportAddress>>,
    /// Derived advertised list, highest rank first. Whole-reference swap.
    ranked: RwLock<Arc<[TransportAddress]>>,
}

impl NatHistory {
    /// Create an empty history.
    pub fn new() -> Self {
        Self {
            points: Mutex::new(Vec::new()),
            base_tas: RwLock::new(Vec::new()),
            ranked: RwLock::new(Arc::from(Vec::new())),
        }
    }

    /// Replace the configured/detected base addresses and re-rank.
    pub fn set_base_tas(&self, tas: Vec<TransportAddress>) {
        *self.base_tas.write().expect("base TA lock poisoned") = tas;
        self.refresh();
    }

    /// Append an event. Does not re-rank; callers refresh explicitly
    /// after the mutation that motivated the event.
    pub fn record(&self, point: NatPoint) {
        self.points.lock().expect("NAT history lock poisoned").push(point);
    }

    /// Recompute the ranked TA list and swap it in atomically.
    ///
    /// Peer-reported views of our endpoint win, most recent first; the
    /// base addresses follow. Duplicates keep their best rank.
    pub fn refresh(&self) {
        let mut ranked: Vec<TransportAddress> = Vec::new();

        {
            let points = self.points.lock().expect("NAT history lock poisoned");
            for point in points.iter().rev() {
                if let Some(view) = &point.peer_view {
                    if !ranked.contains(view) {
                        ranked.push(view.clone());
                    }
                }
            }
        }

        for ta in self.base_tas.read().expect("base TA lock poisoned").iter() {
            if !ranked.contains(ta) {
                ranked.push(ta.clone());
            }
        }

        *self.ranked.write().expect("ranked TA lock poisoned") = Arc::from(ranked);
    }

    /// Current advertised TA list, highest rank first.
    pub fn local_tas(&self) -> Arc<[TransportAddress]> {
        self.ranked.read().expect("ranked TA lock poisoned").clone()
    }

    /// Snapshot of all recorded points, oldest first.
    pub fn points(&self) -> Vec<NatPoint> {
        self.points.lock().expect("NAT history lock poisoned").clone()
    }

    /// Number of recorded points of one kind.
    pub fn count(&self, kind: NatPointKind) -> usize {
        self.points
            .lock()
            .expect("NAT history lock poisoned")
            .iter()
            .filter(|p| p.kind == kind)
            .count()
    }
}

impl Default for NatHistory {
    fn default() -> Self {
        Self::new()
    }
}
