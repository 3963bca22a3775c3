//! Edge Abstraction
//!
//! An edge is a logical bidirectional channel between two nodes,
//! multiplexed over whatever the underlying transport provides. Inbound
//! traffic and lifecycle changes are reported through explicit listener
//! interfaces rather than ad-hoc callbacks: a per-edge [`EdgeSink`]
//! receives payloads and the close notification, and a listener-wide
//! [`EdgeEventSink`] is told about every edge that comes into existence.

use super::TransportAddress;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by edge operations.
#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("edge is closed")]
    Closed,

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

/// A logical channel to one remote node.
///
/// Implementations multiplex many edges over a shared transport. Sending
/// never blocks the caller: overflow of the transport's bounded send
/// queue drops the packet, which this unreliable layer already tolerates.
pub trait Edge: Send + Sync {
    /// Queue a payload for the remote node.
    fn send(&self, payload: &[u8]) -> Result<(), EdgeError>;

    /// Close the edge, notifying the remote side on a best-effort basis.
    ///
    /// Closing is one-way: a closed edge never reopens. Closing an
    /// already-closed edge is a no-op.
    fn close(&self);

    /// This side's edge identifier (always positive).
    fn local_id(&self) -> i32;

    /// The remote side's edge identifier.
    ///
    /// Zero while an outbound edge is still inside its handshake window.
    fn remote_id(&self) -> i32;

    /// The remote endpoint as currently observed.
    fn remote_ta(&self) -> TransportAddress;

    /// The local endpoint the edge is bound to.
    fn local_ta(&self) -> TransportAddress;

    /// What the remote peer believes our endpoint to be, when known.
    fn peer_view_of_local_ta(&self) -> Option<TransportAddress>;

    /// True when the remote side initiated this edge.
    fn is_inbound(&self) -> bool;

    /// True once the edge has been closed.
    fn is_closed(&self) -> bool;

    /// Register the sink receiving this edge's inbound traffic.
    ///
    /// Payloads arriving before a sink is registered are dropped.
    fn set_sink(&self, sink: Arc<dyn EdgeSink>);
}

/// Receiver of a single edge's inbound traffic and close notification.
pub trait EdgeSink: Send + Sync {
    /// A payload arrived on the edge.
    fn on_packet(&self, payload: &[u8]);

    /// The edge transitioned to the closed state.
    fn on_close(&self);
}

/// Receiver of listener-wide edge creation events.
pub trait EdgeEventSink: Send + Sync {
    /// A new edge exists, inbound or outbound.
    fn on_edge(&self, edge: Arc<dyn Edge>);
}
