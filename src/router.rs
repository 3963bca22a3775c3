//! Next-Hop Routing
//!
//! A pure decision function over the local address, the connection
//! table, and a packet header. Three modes share the same skeleton:
//!
//! - **Greedy** forwards to the neighbor nearest the destination until no
//!   neighbor beats the local node, which then consumes the packet. This
//!   is what gives consistent key delivery.
//! - **Annealing** tolerates ring disorder during churn by allowing a
//!   bounded number of uphill hops, then enforcing strict progress so a
//!   packet cannot oscillate.
//! - **Exact** overlays annealing and terminates only at the exact
//!   destination address.

use crate::address::Address;
use crate::connection::ConnectionTable;
use tracing::trace;

/// Hop limit before a packet is dropped.
pub const MAX_TTL: u32 = 30;

/// Uphill hops an annealing packet may take before progress is enforced.
pub const MAX_UPHILL_HOPS: u32 = 1;

/// Routing mode carried in every packet header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutingMode {
    /// Terminate at the node holding the destination's interval.
    Greedy,
    /// Greedy with a bounded uphill budget.
    Annealing,
    /// Terminate only at the exact destination address.
    Exact,
}

/// The routed header of an overlay packet.
#[derive(Clone, Copy, Debug)]
pub struct PacketHeader {
    /// Originating address.
    pub src: Address,
    /// Destination key.
    pub dst: Address,
    /// Routing mode.
    pub mode: RoutingMode,
    /// Hops taken so far.
    pub hops: u32,
}

/// Outcome of a routing decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HopDecision {
    /// Neighbor to forward to, when any.
    pub next: Option<Address>,
    /// Whether the local node consumes the packet.
    pub deliver_locally: bool,
}

impl HopDecision {
    fn drop_packet() -> Self {
        Self {
            next: None,
            deliver_locally: false,
        }
    }

    fn local() -> Self {
        Self {
            next: None,
            deliver_locally: true,
        }
    }

    fn forward(next: Address) -> Self {
        Self {
            next: Some(next),
            deliver_locally: false,
        }
    }
}

/// Per-node routing state: the local address and the two knobs.
#[derive(Clone, Copy, Debug)]
pub struct Router {
    local: Address,
    max_ttl: u32,
    max_uphill_hops: u32,
}

impl Router {
    /// Create a router with the default TTL and uphill budget.
    pub fn new(local: Address) -> Self {
        Self::with_limits(local, MAX_TTL, MAX_UPHILL_HOPS)
    }

    /// Create a router with explicit limits.
    pub fn with_limits(local: Address, max_ttl: u32, max_uphill_hops: u32) -> Self {
        Self {
            local,
            max_ttl,
            max_uphill_hops,
        }
    }

    /// The local address routing decisions are made for.
    pub fn local(&self) -> &Address {
        &self.local
    }

    /// Decide the next hop for a packet.
    ///
    /// `from` is the previous hop's address, None at the source.
    pub fn next_hop(
        &self,
        from: Option<&Address>,
        packet: &PacketHeader,
        table: &ConnectionTable,
    ) -> HopDecision {
        if packet.hops > self.max_ttl {
            trace!(dst = %packet.dst, hops = packet.hops, "TTL exceeded, dropping");
            return HopDecision::drop_packet();
        }
        if self.local == packet.dst {
            return HopDecision::local();
        }

        let mut decision = self.decide(from, packet, table);
        if packet.mode == RoutingMode::Exact {
            // Exact mode never consumes anywhere but the destination,
            // which was handled above.
            decision.deliver_locally = false;
        }
        decision
    }

    fn decide(
        &self,
        from: Option<&Address>,
        packet: &PacketHeader,
        table: &ConnectionTable,
    ) -> HopDecision {
        let idx = table.index_of(&packet.dst);
        if idx >= 0 {
            // The destination itself is a neighbor.
            return HopDecision::forward(packet.dst);
        }
        if table.size() == 0 {
            // No neighbors at all: we are trivially the closest node.
            return HopDecision::local();
        }

        // The destination falls between two neighbors on the ring: the
        // right one sits just before the insertion point, the left one at
        // it (modular).
        let ins = !idx;
        let right = table
            .get_by_index(ins - 1)
            .expect("non-empty table has an entry");
        let left = table.get_by_index(ins).expect("non-empty table has an entry");
        let l_dist = packet.dst.distance_to(&left);
        let r_dist = packet.dst.distance_to(&right);
        let closest_is_left = l_dist.cmp_abs(&r_dist).is_lt();
        let (closest, closest_dist, other) = if closest_is_left {
            (left, l_dist, right)
        } else {
            (right, r_dist, left)
        };

        match packet.mode {
            RoutingMode::Greedy => self.greedy(from, packet, &closest, &closest_dist),
            RoutingMode::Annealing | RoutingMode::Exact => self.anneal(
                from,
                packet,
                table,
                ins,
                &left,
                &right,
                &closest,
                &closest_dist,
                closest_is_left,
                &other,
            ),
        }
    }

    fn greedy(
        &self,
        from: Option<&Address>,
        packet: &PacketHeader,
        closest: &Address,
        closest_dist: &crate::address::Distance,
    ) -> HopDecision {
        let our_dist = packet.dst.distance_to(&self.local);
        if closest_dist.cmp_abs(&our_dist).is_lt() && Some(closest) != from {
            HopDecision::forward(*closest)
        } else {
            HopDecision::local()
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn anneal(
        &self,
        from: Option<&Address>,
        packet: &PacketHeader,
        table: &ConnectionTable,
        ins: isize,
        left: &Address,
        right: &Address,
        closest: &Address,
        closest_dist: &crate::address::Distance,
        closest_is_left: bool,
        other: &Address,
    ) -> HopDecision {
        // When the destination and the local node share a left neighbor,
        // the destination's interval contains us: consume here, and keep
        // a copy moving toward the neighbor on the destination's side.
        let local_idx = table.index_of(&self.local);
        let local_left = if local_idx >= 0 {
            table.get_by_index(local_idx + 1)
        } else {
            table.get_by_index(!local_idx)
        }
        .expect("non-empty table has an entry");

        if *left == local_left {
            // The onward copy goes to the interval boundary on the
            // destination's side of us.
            let onward = if self.local.is_left_of(&packet.dst) {
                *left
            } else {
                *right
            };
            let next = if Some(&onward) == from {
                None
            } else {
                Some(onward)
            };
            return HopDecision {
                next,
                deliver_locally: true,
            };
        }

        if packet.hops == 0 {
            return HopDecision::forward(*closest);
        }

        if packet.hops <= self.max_uphill_hops {
            if Some(closest) != from {
                return HopDecision::forward(*closest);
            }
            // The best neighbor is where we came from. Look one position
            // beyond it on its own side and take the better of that and
            // the other side.
            let second = if closest_is_left {
                table.get_by_index(ins + 1)
            } else {
                table.get_by_index(ins - 2)
            }
            .expect("non-empty table has an entry");

            let best = [*other, second]
                .into_iter()
                .filter(|c| Some(c) != from)
                .min_by(|a, b| {
                    packet
                        .dst
                        .distance_to(a)
                        .cmp_abs(&packet.dst.distance_to(b))
                });
            return match best {
                Some(next) => HopDecision::forward(next),
                None => HopDecision::drop_packet(),
            };
        }

        // The uphill budget is spent: every further hop must make strict
        // progress toward the destination.
        let Some(from) = from else {
            return HopDecision::forward(*closest);
        };
        let prev_dist = packet.dst.distance_to(from);
        if closest_dist.cmp_abs(&prev_dist).is_lt() {
            HopDecision::forward(*closest)
        } else {
            trace!(dst = %packet.dst, "No progress possible, dropping");
            HopDecision::drop_packet()
        }
    }
}
