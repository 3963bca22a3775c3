//! Network-Size Estimation
//!
//! A density-based estimate from the span of the Near connection set: if
//! `count` neighbors occupy a `width` of ring distance, the whole ring
//! holds about `width / count` of address space per node, and the
//! population is the ring size over that density. The estimate never
//! drops below `count + 1` — we can see that many nodes directly.

use crate::address::{u160, Address};
use crate::connection::Connection;

/// Estimate the network size from the local Near connections.
pub fn estimate_network_size(local: &Address, near: &[Connection]) -> u64 {
    let count = near.len() as u64;
    if near.len() < 2 {
        return count + 1;
    }

    let mut least: Option<[u8; 20]> = None;
    let mut greatest: Option<[u8; 20]> = None;
    for conn in near {
        let d = *local.distance_to(&conn.address).abs_bytes();
        if least.map(|l| d < l).unwrap_or(true) {
            least = Some(d);
        }
        if greatest.map(|g| d > g).unwrap_or(true) {
            greatest = Some(d);
        }
    }
    let least = least.expect("at least two connections");
    let greatest = greatest.expect("at least two connections");

    if greatest <= least {
        return count + 1;
    }

    let width = u160::sub(greatest, least);
    let (inv_density, _) = u160::div_rem(width, u160::from_u64(count));
    if u160::is_zero(&inv_density) {
        return count + 1;
    }
    let estimate = u160::to_u64_saturating(&u160::div_full(inv_density));
    estimate.max(count + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testutil::StubEdge;
    use crate::connection::ConnectionClass;
    use crate::transport::TransportAddress;

    fn conn_at(addr: Address) -> Connection {
        Connection::new(
            addr,
            TransportAddress::udp("127.0.0.1", 1),
            ConnectionClass::Near,
            StubEdge::new(),
        )
    }

    fn addr_at_step(step: u64) -> Address {
        Address::from_bytes(u160::from_u64_shifted(step, 150))
    }

    #[test]
    fn test_too_few_connections() {
        let local = Address::from_u64(0);
        assert_eq!(estimate_network_size(&local, &[]), 1);

        let one = [conn_at(Address::from_u64(0x100))];
        assert_eq!(estimate_network_size(&local, &one), 2);
    }

    #[test]
    fn test_symmetric_neighbors_fall_back_to_count() {
        // Two neighbors at the same absolute distance carry no density
        // information.
        let local = Address::from_u64(0x100);
        let near = [
            conn_at(Address::from_u64(0x80)),
            conn_at(Address::from_u64(0x180)),
        ];
        assert_eq!(estimate_network_size(&local, &near), 3);
    }

    #[test]
    fn test_antipode_pair() {
        // One close neighbor, one at the antipode: density is half the
        // ring over one node.
        let local = Address::from_u64(0);
        let antipode = Address::from_bytes(u160::from_u64_shifted(1, 159));
        let near = [conn_at(Address::from_u64(0x10)), conn_at(antipode)];
        assert_eq!(estimate_network_size(&local, &near), 4);
    }

    #[test]
    fn test_dense_cluster_saturates() {
        // A handful of nodes packed into the bottom of a 2^160 ring
        // reads as an astronomically large population.
        let local = Address::from_u64(0);
        let near: Vec<Connection> = [0x10u64, 0x20, 0x40, 0x80]
            .into_iter()
            .map(|low| conn_at(Address::from_u64(low)))
            .collect();
        assert_eq!(estimate_network_size(&local, &near), u64::MAX);
    }

    #[test]
    fn test_evenly_spaced_ring_factor_two_band() {
        // 1024 nodes spaced 2^150 apart fill the ring exactly; the
        // one-sided-span formula reads about twice the population.
        let local = addr_at_step(0);
        let near: Vec<Connection> = (1..1024).map(|i| conn_at(addr_at_step(i))).collect();

        let estimate = estimate_network_size(&local, &near);
        assert!(
            (1024..=2112).contains(&estimate),
            "estimate: {estimate}"
        );
    }

    #[test]
    fn test_estimate_never_below_count_plus_one() {
        let local = addr_at_step(0);
        let near: Vec<Connection> = (1..64).map(|i| conn_at(addr_at_step(i * 8))).collect();
        let estimate = estimate_network_size(&local, &near);
        assert!(estimate >= 64);
    }
}
