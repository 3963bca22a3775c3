//! Shortcut Target Sampling
//!
//! Draws long-range link targets with the 1/d density over ring distance
//! that makes a Kleinberg small-world overlay navigable: the exponent of
//! the jump distance is uniform on `[160 - log2(N), 160)`, so every
//! distance scale between a typical inter-node gap and the whole ring is
//! equally likely.
//!
//! The fractional power of two is evaluated in floating point, scaled to
//! a 53-bit mantissa, and truncated toward zero before being shifted
//! into the 160-bit magnitude.

use crate::address::{u160, Address, Distance, ADDRESS_BITS};
use rand::Rng;

/// Mantissa bits taken from the floating-point fractional factor.
const MANTISSA_BITS: u32 = 52;

/// Sample a shortcut target for `local` given a network-size estimate.
///
/// Returns a valid (parity-coerced) address at ring offset `±2^ex` from
/// `local`, with `ex` uniform on `[160 - log2(max(N, 2)), 160)`.
pub fn sample_target<R: Rng + ?Sized>(
    rng: &mut R,
    local: &Address,
    network_size: u64,
) -> Address {
    let n = network_size.max(2) as f64;
    let p: f64 = rng.random();
    let ex = ADDRESS_BITS as f64 - (1.0 - p) * n.log2();

    let ex_i = ex.floor() as u32;
    let ex_f = ex - ex.floor();
    let mant = (ex_f.exp2() * (1u64 << MANTISSA_BITS) as f64) as u64;

    let mag = if ex_i >= MANTISSA_BITS {
        u160::from_u64_shifted(mant, ex_i - MANTISSA_BITS)
    } else {
        u160::from_u64(mant >> (MANTISSA_BITS - ex_i))
    };

    let neg: bool = rng.random();
    local.wrapping_offset(&Distance::new(neg, mag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Bit index of the most significant set bit.
    fn bit_len(mag: &[u8; 20]) -> Option<u32> {
        for (i, b) in mag.iter().enumerate() {
            if *b != 0 {
                return Some((19 - i as u32) * 8 + (7 - b.leading_zeros()));
            }
        }
        None
    }

    fn abs_ring_distance(local: &Address, target: &Address) -> [u8; 20] {
        *local.distance_to(target).abs_bytes()
    }

    #[test]
    fn test_targets_are_valid_addresses() {
        let mut rng = StdRng::seed_from_u64(7);
        let local = Address::random();
        for _ in 0..256 {
            let target = sample_target(&mut rng, &local, 1000);
            assert_eq!(target.as_bytes()[19] & 1, 0);
        }
    }

    #[test]
    fn test_tiny_network_size_clamped() {
        let mut rng = StdRng::seed_from_u64(8);
        let local = Address::from_u64(0x1000);
        // N of 0 or 1 must not produce a degenerate log.
        for n in [0u64, 1, 2] {
            let target = sample_target(&mut rng, &local, n);
            assert_ne!(target, local);
        }
    }

    /// The signature of the 1/d law: the jump exponent is uniform, so
    /// each power-of-two distance decade collects an equal share.
    #[test]
    fn test_log_uniform_decades() {
        const SAMPLES: usize = 10_000;
        let mut rng = StdRng::seed_from_u64(42);
        let local = Address::from_u64(0);
        let n = 1024u64; // log2 = 10: exponents span [150, 160)

        let mut decades = [0usize; 160];
        let mut below_floor = 0usize;
        for _ in 0..SAMPLES {
            let target = sample_target(&mut rng, &local, n);
            let d = abs_ring_distance(&local, &target);
            match bit_len(&d) {
                Some(bits) if bits >= 150 => decades[bits as usize] += 1,
                _ => below_floor += 1,
            }
        }

        // Decades 150..=157 are untouched by antipode folding and each
        // carry ~10% of the mass.
        for bits in 150..=157 {
            assert!(
                (850..=1200).contains(&decades[bits]),
                "decade {bits}: {}",
                decades[bits]
            );
        }
        // Offsets past the antipode fold down into decade 158, which
        // therefore carries its own share plus most of the top decade's.
        assert!(
            (1350..=1850).contains(&decades[158]),
            "decade 158: {}",
            decades[158]
        );
        // Folding to below the smallest scale is vanishingly rare.
        assert!(below_floor < 50, "below floor: {below_floor}");
    }

    #[test]
    fn test_median_distance_matches_cdf() {
        const SAMPLES: usize = 10_000;
        let mut rng = StdRng::seed_from_u64(99);
        let local = Address::from_u64(0);
        let n = 1024u64;

        // Analytically, half the exponents land below the midpoint 155.
        let midpoint = u160::from_u64_shifted(1, 155);
        let below = (0..SAMPLES)
            .filter(|_| {
                let target = sample_target(&mut rng, &local, n);
                abs_ring_distance(&local, &target) < midpoint
            })
            .count();
        let fraction = below as f64 / SAMPLES as f64;
        assert!(
            (0.45..=0.55).contains(&fraction),
            "fraction below midpoint: {fraction}"
        );
    }

    #[test]
    fn test_larger_network_reaches_shorter_scales() {
        const SAMPLES: usize = 2_000;
        let local = Address::from_u64(0);

        let mut rng = StdRng::seed_from_u64(5);
        let shortest_small_n = (0..SAMPLES)
            .filter_map(|_| {
                let t = sample_target(&mut rng, &local, 1 << 10);
                bit_len(&abs_ring_distance(&local, &t))
            })
            .min()
            .unwrap();

        let mut rng = StdRng::seed_from_u64(5);
        let shortest_large_n = (0..SAMPLES)
            .filter_map(|_| {
                let t = sample_target(&mut rng, &local, 1 << 40);
                bit_len(&abs_ring_distance(&local, &t))
            })
            .min()
            .unwrap();

        // A denser network samples proportionally shorter shortcuts.
        assert!(shortest_large_n < shortest_small_n);
        assert!(shortest_large_n >= 115);
    }
}
