//! 160-bit ring address with signed modular distance.
//!
//! Every overlay node carries an `Address`: a 160-bit unsigned integer
//! interpreted on the circular space of size `2^160`. Ring distance is the
//! signed offset of minimum magnitude, which gives every pair of addresses
//! a well-defined "left" (positive) and "right" (negative) direction.
//!
//! Valid addresses keep the low-order bit cleared. The invariant is
//! enforced at every construction site so downstream code never has to
//! re-check it.

use rand::rngs::OsRng;
use rand::TryRngCore;
use std::fmt;
use thiserror::Error;

/// Width of an address in bytes.
pub const ADDRESS_BYTES: usize = 20;

/// Width of an address in bits. The ring has `2^160` positions.
pub const ADDRESS_BITS: u32 = 160;

/// Errors related to address construction.
#[derive(Debug, Error)]
pub enum AddressError {
    #[error("invalid address length: {0} (expected 20)")]
    InvalidLength(usize),

    #[error("invalid address hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// A 160-bit overlay address, big-endian bytes, low bit always zero.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address([u8; ADDRESS_BYTES]);

impl Address {
    /// Create an address from a 20-byte array, coercing the parity bit.
    pub fn from_bytes(mut bytes: [u8; ADDRESS_BYTES]) -> Self {
        bytes[ADDRESS_BYTES - 1] &= 0xFE;
        Self(bytes)
    }

    /// Create an address from a slice.
    pub fn from_slice(slice: &[u8]) -> Result<Self, AddressError> {
        if slice.len() != ADDRESS_BYTES {
            return Err(AddressError::InvalidLength(slice.len()));
        }
        let mut bytes = [0u8; ADDRESS_BYTES];
        bytes.copy_from_slice(slice);
        Ok(Self::from_bytes(bytes))
    }

    /// Create an address from the low 64 bits of the ring.
    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; ADDRESS_BYTES];
        bytes[ADDRESS_BYTES - 8..].copy_from_slice(&value.to_be_bytes());
        Self::from_bytes(bytes)
    }

    /// Parse an address from a 40-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, AddressError> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }

    /// Generate a uniformly random address from the OS entropy source.
    pub fn random() -> Self {
        let mut bytes = [0u8; ADDRESS_BYTES];
        OsRng
            .try_fill_bytes(&mut bytes)
            .expect("OS entropy source unavailable");
        Self::from_bytes(bytes)
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; ADDRESS_BYTES] {
        &self.0
    }

    /// Hex form of the full address.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Signed ring distance from `self` to `other`.
    ///
    /// The result `d` satisfies `self + d ≡ other (mod 2^160)` with `d` in
    /// `(-2^159, 2^159]`; the exact antipode resolves positive.
    pub fn distance_to(&self, other: &Address) -> Distance {
        let diff = u160::sub(other.0, self.0);
        if u160::is_zero(&diff) {
            return Distance::ZERO;
        }
        if diff > u160::HALF {
            Distance::new(true, u160::sub([0u8; ADDRESS_BYTES], diff))
        } else {
            Distance::new(false, diff)
        }
    }

    /// True when `other` lies in the positive half-ring from `self`.
    ///
    /// Consistent with the sign of [`Address::distance_to`].
    pub fn is_left_of(&self, other: &Address) -> bool {
        self.distance_to(other).is_positive()
    }

    /// Move along the ring by a signed distance, preserving parity.
    pub fn wrapping_offset(&self, d: &Distance) -> Address {
        let bytes = if d.neg {
            u160::sub(self.0, d.mag)
        } else {
            u160::add(self.0, d.mag)
        };
        Address::from_bytes(bytes)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Signed ring offset: a sign and a 160-bit magnitude.
///
/// Zero is normalized to non-negative so equality is structural.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Distance {
    neg: bool,
    mag: [u8; ADDRESS_BYTES],
}

impl Distance {
    /// The zero offset.
    pub const ZERO: Distance = Distance {
        neg: false,
        mag: [0u8; ADDRESS_BYTES],
    };

    /// Build a distance from sign and magnitude.
    pub fn new(neg: bool, mag: [u8; ADDRESS_BYTES]) -> Self {
        if u160::is_zero(&mag) {
            Self::ZERO
        } else {
            Self { neg, mag }
        }
    }

    /// Magnitude bytes (the absolute distance).
    pub fn abs_bytes(&self) -> &[u8; ADDRESS_BYTES] {
        &self.mag
    }

    /// True for a strictly positive offset.
    pub fn is_positive(&self) -> bool {
        !self.neg && !u160::is_zero(&self.mag)
    }

    /// True for a strictly negative offset.
    pub fn is_negative(&self) -> bool {
        self.neg
    }

    /// True for the zero offset.
    pub fn is_zero(&self) -> bool {
        u160::is_zero(&self.mag)
    }

    /// Compare absolute values only.
    pub fn cmp_abs(&self, other: &Distance) -> std::cmp::Ordering {
        self.mag.cmp(&other.mag)
    }
}

impl PartialOrd for Distance {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Distance {
    /// Signed numeric order on the ring offset.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (self.neg, other.neg) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => self.mag.cmp(&other.mag),
            (true, true) => other.mag.cmp(&self.mag),
        }
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.neg { "-" } else { "+" };
        write!(f, "Distance({}{})", sign, hex::encode(self.mag))
    }
}

/// Fixed-width 160-bit helpers shared by the address, sampler, and
/// estimator code. Values are big-endian 20-byte arrays, so the derived
/// lexicographic byte order is also numeric order.
pub(crate) mod u160 {
    use super::ADDRESS_BYTES;

    pub(crate) type U160 = [u8; ADDRESS_BYTES];

    /// `2^159`, the antipode offset.
    pub(crate) const HALF: U160 = {
        let mut h = [0u8; ADDRESS_BYTES];
        h[0] = 0x80;
        h
    };

    /// `2^160 - 1`.
    pub(crate) const MAX: U160 = [0xFF; ADDRESS_BYTES];

    pub(crate) fn is_zero(v: &U160) -> bool {
        v.iter().all(|b| *b == 0)
    }

    pub(crate) fn from_u64(value: u64) -> U160 {
        let mut out = [0u8; ADDRESS_BYTES];
        out[ADDRESS_BYTES - 8..].copy_from_slice(&value.to_be_bytes());
        out
    }

    /// Low 64 bits, or `u64::MAX` when the value does not fit.
    pub(crate) fn to_u64_saturating(v: &U160) -> u64 {
        if v[..ADDRESS_BYTES - 8].iter().any(|b| *b != 0) {
            return u64::MAX;
        }
        let mut low = [0u8; 8];
        low.copy_from_slice(&v[ADDRESS_BYTES - 8..]);
        u64::from_be_bytes(low)
    }

    /// Wrapping addition mod `2^160`.
    pub(crate) fn add(a: U160, b: U160) -> U160 {
        let mut out = [0u8; ADDRESS_BYTES];
        let mut carry = 0u16;
        for i in (0..ADDRESS_BYTES).rev() {
            let sum = a[i] as u16 + b[i] as u16 + carry;
            out[i] = sum as u8;
            carry = sum >> 8;
        }
        out
    }

    /// Wrapping subtraction mod `2^160`.
    pub(crate) fn sub(a: U160, b: U160) -> U160 {
        let mut out = [0u8; ADDRESS_BYTES];
        let mut borrow = 0i16;
        for i in (0..ADDRESS_BYTES).rev() {
            let diff = a[i] as i16 - b[i] as i16 - borrow;
            if diff < 0 {
                out[i] = (diff + 256) as u8;
                borrow = 1;
            } else {
                out[i] = diff as u8;
                borrow = 0;
            }
        }
        out
    }

    /// Place a 64-bit mantissa at a bit offset: `mant << shift`.
    ///
    /// Bits shifted past the top are discarded (reduction mod `2^160`).
    pub(crate) fn from_u64_shifted(mant: u64, shift: u32) -> U160 {
        let mut out = [0u8; ADDRESS_BYTES];
        let byte_shift = (shift / 8) as usize;
        let bit_shift = shift % 8;
        let wide = (mant as u128) << bit_shift;
        let wide_bytes = wide.to_be_bytes();
        for (i, b) in wide_bytes.iter().enumerate() {
            // wide occupies bytes [ADDRESS_BYTES - 16 - byte_shift, ..)
            let pos = ADDRESS_BYTES as isize - 16 - byte_shift as isize + i as isize;
            if (0..ADDRESS_BYTES as isize).contains(&pos) {
                out[pos as usize] |= *b;
            }
        }
        out
    }

    fn bit(v: &U160, index: u32) -> bool {
        let byte = (index / 8) as usize;
        let mask = 0x80u8 >> (index % 8);
        v[byte] & mask != 0
    }

    fn set_bit(v: &mut U160, index: u32) {
        let byte = (index / 8) as usize;
        let mask = 0x80u8 >> (index % 8);
        v[byte] |= mask;
    }

    fn shl1(v: &mut U160) {
        let mut carry = 0u8;
        for i in (0..ADDRESS_BYTES).rev() {
            let next_carry = v[i] >> 7;
            v[i] = (v[i] << 1) | carry;
            carry = next_carry;
        }
    }

    /// Truncating division with remainder. `d` must be nonzero.
    pub(crate) fn div_rem(n: U160, d: U160) -> (U160, U160) {
        debug_assert!(!is_zero(&d));
        let mut q = [0u8; ADDRESS_BYTES];
        let mut r = [0u8; ADDRESS_BYTES];
        for i in 0..super::ADDRESS_BITS {
            shl1(&mut r);
            if bit(&n, i) {
                r[ADDRESS_BYTES - 1] |= 1;
            }
            if r >= d {
                r = sub(r, d);
                set_bit(&mut q, i);
            }
        }
        (q, r)
    }

    /// `floor(2^160 / d)`, saturating at `2^160 - 1`. `d` must be nonzero.
    pub(crate) fn div_full(d: U160) -> U160 {
        let (q, r) = div_rem(MAX, d);
        // 2^160 = MAX + 1, so the quotient bumps by one exactly when the
        // remainder was d - 1.
        let one = from_u64(1);
        if r == sub(d, one) {
            if q == MAX {
                MAX
            } else {
                add(q, one)
            }
        } else {
            q
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parity_coerced_on_construction() {
        let addr = Address::from_bytes([0xFF; ADDRESS_BYTES]);
        assert_eq!(addr.as_bytes()[ADDRESS_BYTES - 1] & 1, 0);

        let addr = Address::from_u64(0x1235);
        assert_eq!(addr, Address::from_u64(0x1234));

        for _ in 0..32 {
            assert_eq!(Address::random().as_bytes()[ADDRESS_BYTES - 1] & 1, 0);
        }
    }

    #[test]
    fn test_from_slice_length_check() {
        assert!(Address::from_slice(&[0u8; ADDRESS_BYTES]).is_ok());
        assert!(matches!(
            Address::from_slice(&[0u8; 16]),
            Err(AddressError::InvalidLength(16))
        ));
    }

    #[test]
    fn test_hex_roundtrip() {
        let addr = Address::from_u64(0xDEAD_BEE0);
        let restored = Address::from_hex(&addr.to_hex()).unwrap();
        assert_eq!(addr, restored);
        assert!(Address::from_hex("zz").is_err());
    }

    #[test]
    fn test_distance_small_positive() {
        let a = Address::from_u64(0x10);
        let b = Address::from_u64(0x50);
        let d = a.distance_to(&b);
        assert!(d.is_positive());
        assert_eq!(*d.abs_bytes(), u160::from_u64(0x40));
        assert!(a.is_left_of(&b));
        assert!(!b.is_left_of(&a));
    }

    #[test]
    fn test_distance_wraps_through_zero() {
        // b is a little behind the origin, a a little ahead: the short way
        // from a to b goes backwards through zero.
        let a = Address::from_u64(0x10);
        let b = Address::from_bytes([0xFF; ADDRESS_BYTES]); // 2^160 - 2
        let d = a.distance_to(&b);
        assert!(d.is_negative());
        assert_eq!(*d.abs_bytes(), u160::from_u64(0x12));
    }

    #[test]
    fn test_distance_antipode_is_positive() {
        let a = Address::from_u64(0);
        let b = Address::from_bytes(u160::HALF);
        let d = a.distance_to(&b);
        assert!(d.is_positive());
        assert_eq!(*d.abs_bytes(), u160::HALF);
        // And one past the antipode flips negative.
        let c = b.wrapping_offset(&Distance::new(false, u160::from_u64(2)));
        assert!(a.distance_to(&c).is_negative());
    }

    #[test]
    fn test_distance_zero() {
        let a = Address::from_u64(42);
        let d = a.distance_to(&a);
        assert!(d.is_zero());
        assert!(!d.is_positive());
        assert!(!d.is_negative());
        assert!(!a.is_left_of(&a));
    }

    #[test]
    fn test_offset_inverts_distance() {
        let a = Address::from_u64(0x1000);
        let b = Address::from_u64(0xF000);
        let d = a.distance_to(&b);
        assert_eq!(a.wrapping_offset(&d), b);

        let back = b.distance_to(&a);
        assert_eq!(b.wrapping_offset(&back), a);
    }

    #[test]
    fn test_distance_ordering() {
        let neg = Distance::new(true, u160::from_u64(100));
        let small = Distance::new(false, u160::from_u64(10));
        let big = Distance::new(false, u160::from_u64(1000));
        assert!(neg < small);
        assert!(small < big);
        assert!(Distance::ZERO < small);
        assert!(neg < Distance::ZERO);
        assert_eq!(neg.cmp_abs(&small), std::cmp::Ordering::Greater);
    }

    #[test]
    fn test_negative_zero_normalized() {
        let d = Distance::new(true, [0u8; ADDRESS_BYTES]);
        assert_eq!(d, Distance::ZERO);
        assert!(!d.is_negative());
    }

    #[test]
    fn test_u160_add_sub() {
        let a = u160::from_u64(u64::MAX);
        let one = u160::from_u64(1);
        let sum = u160::add(a, one);
        // Carry into the ninth byte from the end.
        assert_eq!(sum[ADDRESS_BYTES - 9], 1);
        assert_eq!(u160::sub(sum, one), a);

        // Wrap-around at zero.
        let z = [0u8; ADDRESS_BYTES];
        assert_eq!(u160::sub(z, one), u160::MAX);
        assert_eq!(u160::add(u160::MAX, one), z);
    }

    #[test]
    fn test_u160_div_rem() {
        let n = u160::from_u64(1000);
        let d = u160::from_u64(7);
        let (q, r) = u160::div_rem(n, d);
        assert_eq!(u160::to_u64_saturating(&q), 142);
        assert_eq!(u160::to_u64_saturating(&r), 6);

        // A full-width numerator: (2^160 - 1) / 2^152 == 255.
        let mut big_d = [0u8; ADDRESS_BYTES];
        big_d[0] = 1;
        let (q, _) = u160::div_rem(u160::MAX, big_d);
        assert_eq!(u160::to_u64_saturating(&q), 255);
    }

    #[test]
    fn test_u160_div_full() {
        // 2^160 / 2^159 == 2.
        assert_eq!(u160::to_u64_saturating(&u160::div_full(u160::HALF)), 2);
        // 2^160 / 2^152 == 256.
        let mut d = [0u8; ADDRESS_BYTES];
        d[0] = 1;
        assert_eq!(u160::to_u64_saturating(&u160::div_full(d)), 256);
        // Saturates instead of wrapping for d == 1.
        assert_eq!(u160::div_full(u160::from_u64(1)), u160::MAX);
    }

    #[test]
    fn test_u160_from_u64_shifted() {
        let v = u160::from_u64_shifted(1, 159);
        assert_eq!(v, u160::HALF);

        let v = u160::from_u64_shifted(0xAB, 8);
        assert_eq!(u160::to_u64_saturating(&v), 0xAB00);

        let v = u160::from_u64_shifted(3, 0);
        assert_eq!(u160::to_u64_saturating(&v), 3);

        // A 53-bit mantissa at the top of the space.
        let mant = (1u64 << 53) - 1;
        let v = u160::from_u64_shifted(mant, 107);
        assert!(!u160::is_zero(&v));
        assert!(v < u160::MAX);
    }

    #[test]
    fn test_to_u64_saturating() {
        assert_eq!(u160::to_u64_saturating(&u160::from_u64(77)), 77);
        assert_eq!(u160::to_u64_saturating(&u160::HALF), u64::MAX);
    }

    #[test]
    fn test_display_and_debug() {
        let addr = Address::from_u64(0x10);
        assert_eq!(format!("{}", addr).len(), 40);
        assert!(format!("{:?}", addr).starts_with("Address("));
        let d = Address::from_u64(0).distance_to(&addr);
        assert!(format!("{:?}", d).starts_with("Distance(+"));
    }
}
