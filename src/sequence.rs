//! Wrap-around arithmetic for 16-bit sequence numbers. Sequence numbers are positions on a ring
//!  of 65536 values: `a` is 'greater' than `b` if it is ahead of `b` by at most half the ring.

/// half the sequence number ring
pub const HALF_RANGE: u16 = 32768;

/// `true` if `a` is newer than `b`, taking wrap-around into account
pub fn sequence_greater_than(a: u16, b: u16) -> bool {
    (a > b && a - b <= HALF_RANGE) || (a < b && b - a > HALF_RANGE)
}

/// The shorter of the two distances between `a` and `b` on the ring, i.e. a value in
///  `0..=32768`. Symmetric in its arguments.
pub fn sequence_distance(a: u16, b: u16) -> u16 {
    let forward = a.wrapping_sub(b);
    let backward = b.wrapping_sub(a);
    forward.min(backward)
}
