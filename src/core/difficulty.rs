//! Compact difficulty targets and the retarget calculation.
//!
//! A target is a 256-bit big-endian threshold: a header's identity hash,
//! byte-reversed into the same big-endian form, must compare less than or
//! equal to it. On the wire targets travel in the 4-byte "compact" form
//! (`bits`): one exponent byte followed by a 3-byte mantissa, i.e.
//! `mantissa * 256^(exponent - 3)`. The compact form is lossy — only the
//! top three bytes of a target survive a round trip — which is why retarget
//! validation compares compact encodings, never raw targets.

use num_bigint::BigUint;
use num_traits::Zero;

use crate::core::types::Hash256;

/// A 256-bit difficulty target, big-endian
pub type Target = [u8; 32];

/// Expand a compact representation into a full 256-bit target.
///
/// Returns `None` for encodings that are out of range: a set sign bit
/// (0x00800000 in the mantissa), an exponent that would overflow 256 bits,
/// or a zero mantissa.
pub fn expand_target(bits: u32) -> Option<Target> {
    let exponent = (bits >> 24) as usize;
    let mantissa = bits & 0x00ff_ffff;
    if mantissa & 0x0080_0000 != 0 || mantissa == 0 {
        return None;
    }
    if exponent > 32 {
        return None;
    }

    let mut target = [0u8; 32];
    let mantissa_bytes = [
        (mantissa >> 16) as u8,
        (mantissa >> 8) as u8,
        mantissa as u8,
    ];
    if exponent <= 3 {
        // the mantissa itself is truncated
        let keep = exponent;
        target[32 - keep..].copy_from_slice(&mantissa_bytes[..keep]);
    } else {
        let offset = 32 - exponent;
        target[offset..offset + 3].copy_from_slice(&mantissa_bytes);
    }
    Some(target)
}

/// Compress a target back into compact form. Inverse of [`expand_target`]
/// up to the precision the compact form can carry.
pub fn compress_target(target: &Target) -> u32 {
    let first = match target.iter().position(|b| *b != 0) {
        Some(i) => i,
        None => return 0,
    };
    let mut size = 32 - first;
    let mut mantissa: u32 = 0;
    for i in 0..3 {
        mantissa <<= 8;
        if first + i < 32 {
            mantissa |= target[first + i] as u32;
        }
    }
    // keep the sign bit clear
    if mantissa & 0x0080_0000 != 0 {
        mantissa >>= 8;
        size += 1;
    }
    ((size as u32) << 24) | mantissa
}

/// Does `hash` (internal byte order) satisfy `target`?
///
/// The hash is byte-reversed into big-endian form and compared as an
/// unsigned 256-bit integer.
pub fn meets_target(hash: &Hash256, target: &Target) -> bool {
    let mut be = *hash;
    be.reverse();
    be[..] <= target[..]
}

/// The bounded retarget formula: scale the previous target by the observed
/// timespan over the scheduled timespan, clamping the adjustment to 4x in
/// either direction, and never exceeding `max_target`.
pub fn calculate_pow_target(
    timespan: u32,
    prev_target: &Target,
    target_timespan: u32,
    max_target: &Target,
) -> Target {
    // bound adjustment so attackers can't use an extreme timespan
    let timespan = timespan
        .max(target_timespan / 4)
        .min(target_timespan.saturating_mul(4));

    let mut scaled = BigUint::from_bytes_be(prev_target);
    scaled *= timespan;
    scaled /= target_timespan;

    if scaled.is_zero() {
        let mut lowest = [0u8; 32];
        lowest[31] = 1;
        return lowest;
    }

    let max = BigUint::from_bytes_be(max_target);
    if scaled > max {
        return *max_target;
    }

    let bytes = scaled.to_bytes_be();
    let mut target = [0u8; 32];
    target[32 - bytes.len()..].copy_from_slice(&bytes);
    target
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_known_bits() {
        // bitcoin's original maximum: 0xffff shifted up 26 bytes
        let target = expand_target(0x1d00ffff).unwrap();
        let mut expected = [0u8; 32];
        expected[4] = 0xff;
        expected[5] = 0xff;
        assert_eq!(target, expected);
    }

    #[test]
    fn test_compress_roundtrip() {
        for bits in [0x1d00ffff, 0x207fffff, 0x2007ffff, 0x1b0404cb, 0x04123456] {
            let target = expand_target(bits).unwrap();
            assert_eq!(compress_target(&target), bits, "bits {bits:#010x}");
        }
    }

    #[test]
    fn test_compress_renormalizes_high_mantissa() {
        // a leading byte >= 0x80 must shift into a longer exponent
        let mut target = [0u8; 32];
        target[2] = 0x80;
        let bits = compress_target(&target);
        assert_eq!(bits, 0x1f008000);
        assert_eq!(expand_target(bits).unwrap(), target);
    }

    #[test]
    fn test_expand_rejects_invalid() {
        assert!(expand_target(0).is_none());
        assert!(expand_target(0x1d800000).is_none()); // sign bit
        assert!(expand_target(0x21000001).is_none()); // exponent overflow
    }

    #[test]
    fn test_meets_target_boundary() {
        let target = expand_target(0x1d00ffff).unwrap();
        // hash equal to the target (in internal order) still passes
        let mut hash = target;
        hash.reverse();
        assert!(meets_target(&hash, &target));
        // one above fails
        let mut above = target;
        above[5] = 0xff;
        above[6] = 0x01;
        above.reverse();
        assert!(!meets_target(&above, &target));
    }

    #[test]
    fn test_retarget_scales_linearly() {
        let prev = expand_target(0x2007ffff).unwrap();
        let max = expand_target(0x207fffff).unwrap();
        let timespan = 4800u32;
        let halved = calculate_pow_target(timespan / 2, &prev, timespan, &max);
        let prev_bn = BigUint::from_bytes_be(&prev);
        assert_eq!(BigUint::from_bytes_be(&halved), &prev_bn / 2u32);
    }

    #[test]
    fn test_retarget_clamps_to_4x() {
        let prev = expand_target(0x2007ffff).unwrap();
        let max = expand_target(0x207fffff).unwrap();
        let timespan = 4800u32;
        let four_x = calculate_pow_target(timespan * 4, &prev, timespan, &max);
        let prev_bn = BigUint::from_bytes_be(&prev);
        assert_eq!(BigUint::from_bytes_be(&four_x), &prev_bn * 4u32);
        // a wildly larger timespan clamps to the same result
        let extreme = calculate_pow_target(1_000_000_000, &prev, timespan, &max);
        assert_eq!(extreme, four_x);
        // and the quarter clamp on the other side
        let quarter = calculate_pow_target(1, &prev, timespan, &max);
        assert_eq!(BigUint::from_bytes_be(&quarter), &prev_bn / 4u32);
    }

    #[test]
    fn test_retarget_never_exceeds_max() {
        let max = expand_target(0x207fffff).unwrap();
        let relaxed = calculate_pow_target(1_000_000, &max, 4800, &max);
        assert_eq!(relaxed, max);
    }
}
