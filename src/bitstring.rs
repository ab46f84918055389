//! Bitstring ↔ field-element codec
//!
//! Items and label parts travel through the engine as little-endian bit
//! strings packed into field elements of `bitlen(p) − 1` bits each. The
//! `−1` guarantees every packed chunk is strictly below `p`, so any prime
//! `p ≥ 3` can carry any bit pattern. The final chunk is zero-padded;
//! decoding takes the original bit count and reproduces the input exactly.
//!
//! A consequence worth naming: no encoded felt can ever reach `p − 1`
//! (the maximum chunk value is `2^{bitlen(p)-1} − 1 < p − 1`), which is why
//! `p − 1` is safe as the [`null_felt`] sentinel for empty bins.

#![forbid(unsafe_code)]

use crate::ffield::{Felt, Modulus};

/// Errors surfaced by the codec.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid modulus {0} (must be at least 3 to carry data bits)")]
    InvalidModulus(u64),
    #[error("cannot decode {bit_count} bits from an empty felt sequence")]
    EmptyInput { bit_count: usize },
    #[error("felt sequence too short: {got} felts cannot carry {bit_count} bits")]
    NotEnoughFelts { got: usize, bit_count: usize },
}

/// Number of data bits carried per felt: `bitlen(p) − 1`.
#[inline]
pub fn bits_per_felt(modulus: Modulus) -> usize {
    (modulus.bit_count() - 1) as usize
}

/// Number of felts needed for `bit_count` bits under `modulus`.
#[inline]
pub fn felts_per_bit_count(bit_count: usize, modulus: Modulus) -> usize {
    let per = bits_per_felt(modulus);
    (bit_count + per - 1) / per
}

/// The reserved felt value no encoded bit chunk can produce.
#[inline]
pub fn null_felt(modulus: Modulus) -> Felt {
    modulus.value() - 1
}

/// Read bit `idx` (little-endian within each byte) from `bytes`.
#[inline]
fn get_bit(bytes: &[u8], idx: usize) -> u64 {
    ((bytes[idx / 8] >> (idx % 8)) & 1) as u64
}

/// Set bit `idx` in `bytes`.
#[inline]
fn set_bit(bytes: &mut [u8], idx: usize, bit: u64) {
    if bit != 0 {
        bytes[idx / 8] |= 1 << (idx % 8);
    }
}

/// Partition the first `bit_count` bits of `bytes` into chunks of
/// `bitlen(p) − 1` bits, each read little-endian as one felt. The final
/// chunk is implicitly zero-padded.
pub fn bits_to_felts(
    bytes: &[u8],
    bit_count: usize,
    modulus: Modulus,
) -> Result<Vec<Felt>, CodecError> {
    if modulus.value() < 3 {
        return Err(CodecError::InvalidModulus(modulus.value()));
    }
    debug_assert!(bytes.len() * 8 >= bit_count, "bit_count exceeds input");
    let per = bits_per_felt(modulus);
    let mut out = Vec::with_capacity(felts_per_bit_count(bit_count, modulus));
    let mut pos = 0usize;
    while pos < bit_count {
        let take = per.min(bit_count - pos);
        let mut felt: u64 = 0;
        for j in 0..take {
            felt |= get_bit(bytes, pos + j) << j;
        }
        out.push(felt);
        pos += take;
    }
    Ok(out)
}

/// Exact inverse of [`bits_to_felts`], given the original bit count.
/// Returns `ceil(bit_count / 8)` bytes with any trailing pad bits zero.
pub fn felts_to_bits(
    felts: &[Felt],
    bit_count: usize,
    modulus: Modulus,
) -> Result<Vec<u8>, CodecError> {
    if modulus.value() < 3 {
        return Err(CodecError::InvalidModulus(modulus.value()));
    }
    if felts.is_empty() && bit_count > 0 {
        return Err(CodecError::EmptyInput { bit_count });
    }
    let per = bits_per_felt(modulus);
    if felts.len() * per < bit_count {
        return Err(CodecError::NotEnoughFelts { got: felts.len(), bit_count });
    }
    let mut out = vec![0u8; (bit_count + 7) / 8];
    let mut pos = 0usize;
    for &felt in felts {
        if pos >= bit_count {
            break;
        }
        let take = per.min(bit_count - pos);
        for j in 0..take {
            set_bit(&mut out, pos + j, (felt >> j) & 1);
        }
        pos += take;
    }
    Ok(out)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn m(p: u64) -> Modulus {
        Modulus::new(p).unwrap()
    }

    #[test]
    fn roundtrip_across_primes_and_bit_counts() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        for p in [3u64, 5, 7, 17, 257, 8191, 65537] {
            for bit_count in [1usize, 3, 8, 15, 16, 17, 100, 128, 384] {
                let mut bytes = vec![0u8; (bit_count + 7) / 8];
                rng.fill(bytes.as_mut_slice());
                // Clear pad bits so the roundtrip comparison is exact.
                if bit_count % 8 != 0 {
                    let last = bytes.len() - 1;
                    bytes[last] &= (1u8 << (bit_count % 8)) - 1;
                }
                let felts = bits_to_felts(&bytes, bit_count, m(p)).unwrap();
                assert_eq!(felts.len(), felts_per_bit_count(bit_count, m(p)));
                for &f in &felts {
                    assert!(f < p, "felt {f} out of range for p={p}");
                }
                let back = felts_to_bits(&felts, bit_count, m(p)).unwrap();
                assert_eq!(back, bytes, "p={p} bit_count={bit_count}");
            }
        }
    }

    #[test]
    fn sixteen_bit_chunks_under_65537() {
        // bitlen(65537) = 17, so exactly 16 data bits per felt and a 128-bit
        // item costs 8 felts.
        let modulus = m(65537);
        assert_eq!(bits_per_felt(modulus), 16);
        assert_eq!(felts_per_bit_count(128, modulus), 8);
        let bytes = [0xAB, 0xCD, 0x12, 0x34];
        let felts = bits_to_felts(&bytes, 32, modulus).unwrap();
        assert_eq!(felts, vec![0xCDAB, 0x3412]);
    }

    #[test]
    fn null_felt_is_unreachable_by_encoding() {
        for p in [3u64, 17, 65537] {
            let modulus = m(p);
            let max_chunk = (1u64 << bits_per_felt(modulus)) - 1;
            assert!(max_chunk < null_felt(modulus), "p={p}");
        }
    }

    #[test]
    fn failure_kinds() {
        assert_eq!(
            bits_to_felts(&[1], 8, Modulus::new(2).unwrap()).unwrap_err(),
            CodecError::InvalidModulus(2)
        );
        assert_eq!(
            felts_to_bits(&[], 8, m(17)).unwrap_err(),
            CodecError::EmptyInput { bit_count: 8 }
        );
        assert!(felts_to_bits(&[], 0, m(17)).unwrap().is_empty());
        assert_eq!(
            felts_to_bits(&[1], 64, m(17)).unwrap_err(),
            CodecError::NotEnoughFelts { got: 1, bit_count: 64 }
        );
    }
}
