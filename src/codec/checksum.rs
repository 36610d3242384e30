//! Frame checksum.
//!
//! Two running accumulator bytes seeded to [`CHECKSUM_SEED`]; for every byte
//! `a += byte; b += a`, and the final value is `b - ((a + b) << 8)` truncated
//! to 16 bits. Both directions of the wire use the same function, so it must
//! stay bit-for-bit stable.

/// Initial value of both accumulators.
pub const CHECKSUM_SEED: u8 = 0x7E;

/// Compute the checksum of `data`.
pub fn checksum(data: &[u8]) -> u16 {
    let mut a = CHECKSUM_SEED;
    let mut b = CHECKSUM_SEED;

    for &byte in data {
        a = a.wrapping_add(byte);
        b = b.wrapping_add(a);
    }

    let sum = u16::from(a) + u16::from(b);
    u16::from(b).wrapping_sub(sum << 8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input() {
        // 0x7E - (0xFC << 8), wrapped to 16 bits
        assert_eq!(checksum(&[]), 0x047E);
    }

    #[test]
    fn test_known_sequence() {
        // a: 7F 81 84, b: FD 7E 02
        let expected = 0x02u16.wrapping_sub((0x84u16 + 0x02) << 8);
        assert_eq!(checksum(&[1, 2, 3]), expected);
    }

    #[test]
    fn test_deterministic() {
        let data: Vec<u8> = (0..=255u8).cycle().take(2000).collect();
        assert_eq!(checksum(&data), checksum(&data.clone()));
    }

    #[test]
    fn test_order_sensitive() {
        assert_ne!(checksum(&[1, 2, 3]), checksum(&[3, 2, 1]));

        // Swapping any two adjacent, distinct bytes changes one prefix sum
        // and therefore the second accumulator.
        let data: Vec<u8> = (0..64u32).map(|i| (i * 37 + 11) as u8).collect();
        let original = checksum(&data);
        for i in 0..data.len() - 1 {
            if data[i] == data[i + 1] {
                continue;
            }
            let mut swapped = data.clone();
            swapped.swap(i, i + 1);
            assert_ne!(checksum(&swapped), original, "swap at {i} went unnoticed");
        }
    }

    #[test]
    fn test_single_byte_change_detected() {
        let data = vec![0x55u8; 128];
        let original = checksum(&data);
        for i in 0..data.len() {
            let mut corrupted = data.clone();
            corrupted[i] ^= 0x01;
            assert_ne!(checksum(&corrupted), original);
        }
    }
}
