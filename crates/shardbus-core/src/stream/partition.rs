//! Key → shard mapping used by publishers
//!
//! A 32-bit linear congruential hash over the key bytes. Every publisher of a
//! channel must use the same shard count, or keys land on different streams.

const MULTIPLIER: u32 = 498_975_571;
const INCREMENT: u32 = 548_897_941;

/// Shard for `key` among `shards` partitions
pub fn partition_for(key: &str, shards: u32) -> u32 {
    let hash = key.bytes().fold(0u32, |acc, byte| {
        u32::from(byte)
            .wrapping_add(acc.wrapping_mul(MULTIPLIER))
            .wrapping_add(INCREMENT)
    });
    hash % shards.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_is_stable() {
        assert_eq!(partition_for("user-42", 16), partition_for("user-42", 16));
        assert_eq!(partition_for("", 16), 0);
    }

    #[test]
    fn test_partition_in_range() {
        for shards in [1, 3, 16, 32] {
            for i in 0..500 {
                assert!(partition_for(&format!("key-{}", i), shards) < shards);
            }
        }
    }

    #[test]
    fn test_partition_spreads_keys() {
        let mut counts = [0usize; 16];
        for i in 0..16_000 {
            counts[partition_for(&i.to_string(), 16) as usize] += 1;
        }
        // Every shard gets a reasonable share of the keys
        assert!(counts.iter().all(|&c| c > 400), "{:?}", counts);
    }

    #[test]
    fn test_known_value() {
        // 'a' = 97: (97 + 0 * M + I) mod 2^32
        assert_eq!(partition_for("a", u32::MAX), (97 + INCREMENT) % u32::MAX);
    }
}
