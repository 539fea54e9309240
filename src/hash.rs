//! Stable key hashing for bucket mapping.
//!
//! The bucket a key lands in is baked into the files, so the mapping
//! must be identical across platforms, toolchains, and releases: keys
//! are hashed with an explicit xxhash64 at a fixed seed, never with
//! std's DefaultHasher.

use std::hash::Hasher;
use twox_hash::XxHash64;

/// Seed of the on-disk bucket mapping. Changing it orphans every
/// existing database.
pub const HASH_SEED: u64 = 42;

/// 64-bit stable hash of a key.
pub fn hash64(key: &str) -> u64 {
    let mut h = XxHash64::with_seed(HASH_SEED);
    h.write(key.as_bytes());
    h.finish()
}

/// Bucket for the fixed-size table.
#[inline]
pub fn static_bucket(key: &str, nbuckets: u64) -> u64 {
    debug_assert!(nbuckets > 0);
    hash64(key) % nbuckets
}

/// Two-level bucket for the linear-hashing table: take the low `depth`
/// bits of the hash; values that name a bucket not created yet fold
/// back onto its split partner one level down.
#[inline]
pub fn linear_bucket(key: &str, nbuckets: u64, depth: u32) -> u64 {
    let b = hash64(key) & ((1u64 << depth) - 1);
    if b < nbuckets {
        b
    } else {
        b ^ (1u64 << (depth - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_is_deterministic() {
        assert_eq!(hash64("k1"), hash64("k1"));
        assert_eq!(static_bucket("k1", 137), static_bucket("k1", 137));
        assert!(static_bucket("k1", 137) < 137);
    }

    #[test]
    fn linear_bucket_stays_in_range() {
        for depth in 1..8u32 {
            let full = 1u64 << depth;
            for nbuckets in (full / 2 + 1)..=full {
                for i in 0..200 {
                    let key = format!("key_{i}");
                    let b = linear_bucket(&key, nbuckets, depth);
                    assert!(b < nbuckets, "bucket {b} out of range 0..{nbuckets}");
                }
            }
        }
    }

    #[test]
    fn folded_keys_pair_with_their_split_partner() {
        // with a partially grown table, a key either sits in its full-
        // depth bucket or in that bucket folded one level down
        let depth = 4u32;
        let nbuckets = 11u64;
        for i in 0..200 {
            let key = format!("key_{i}");
            let full = hash64(&key) & ((1 << depth) - 1);
            let b = linear_bucket(&key, nbuckets, depth);
            assert!(b == full || b == full ^ (1 << (depth - 1)));
        }
    }

    #[test]
    fn power_of_two_table_uses_all_bits() {
        for i in 0..200 {
            let key = format!("key_{i}");
            assert_eq!(linear_bucket(&key, 16, 4), hash64(&key) & 0xF);
        }
    }
}
