// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integer hash used to spread chunks over nodes.

/// Bob Jenkins' 32-bit integer mixing function.
///
/// Node ownership of a chunk is `hash(chunk_id) % num_nodes`, so the output
/// must never change between releases.
pub fn hash(mut x: u32) -> u32 {
    x = x.wrapping_add(0x7ed5_5d16).wrapping_add(x << 12);
    x = (x ^ 0xc761_c23c) ^ (x >> 19);
    x = x.wrapping_add(0x1656_67b1).wrapping_add(x << 5);
    x = x.wrapping_add(0xd3a2_646c) ^ (x << 9);
    x = x.wrapping_add(0xfd70_46c5).wrapping_add(x << 3);
    x = (x ^ 0xb55a_4f09) ^ (x >> 16);
    x
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        for x in [0u32, 1, 2, 1000, 57_000, u32::MAX] {
            assert_eq!(hash(x), hash(x));
        }
    }

    #[test]
    fn test_hash_spreads_consecutive_ids() {
        let mut buckets = [0usize; 4];
        for x in 0u32..4000 {
            buckets[(hash(x) % 4) as usize] += 1;
        }
        for count in buckets {
            assert!(count > 800, "bucket too small: {buckets:?}");
        }
    }
}
