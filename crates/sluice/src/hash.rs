/// Produces a deterministic 64-bit hash for any byte slice.
///
/// Stable across processes and releases; used to derive advisory lock ids
/// from names, so every node computes the same id for the same name.
pub fn djb2_hash64(bytes: &[u8]) -> u64 {
    djb2_hash64_with_seed(5381, bytes)
}

/// Produces a deterministic 64-bit hash seeded with the provided value.
pub fn djb2_hash64_with_seed(seed: u64, bytes: &[u8]) -> u64 {
    let mut hash = seed;
    for &b in bytes {
        hash = hash.wrapping_mul(33).wrapping_add(b as u64);
    }
    hash
}

/// Advisory lock id for an arbitrary name.
///
/// Convenience for periodic application tasks that coordinate through
/// [`LockManager`](crate::lock::LockManager) and want a readable key.
pub fn lock_id_for(name: &str) -> i64 {
    djb2_hash64(name.as_bytes()) as i64
}
