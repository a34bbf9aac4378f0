//! Content-addressed handle identity.
//!
//! A filesystem node is identified by the pair of 64-bit name hashes
//! `(bucket, object)`. Equal keys mean the same node; the handle index
//! refuses to admit two handles with the same key. The hash is a seeded
//! xxh64 — not cryptographic, just uniform enough that collisions at cache
//! scale are negligible, and any that do occur surface as a spurious hit
//! that the cold-lookup verification catches.

use xxhash_rust::xxh64::xxh64;

/// Fixed seed for all name hashing. Changing it invalidates every cookie
/// and handle key ever handed out, so don't.
pub const NAME_HASH_SEED: u64 = 8675309;

/// Hash a UTF-8 name with the crate-wide seed.
#[must_use]
pub fn name_hash(name: &str) -> u64 {
    xxh64(name.as_bytes(), NAME_HASH_SEED)
}

/// 128-bit handle key: `(bucket_hash, object_hash)`.
///
/// Ordered lexicographically by `(bucket, object)`; this is the order the
/// index partitions sort by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FhKey {
    pub bucket: u64,
    pub object: u64,
}

impl FhKey {
    /// Key from already-computed hashes (e.g. an opaque handle from a
    /// previous lookup).
    #[must_use]
    pub fn from_hashes(bucket: u64, object: u64) -> Self {
        Self { bucket, object }
    }

    /// Key for `object_path` inside the named bucket.
    #[must_use]
    pub fn new(bucket_name: &str, object_path: &str) -> Self {
        Self {
            bucket: name_hash(bucket_name),
            object: name_hash(object_path),
        }
    }

    /// Key for a child below a node whose object hash is already known.
    #[must_use]
    pub fn for_child(parent_object_hash: u64, object_path: &str) -> Self {
        Self {
            bucket: parent_object_hash,
            object: name_hash(object_path),
        }
    }
}
