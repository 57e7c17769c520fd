//! Key fingerprints
//!
//! A fingerprint is the routing identity of a raw key: the owned key bytes plus
//! a 64-bit hash computed once when the key is set. The hash is an FNV-1a
//! accumulator followed by the murmur3 64-bit finalizer; FNV alone leaves bits
//! 32..40 untouched by the last key byte, which collapses bucket spread for
//! keys like `key:1`, `key:2`. The hash is split into three routing coordinates:
//!
//! ```text
//!   hash (64 bits)
//!   ├─ high 32 ──────────────► bucket_index = |high|
//!   ├─ low 32  ──────────────► bin_index    = |low|
//!   └─ low + high (wrapping) ► map_slot     = |low + high|
//! ```
//!
//! Equality always compares the raw bytes, never the hash.

use std::fmt;
use std::hash::{Hash, Hasher};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a over a byte sequence. Stable across processes.
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Murmur3 `fmix64` avalanche step
#[inline]
pub fn mix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

/// Fingerprint hash of a raw key
#[inline]
pub fn key_hash(bytes: &[u8]) -> u64 {
    mix64(fnv1a_64(bytes))
}

/// Routing identity of a raw key
#[derive(Clone, Default)]
pub struct KeyFingerprint {
    bytes: Vec<u8>,
    hash: u64,
}

impl KeyFingerprint {
    /// Create a fingerprint owning a copy of `key`
    pub fn new(key: &[u8]) -> Self {
        let mut fingerprint = Self::default();
        fingerprint.set_key_bytes(key);
        fingerprint
    }

    /// Replace the key, reusing the existing buffer, and recompute the hash
    pub fn set_key_bytes(&mut self, key: &[u8]) {
        self.bytes.clear();
        self.bytes.extend_from_slice(key);
        self.hash = key_hash(&self.bytes);
    }

    /// Clear the key so the fingerprint can be handed out again
    pub fn reset(&mut self) {
        self.bytes.clear();
        self.hash = 0;
    }

    /// Release key buffer capacity above `limit` bytes
    pub fn shrink_to(&mut self, limit: usize) {
        self.bytes.shrink_to(limit);
    }

    /// Allocated size of the key buffer
    pub fn key_capacity(&self) -> usize {
        self.bytes.capacity()
    }

    pub fn key_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn hash_value(&self) -> u64 {
        self.hash
    }

    #[inline]
    fn low(&self) -> u32 {
        self.hash as u32
    }

    #[inline]
    fn high(&self) -> u32 {
        (self.hash >> 32) as u32
    }

    /// Coarse shard coordinate, taken from the high half of the hash
    #[inline]
    pub fn bucket_index(&self) -> u32 {
        (self.high() as i32).unsigned_abs()
    }

    /// Bin coordinate within a bucket, taken from the low half of the hash
    #[inline]
    pub fn bin_index(&self) -> u32 {
        (self.low() as i32).unsigned_abs()
    }

    /// Slot coordinate inside a bin's map, mixing both halves
    #[inline]
    pub fn map_slot(&self) -> u32 {
        (self.low().wrapping_add(self.high()) as i32).unsigned_abs()
    }

    /// An owned copy suitable for storing inside a value slot
    pub fn to_owned_copy(&self) -> Self {
        Self {
            bytes: self.bytes.clone(),
            hash: self.hash,
        }
    }
}

impl PartialEq for KeyFingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.bytes == other.bytes
    }
}

impl Eq for KeyFingerprint {}

impl Hash for KeyFingerprint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.map_slot());
    }
}

impl fmt::Debug for KeyFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyFingerprint")
            .field("key", &String::from_utf8_lossy(&self.bytes))
            .field("hash", &format_args!("{:#018x}", self.hash))
            .finish()
    }
}
