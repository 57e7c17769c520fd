use super::fingerprint::KeyFingerprint;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};

/// Key buffers larger than this are trimmed before they are parked
pub const MAX_POOLED_KEY_BYTES: usize = 1024;

/// Bounded free-list of request fingerprints.
///
/// Fingerprints are handed out as [`PooledFingerprint`] guards, reset and
/// returned on drop. When the free-list is full a released fingerprint is
/// simply dropped. Parked buffers hold at most [`MAX_POOLED_KEY_BYTES`].
pub struct FingerprintPool {
    free: Mutex<Vec<KeyFingerprint>>,
    capacity: usize,
}

impl FingerprintPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Take a fingerprint, allocating when the free-list is empty
    pub fn acquire(&self) -> PooledFingerprint<'_> {
        let fingerprint = self.free.lock().pop().unwrap_or_default();
        PooledFingerprint {
            pool: self,
            fingerprint: Some(fingerprint),
        }
    }

    /// Take a fingerprint already set to `key`
    pub fn acquire_for(&self, key: &[u8]) -> PooledFingerprint<'_> {
        let mut fingerprint = self.acquire();
        fingerprint.set_key_bytes(key);
        fingerprint
    }

    /// Fingerprints currently parked in the free-list
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn release(&self, mut fingerprint: KeyFingerprint) {
        fingerprint.reset();
        if fingerprint.key_capacity() > MAX_POOLED_KEY_BYTES {
            fingerprint.shrink_to(MAX_POOLED_KEY_BYTES);
        }
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(fingerprint);
        }
    }
}

impl Default for FingerprintPool {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Scoped ownership of a pooled fingerprint
pub struct PooledFingerprint<'a> {
    pool: &'a FingerprintPool,
    fingerprint: Option<KeyFingerprint>,
}

impl Deref for PooledFingerprint<'_> {
    type Target = KeyFingerprint;

    fn deref(&self) -> &KeyFingerprint {
        self.fingerprint
            .as_ref()
            .unwrap_or_else(|| unreachable!("fingerprint taken before drop"))
    }
}

impl DerefMut for PooledFingerprint<'_> {
    fn deref_mut(&mut self) -> &mut KeyFingerprint {
        self.fingerprint
            .as_mut()
            .unwrap_or_else(|| unreachable!("fingerprint taken before drop"))
    }
}

impl Drop for PooledFingerprint<'_> {
    fn drop(&mut self) {
        if let Some(fingerprint) = self.fingerprint.take() {
            self.pool.release(fingerprint);
        }
    }
}
