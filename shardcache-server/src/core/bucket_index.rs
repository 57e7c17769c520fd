//! Active bucket bitset
//!
//! Tracks which bucket numbers currently hold bins. Resizing keeps every bit
//! that is still in range and drops the rest; the count before the last resize
//! is kept for diagnostics.

use super::error::{CacheError, Result};
use serde::Serialize;

/// Upper bound on bucket count accepted by a resize
pub const MAX_BUCKETS: usize = 1 << 20;

const WORD_BITS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketIndex {
    words: Vec<u64>,
    bit_count: usize,
    active_count: usize,
    previous_count: usize,
}

/// Serializable view of a bucket index
#[derive(Debug, Clone, Serialize)]
pub struct BucketIndexInfo {
    pub bit_count: usize,
    pub active_count: usize,
    pub previous_count: usize,
}

impl BucketIndex {
    pub fn new(bit_count: usize) -> Result<Self> {
        Self::validate(bit_count)?;
        Ok(Self {
            words: vec![0; bit_count.div_ceil(WORD_BITS)],
            bit_count,
            active_count: 0,
            previous_count: bit_count,
        })
    }

    fn validate(size: usize) -> Result<()> {
        if size == 0 || size > MAX_BUCKETS {
            return Err(CacheError::InvalidBucketCount(size));
        }
        Ok(())
    }

    #[inline]
    fn locate(bit: usize) -> (usize, u64) {
        (bit / WORD_BITS, 1u64 << (bit % WORD_BITS))
    }

    /// Mark bucket `bit` active; returns false when already active or out of range
    pub fn add(&mut self, bit: usize) -> bool {
        if bit >= self.bit_count {
            return false;
        }
        let (word, mask) = Self::locate(bit);
        if self.words[word] & mask != 0 {
            return false;
        }
        self.words[word] |= mask;
        self.active_count += 1;
        true
    }

    /// Mark bucket `bit` inactive; returns false when already inactive or out of range
    pub fn remove(&mut self, bit: usize) -> bool {
        if bit >= self.bit_count {
            return false;
        }
        let (word, mask) = Self::locate(bit);
        if self.words[word] & mask == 0 {
            return false;
        }
        self.words[word] &= !mask;
        self.active_count -= 1;
        true
    }

    pub fn get(&self, bit: usize) -> bool {
        if bit >= self.bit_count {
            return false;
        }
        let (word, mask) = Self::locate(bit);
        self.words[word] & mask != 0
    }

    /// Replace all bits with `other`'s, adopting its size
    pub fn set(&mut self, other: &BucketIndex) {
        if other.bit_count != self.bit_count {
            self.previous_count = self.bit_count;
        }
        self.words.clone_from(&other.words);
        self.bit_count = other.bit_count;
        self.active_count = other.active_count;
    }

    /// Change capacity, keeping bits below the new size
    pub fn resize(&mut self, new_size: usize) -> Result<()> {
        Self::validate(new_size)?;

        self.words.resize(new_size.div_ceil(WORD_BITS), 0);
        let tail = new_size % WORD_BITS;
        if tail != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << tail) - 1;
            }
        }

        self.previous_count = self.bit_count;
        self.bit_count = new_size;
        self.active_count = self.words.iter().map(|w| w.count_ones() as usize).sum();
        Ok(())
    }

    pub fn get_count_active(&self) -> usize {
        self.active_count
    }

    pub fn bit_count(&self) -> usize {
        self.bit_count
    }

    pub fn previous_count(&self) -> usize {
        self.previous_count
    }

    /// Indices of active buckets in ascending order
    pub fn iter_active(&self) -> impl Iterator<Item = usize> + '_ {
        self.words
            .iter()
            .enumerate()
            .flat_map(|(i, &word)| {
                (0..WORD_BITS)
                    .filter(move |b| word & (1u64 << b) != 0)
                    .map(move |b| i * WORD_BITS + b)
            })
    }

    pub fn info(&self) -> BucketIndexInfo {
        BucketIndexInfo {
            bit_count: self.bit_count,
            active_count: self.active_count,
            previous_count: self.previous_count,
        }
    }
}
