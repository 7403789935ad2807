//! Bounded "already relayed" sets for transactions and blocks.

use lru::LruCache;
use std::num::NonZeroUsize;

/// BLAKE3 digest of a payload, used as its identity in the seen caches.
pub type Fingerprint = [u8; 32];

pub const TXN_CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(100) {
    Some(n) => n,
    None => unreachable!(),
};
pub const BLOCK_CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(10) {
    Some(n) => n,
    None => unreachable!(),
};

pub fn fingerprint(payload: &[u8]) -> Fingerprint {
    *blake3::hash(payload).as_bytes()
}

/// Which of the two fingerprint spaces a lookup targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeenCache {
    Transactions,
    Blocks,
}

/// Fixed-capacity recency-ordered set. Inserting past capacity evicts the
/// least recently inserted (or refreshed) fingerprint.
pub struct DedupCache {
    entries: LruCache<Fingerprint, ()>,
}

impl DedupCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self { entries: LruCache::new(capacity) }
    }

    /// Marks `fp` as most recent. Returns `true` if it was not present.
    pub fn insert(&mut self, fp: Fingerprint) -> bool {
        self.entries.put(fp, ()).is_none()
    }

    /// Membership test; does not touch recency.
    pub fn contains(&self, fp: &Fingerprint) -> bool {
        self.entries.contains(fp)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.entries.cap().get()
    }
}
