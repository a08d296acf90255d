//! Shard router and shard store: splits the term space across a fixed
//! number of independently-locked shards so concurrent workers can write to
//! disjoint shards without contention.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Default shard fan-out.
pub const DEFAULT_NUM_SHARDS: usize = 256;

/// Map a term hash to its shard id. `num_shards` must be a power of two;
/// routing is just the low bits of the hash — no secondary hashing, since
/// shard balance only needs to hold in expectation.
#[inline]
pub fn shard_id_for_hash(hash: u64, num_shards: usize) -> usize {
    debug_assert!(num_shards.is_power_of_two());
    (hash & (num_shards as u64 - 1)) as usize
}

/// Posting list for one term within one shard: two parallel arrays, not yet
/// sorted or deduplicated — both are deferred to the final merge.
#[derive(Debug, Default, Clone)]
pub struct PostingList {
    pub doc_ids: Vec<u32>,
    pub freqs: Vec<u16>,
}

impl PostingList {
    fn with_small_capacity() -> Self {
        Self {
            doc_ids: Vec::with_capacity(32),
            freqs: Vec::with_capacity(32),
        }
    }

    #[inline]
    pub fn push(&mut self, doc_id: u32, freq: u16) {
        self.doc_ids.push(doc_id);
        self.freqs.push(freq);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.doc_ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.doc_ids.is_empty()
    }
}

/// One shard's term dictionary: hash -> posting list. The store never sorts
/// or deduplicates during writes.
#[derive(Default)]
pub struct ShardMap {
    pub terms: FxHashMap<u64, PostingList>,
}

impl ShardMap {
    pub fn new() -> Self {
        Self {
            terms: FxHashMap::default(),
        }
    }

    /// Append one posting, allocating a new posting list with a small
    /// initial capacity (32) on first sight of the term.
    #[inline]
    pub fn add_posting(&mut self, hash: u64, doc_id: u32, freq: u16) {
        self.terms
            .entry(hash)
            .or_insert_with(PostingList::with_small_capacity)
            .push(doc_id, freq);
    }

    pub fn clear(&mut self) {
        self.terms.clear();
    }

    /// Rough estimate of live bytes held by this shard — used by the
    /// segmentation policy to decide when to flush.
    pub fn estimated_bytes(&self) -> usize {
        self.terms
            .iter()
            .map(|(_, pl)| pl.doc_ids.capacity() * 4 + pl.freqs.capacity() * 2 + 24)
            .sum::<usize>()
            + self.terms.len() * 24
    }
}

/// The full set of shards owned by the indexer: one [`Mutex`] per shard so
/// two workers can write to disjoint shards without contention, and a
/// single worker holds exactly one shard's lock at a time.
pub struct ShardStore {
    pub shards: Vec<Mutex<ShardMap>>,
}

impl ShardStore {
    pub fn new(num_shards: usize) -> Self {
        assert!(num_shards.is_power_of_two(), "num_shards must be a power of two");
        Self {
            shards: (0..num_shards).map(|_| Mutex::new(ShardMap::new())).collect(),
        }
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn estimated_bytes(&self) -> usize {
        self.shards.iter().map(|s| s.lock().estimated_bytes()).sum()
    }

    /// Replace every shard with a fresh, empty one and return the old
    /// shards — used when a segmentation trigger fires and the indexer
    /// swaps in empty storage for the next segment.
    pub fn take_and_reset(&self) -> Vec<ShardMap> {
        self.shards
            .iter()
            .map(|m| std::mem::take(&mut *m.lock()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_routing_is_stable_for_fixed_shard_count() {
        for h in [0u64, 1, 255, 256, 257, u64::MAX] {
            let a = shard_id_for_hash(h, 256);
            let b = shard_id_for_hash(h, 256);
            assert_eq!(a, b);
            assert!(a < 256);
        }
    }

    #[test]
    fn shard_routing_matches_low_bits() {
        assert_eq!(shard_id_for_hash(0b1_1111_1111, 256), 0b1111_1111);
        assert_eq!(shard_id_for_hash(0b1_0000_0000, 256), 0);
    }

    #[test]
    fn posting_list_append_order_preserved() {
        let mut map = ShardMap::new();
        map.add_posting(42, 0, 1);
        map.add_posting(42, 5, 2);
        let pl = &map.terms[&42];
        assert_eq!(pl.doc_ids, vec![0, 5]);
        assert_eq!(pl.freqs, vec![1, 2]);
    }
}
