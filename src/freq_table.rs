//! Fixed-capacity open-addressed per-document frequency table.
//!
//! Reused across documents by a single worker: `reset()` is O(used), not
//! O(capacity), so steady-state indexing never pays for the table's full
//! size on every document.

/// Default capacity: at least twice the expected distinct-token count per
/// document.
pub const DEFAULT_CAPACITY: usize = 4096;

struct Slot {
    key: u64,
    count: u16,
}

/// Bounded, open-addressed hash→count map for one document's token
/// frequencies. Capacity is fixed at construction and must be a power of
/// two; load factor stays at or below 0.5 by sizing convention.
pub struct FreqTable {
    slots: Vec<Slot>,
    mask: u64,
    used_slots: Vec<u32>,
    dropped: u64,
}

impl FreqTable {
    /// `capacity` is rounded up to the next power of two if it isn't one
    /// already.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        Self {
            slots: (0..capacity).map(|_| Slot { key: 0, count: 0 }).collect(),
            mask: (capacity - 1) as u64,
            used_slots: Vec::with_capacity(capacity / 2),
            dropped: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of distinct keys currently held.
    #[inline]
    pub fn len(&self) -> usize {
        self.used_slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used_slots.is_empty()
    }

    /// Tokens silently dropped because their probe sequence never found an
    /// empty or matching slot within `capacity` attempts. Never surfaced as
    /// an error; exposed here purely for diagnostics.
    #[inline]
    pub fn dropped_tokens(&self) -> u64 {
        self.dropped
    }

    /// Clear only the slots that were actually touched since the last
    /// reset — O(used), never O(capacity).
    pub fn reset(&mut self) {
        for &idx in &self.used_slots {
            let slot = &mut self.slots[idx as usize];
            slot.key = 0;
            slot.count = 0;
        }
        self.used_slots.clear();
        self.dropped = 0;
    }

    /// Insert or bump the count for `hash` (already rewritten away from 0 by
    /// the caller via [`crate::hash::nonzero_hash`]). Saturating add;
    /// silent drop after `capacity` probes.
    #[inline]
    pub fn insert(&mut self, hash: u64) {
        debug_assert_ne!(hash, 0, "caller must substitute 0 -> 1 before inserting");
        let cap = self.slots.len() as u64;
        let mut idx = hash & self.mask;
        for _ in 0..cap {
            let slot = &mut self.slots[idx as usize];
            if slot.key == 0 {
                slot.key = hash;
                slot.count = 1;
                self.used_slots.push(idx as u32);
                return;
            }
            if slot.key == hash {
                slot.count = slot.count.saturating_add(1);
                return;
            }
            idx = (idx + 1) & self.mask;
        }
        self.dropped += 1;
    }

    /// Visit exactly the used slots as `(hash, count)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u16)> + '_ {
        self.used_slots
            .iter()
            .map(move |&idx| {
                let slot = &self.slots[idx as usize];
                (slot.key, slot.count)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn reset_then_replay_matches_fresh_table() {
        let inserts = [1u64, 2, 1, 3, 2, 2, 4];

        let mut fresh = FreqTable::new(16);
        for &h in &inserts {
            fresh.insert(h);
        }
        let fresh_map: HashMap<u64, u16> = fresh.iter().collect();

        let mut reused = FreqTable::new(16);
        reused.insert(999);
        reused.insert(998);
        reused.reset();
        for &h in &inserts {
            reused.insert(h);
        }
        let reused_map: HashMap<u64, u16> = reused.iter().collect();

        assert_eq!(fresh_map, reused_map);
    }

    #[test]
    fn invariant_used_slots_match_nonzero_keys() {
        let mut t = FreqTable::new(8);
        for h in [10u64, 20, 30, 10, 40] {
            t.insert(h);
        }
        assert_eq!(t.len(), 4);
        for (h, c) in t.iter() {
            assert_ne!(h, 0);
            assert!(c >= 1);
        }
    }

    #[test]
    fn saturating_count() {
        let mut t = FreqTable::new(4);
        for _ in 0..u16::MAX as u32 + 10 {
            t.insert(5);
        }
        let (_, count) = t.iter().next().unwrap();
        assert_eq!(count, u16::MAX);
    }

    #[test]
    fn drops_silently_past_capacity() {
        let mut t = FreqTable::new(4); // 4 slots
        // Fill all 4 slots with distinct keys that all map into the table.
        for h in [1u64, 2, 3, 4] {
            t.insert(h);
        }
        assert_eq!(t.len(), 4);
        // A 5th distinct key cannot find a home; must drop, not loop forever.
        t.insert(5);
        assert_eq!(t.len(), 4);
        assert_eq!(t.dropped_tokens(), 1);
    }
}
