//! Ordered sets of way and relation ids awaiting reprocessing.
//!
//! Ids are stored in a bitmap split into fixed blocks kept in a `BTreeMap`,
//! so millions of clustered ids cost a bit each while isolated ids only pay
//! for one block. Draining walks the blocks in key order, which yields ids in
//! ascending order without a sort.

use std::collections::BTreeMap;

use crate::model::PrimitiveId;

const WORD_BITS: i64 = 64;
const BLOCK_WORDS: usize = 64;
const BLOCK_BITS: i64 = WORD_BITS * 64;

type Block = [u64; BLOCK_WORDS];

#[expect(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "rem_euclid keeps the offset in 0..BLOCK_BITS"
)]
const fn split(id: PrimitiveId) -> (i64, usize, u32) {
    let block = id.div_euclid(BLOCK_BITS);
    let offset = id.rem_euclid(BLOCK_BITS);
    (block, (offset / WORD_BITS) as usize, (offset % WORD_BITS) as u32)
}

#[expect(
    clippy::cast_possible_wrap,
    clippy::cast_possible_truncation,
    reason = "word indices stay below BLOCK_WORDS"
)]
const fn id_at(block: i64, word: usize, bit: u32) -> PrimitiveId {
    block * BLOCK_BITS + (word as i64) * WORD_BITS + bit as i64
}

/// A set of ids with ascending, consuming iteration.
///
/// # Examples
/// ```
/// use middle_core::PendingSet;
///
/// let mut set = PendingSet::default();
/// set.insert(42);
/// set.insert(-7);
/// set.insert(42);
/// assert_eq!(set.len(), 2);
/// assert_eq!(set.drain(), vec![-7, 42]);
/// assert!(set.is_empty());
/// ```
#[derive(Debug, Clone, Default)]
pub struct PendingSet {
    blocks: BTreeMap<i64, Box<Block>>,
    len: usize,
}

impl PendingSet {
    /// Add `id`. Returns `false` when it was already present.
    pub fn insert(&mut self, id: PrimitiveId) -> bool {
        let (block, word, bit) = split(id);
        let words = self
            .blocks
            .entry(block)
            .or_insert_with(|| Box::new([0; BLOCK_WORDS]));
        let Some(slot) = words.get_mut(word) else {
            return false;
        };
        let mask = 1_u64 << bit;
        if *slot & mask != 0 {
            return false;
        }
        *slot |= mask;
        self.len += 1;
        true
    }

    /// Whether `id` is pending.
    pub fn contains(&self, id: PrimitiveId) -> bool {
        let (block, word, bit) = split(id);
        self.blocks
            .get(&block)
            .and_then(|words| words.get(word))
            .is_some_and(|slot| slot & (1_u64 << bit) != 0)
    }

    /// Number of pending ids.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether no ids are pending.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Remove and return the smallest pending id.
    pub fn pop_first(&mut self) -> Option<PrimitiveId> {
        loop {
            let mut entry = self.blocks.first_entry()?;
            let block = *entry.key();
            let words = entry.get_mut();
            let Some(word) = words.iter().position(|slot| *slot != 0) else {
                entry.remove();
                continue;
            };
            let Some(slot) = words.get_mut(word) else {
                entry.remove();
                continue;
            };
            let bit = slot.trailing_zeros();
            *slot &= !(1_u64 << bit);
            self.len -= 1;
            return Some(id_at(block, word, bit));
        }
    }

    /// Remove every id, returning them in ascending order.
    pub fn drain(&mut self) -> Vec<PrimitiveId> {
        let mut ids = Vec::with_capacity(self.len);
        for (block, words) in std::mem::take(&mut self.blocks) {
            for (word, mut slot) in words.iter().copied().enumerate() {
                while slot != 0 {
                    let bit = slot.trailing_zeros();
                    slot &= slot - 1;
                    ids.push(id_at(block, word, bit));
                }
            }
        }
        self.len = 0;
        ids
    }
}

/// Ways and relations marked for reprocessing after a referenced primitive
/// changed.
///
/// The two sets live in independent id spaces. Marking is idempotent.
#[derive(Debug, Clone, Default)]
pub struct PendingTracker {
    ways: PendingSet,
    relations: PendingSet,
}

impl PendingTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue way `id` for reprocessing.
    pub fn mark_way(&mut self, id: PrimitiveId) -> bool {
        self.ways.insert(id)
    }

    /// Queue relation `id` for reprocessing.
    pub fn mark_relation(&mut self, id: PrimitiveId) -> bool {
        self.relations.insert(id)
    }

    /// Whether way `id` is queued.
    pub fn is_way_pending(&self, id: PrimitiveId) -> bool {
        self.ways.contains(id)
    }

    /// Whether relation `id` is queued.
    pub fn is_relation_pending(&self, id: PrimitiveId) -> bool {
        self.relations.contains(id)
    }

    /// Take every pending way id, lowest first.
    pub fn drain_ways(&mut self) -> Vec<PrimitiveId> {
        self.ways.drain()
    }

    /// Take every pending relation id, lowest first.
    pub fn drain_relations(&mut self) -> Vec<PrimitiveId> {
        self.relations.drain()
    }

    /// Take the lowest pending way id.
    pub fn next_way(&mut self) -> Option<PrimitiveId> {
        self.ways.pop_first()
    }

    /// Take the lowest pending relation id.
    pub fn next_relation(&mut self) -> Option<PrimitiveId> {
        self.relations.pop_first()
    }

    /// `(way_count, relation_count)`.
    pub const fn pending_count(&self) -> (usize, usize) {
        (self.ways.len(), self.relations.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn marking_twice_yields_one_entry() {
        let mut tracker = PendingTracker::new();
        assert!(tracker.mark_way(5));
        assert!(!tracker.mark_way(5));
        assert_eq!(tracker.pending_count(), (1, 0));
        assert_eq!(tracker.drain_ways(), vec![5]);
        assert_eq!(tracker.pending_count(), (0, 0));
    }

    #[rstest]
    fn ways_and_relations_are_independent() {
        let mut tracker = PendingTracker::new();
        tracker.mark_way(10);
        tracker.mark_relation(10);
        tracker.mark_relation(3);
        assert_eq!(tracker.pending_count(), (1, 2));
        assert!(tracker.is_way_pending(10));
        assert!(!tracker.is_way_pending(3));
        assert_eq!(tracker.drain_relations(), vec![3, 10]);
        assert_eq!(tracker.pending_count(), (1, 0));
    }

    #[rstest]
    #[case(vec![9, 1, 5_000_000_000, -3, 4096, 4095, -4097])]
    #[case(vec![i64::MAX, i64::MIN, 0])]
    fn drain_returns_strictly_ascending_ids(#[case] ids: Vec<i64>) {
        let mut set = PendingSet::default();
        for id in &ids {
            set.insert(*id);
        }
        let mut expected = ids.clone();
        expected.sort_unstable();
        assert_eq!(set.drain(), expected);
        assert!(set.is_empty());
    }

    #[rstest]
    fn pop_first_walks_in_order_and_releases_blocks() {
        let mut set = PendingSet::default();
        for id in [70_000, 2, 64, -1] {
            set.insert(id);
        }
        let popped: Vec<_> = std::iter::from_fn(|| set.pop_first()).collect();
        assert_eq!(popped, vec![-1, 2, 64, 70_000]);
        assert!(set.is_empty());
        assert!(set.blocks.is_empty());
    }
}
