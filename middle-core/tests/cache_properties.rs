//! Property-based tests for the coordinate cache and pending sets.
//!
//! # Invariants tested
//!
//! - **Round trip:** the latest coordinate stored for an id is returned,
//!   whichever allocation strategy is used and whichever tier holds it.
//! - **Removal:** removed ids are not found in either tier.
//! - **Pending order:** draining yields each marked id once, ascending.

use std::collections::{BTreeMap, BTreeSet};

use middle_core::{
    AllocationStrategy, Coordinate, CoordinateCache, PendingSet, PersistentOverflowCache,
    PrimitiveId,
};
use proptest::prelude::*;

/// Bytes reserved by one chunk of the chunked and combined strategies.
const CHUNK_BYTES: usize = 65_536;

/// A strategy paired with a RAM budget on the scale of its allocation unit,
/// so chunk-based strategies hold some chunks in RAM and spill the rest.
fn budgeted_strategy() -> impl Strategy<Value = (AllocationStrategy, usize)> {
    prop_oneof![
        (Just(AllocationStrategy::Dense), 0_usize..8_192),
        (Just(AllocationStrategy::Sparse), 0_usize..8_192),
        (Just(AllocationStrategy::Chunked), 0_usize..=3 * CHUNK_BYTES),
        (Just(AllocationStrategy::Combined), 0_usize..=3 * CHUNK_BYTES),
    ]
}

fn coordinate() -> impl Strategy<Value = Coordinate> {
    (-1_800_000_000_i32..=1_800_000_000, -900_000_000_i32..=900_000_000)
        .prop_map(|(x, y)| Coordinate::from_fixed(x, y).expect("generated inside range"))
}

/// Consecutive ids that fill one chunk past the combined promotion point.
fn filled_chunk() -> impl Strategy<Value = Vec<(PrimitiveId, Coordinate)>> {
    (0_i64..4, 2_800_i64..3_200, coordinate()).prop_map(|(base, len, coordinate)| {
        (0..len)
            .map(|offset| (base * 1_000_000 + offset, coordinate))
            .collect()
    })
}

/// Writes clustered around a few bases so dense chunks fill up, plus
/// stragglers anywhere in the id space. Most cases start with a filled chunk.
fn writes() -> impl Strategy<Value = Vec<(PrimitiveId, Coordinate)>> {
    let clustered = (0_i64..4, 0_i64..5_000).prop_map(|(base, offset)| base * 1_000_000 + offset);
    let id = prop_oneof![3 => clustered, 1 => any::<i64>()];
    let scattered = prop::collection::vec((id, coordinate()), 1..400);
    (prop::option::weighted(0.75, filled_chunk()), scattered).prop_map(|(block, scattered)| {
        block.into_iter().flatten().chain(scattered).collect()
    })
}

fn cache(strategy: AllocationStrategy, budget: usize) -> CoordinateCache {
    let overflow = PersistentOverflowCache::anonymous().expect("anonymous overflow file");
    CoordinateCache::new(strategy, budget, overflow)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: every id returns its latest coordinate, including ids that
    /// spilled past the RAM budget.
    #[test]
    fn latest_put_wins(
        (strategy, budget) in budgeted_strategy(),
        writes in writes(),
    ) {
        let mut cache = cache(strategy, budget);
        let mut expected = BTreeMap::new();
        for (id, coordinate) in &writes {
            cache.put(*id, *coordinate).expect("put");
            expected.insert(*id, *coordinate);
        }
        for (id, coordinate) in &expected {
            prop_assert_eq!(cache.get(*id).expect("get"), Some(*coordinate));
        }
    }

    /// Property: removed ids are gone from both tiers and the rest survive.
    #[test]
    fn removed_ids_are_not_found(
        (strategy, budget) in budgeted_strategy(),
        writes in writes(),
        stride in 2_usize..5,
    ) {
        let mut cache = cache(strategy, budget);
        let mut expected = BTreeMap::new();
        for (id, coordinate) in &writes {
            cache.put(*id, *coordinate).expect("put");
            expected.insert(*id, *coordinate);
        }
        let removed: BTreeSet<_> = expected.keys().copied().step_by(stride).collect();
        for id in &removed {
            prop_assert!(cache.remove(*id).expect("remove"));
        }
        for (id, coordinate) in &expected {
            let found = cache.get(*id).expect("get");
            if removed.contains(id) {
                prop_assert_eq!(found, None);
            } else {
                prop_assert_eq!(found, Some(*coordinate));
            }
        }
    }

    /// Property: draining yields each distinct id once, strictly ascending.
    #[test]
    fn pending_sets_drain_ascending(ids in prop::collection::vec(any::<i64>(), 0..500)) {
        let mut set = PendingSet::default();
        for id in &ids {
            set.insert(*id);
            set.insert(*id);
        }
        let expected: Vec<_> = ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        prop_assert_eq!(set.len(), expected.len());
        prop_assert_eq!(set.drain(), expected);
        prop_assert!(set.is_empty());
    }
}
