use std::io::Write;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::chunked::{CHUNK_BYTES, CHUNK_SLOTS};
use super::combined::PROMOTION_THRESHOLD;
use super::sparse::SPARSE_ENTRY_BYTES;
use super::*;

fn coord(seed: i64) -> Coordinate {
    let x = i32::try_from(seed % 1_000_000).expect("fits i32");
    Coordinate::from_fixed(x, -x).expect("valid coordinate")
}

#[fixture]
fn temp_dir() -> TempDir {
    TempDir::new().expect("create temp dir")
}

fn overflow_path(dir: &TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().join("nodes.cache")).expect("utf-8 path")
}

#[rstest]
#[case(AllocationStrategy::Dense)]
#[case(AllocationStrategy::Sparse)]
#[case(AllocationStrategy::Chunked)]
#[case(AllocationStrategy::Combined)]
fn ram_strategies_round_trip(#[case] strategy: AllocationStrategy) {
    let mut ram = RamCache::new(strategy, 4 * CHUNK_BYTES);
    for id in 100..200 {
        assert_eq!(ram.put(id, coord(id)), Placement::Stored, "put {id}");
    }
    for id in 100..200 {
        assert_eq!(ram.get(id), Some(coord(id)), "get {id}");
    }
    assert_eq!(ram.len(), 100);
    assert!(ram.remove(150));
    assert!(!ram.remove(150));
    assert_eq!(ram.get(150), None);
    assert_eq!(ram.len(), 99);
    assert_eq!(ram.strategy(), strategy);
}

#[rstest]
#[case(AllocationStrategy::Dense)]
#[case(AllocationStrategy::Sparse)]
#[case(AllocationStrategy::Chunked)]
#[case(AllocationStrategy::Combined)]
fn replacing_a_value_keeps_a_single_entry(#[case] strategy: AllocationStrategy) {
    let mut ram = RamCache::new(strategy, 4 * CHUNK_BYTES);
    assert_eq!(ram.put(7, coord(1)), Placement::Stored);
    assert_eq!(ram.put(7, coord(2)), Placement::Stored);
    assert_eq!(ram.get(7), Some(coord(2)));
    assert_eq!(ram.len(), 1);
}

#[rstest]
fn dense_rejects_ids_below_base_and_past_budget() {
    let mut dense = DenseCache::new(16 * size_of::<Coordinate>());
    assert_eq!(dense.put(10, coord(10)), Placement::Stored);
    assert_eq!(dense.put(9, coord(9)), Placement::OverBudget);
    assert_eq!(dense.put(25, coord(25)), Placement::Stored);
    assert_eq!(dense.put(26, coord(26)), Placement::OverBudget);
    assert!(dense.used_bytes() <= 16 * size_of::<Coordinate>());
}

#[rstest]
fn sparse_charges_per_entry() {
    let mut sparse = SparseCache::new(2 * SPARSE_ENTRY_BYTES);
    assert_eq!(sparse.put(1_000_000_000, coord(1)), Placement::Stored);
    assert_eq!(sparse.put(-5, coord(2)), Placement::Stored);
    assert_eq!(sparse.put(3, coord(3)), Placement::OverBudget);
    assert_eq!(sparse.put(-5, coord(4)), Placement::Stored, "updates are free");
    assert_eq!(sparse.used_bytes(), 2 * SPARSE_ENTRY_BYTES);
}

#[rstest]
fn chunked_allocates_only_touched_chunks() {
    let mut chunked = ChunkedCache::new(2 * CHUNK_BYTES);
    let far = 1_i64 << 40;
    assert_eq!(chunked.put(1, coord(1)), Placement::Stored);
    assert_eq!(chunked.put(far, coord(2)), Placement::Stored);
    assert_eq!(chunked.used_bytes(), 2 * CHUNK_BYTES);
    assert_eq!(chunked.put(far * 2, coord(3)), Placement::OverBudget);
    assert_eq!(chunked.put(2, coord(4)), Placement::Stored, "existing chunk");
}

#[rstest]
fn chunked_orders_negative_ids_into_their_own_chunks() {
    let mut chunked = ChunkedCache::new(2 * CHUNK_BYTES);
    assert_eq!(chunked.put(-1, coord(1)), Placement::Stored);
    assert_eq!(chunked.put(0, coord(2)), Placement::Stored);
    assert_eq!(chunked.get(-1), Some(coord(1)));
    assert_eq!(chunked.get(0), Some(coord(2)));
    assert_eq!(chunked.used_bytes(), 2 * CHUNK_BYTES);
}

#[rstest]
fn combined_promotes_a_well_filled_chunk() {
    let mut combined = CombinedCache::new(2 * CHUNK_BYTES);
    let threshold = i64::try_from(PROMOTION_THRESHOLD).expect("fits i64");
    for id in 0..threshold - 1 {
        assert_eq!(combined.put(id, coord(id)), Placement::Stored);
    }
    assert_eq!(combined.dense_chunks(), 0, "still sparse below threshold");

    assert_eq!(combined.put(threshold, coord(threshold)), Placement::Stored);
    assert_eq!(combined.dense_chunks(), 1, "promoted at threshold");
    for id in (0..threshold - 1).chain(std::iter::once(threshold)) {
        assert_eq!(combined.get(id), Some(coord(id)), "migrated {id}");
    }
    assert_eq!(combined.len(), PROMOTION_THRESHOLD);
    assert_eq!(combined.used_bytes(), CHUNK_BYTES);
}

#[rstest]
fn combined_promotion_at_an_exact_budget_keeps_every_entry() {
    let mut combined = CombinedCache::new(CHUNK_BYTES);
    let threshold = i64::try_from(PROMOTION_THRESHOLD).expect("fits i64");
    for id in 0..threshold {
        assert_eq!(combined.put(id, coord(id)), Placement::Stored, "put {id}");
    }
    assert_eq!(combined.dense_chunks(), 1);
    assert_eq!(combined.len(), PROMOTION_THRESHOLD);
    assert!((0..threshold).all(|id| combined.get(id) == Some(coord(id))));
    let stride = i64::try_from(CHUNK_SLOTS).expect("fits i64");
    assert_eq!(combined.put(stride, coord(1)), Placement::OverBudget);
}

#[rstest]
#[case(AllocationStrategy::Chunked)]
#[case(AllocationStrategy::Combined)]
fn chunk_strategies_split_points_between_tiers(#[case] strategy: AllocationStrategy) {
    let overflow = PersistentOverflowCache::anonymous().expect("anonymous overflow");
    let mut cache = CoordinateCache::new(strategy, CHUNK_BYTES, overflow);
    let filled = i64::try_from(PROMOTION_THRESHOLD).expect("fits i64") + 10;
    let stride = i64::try_from(CHUNK_SLOTS).expect("fits i64");
    let stragglers: Vec<_> = (1..=5).map(|n| n * stride + n).collect();
    for id in (0..filled).chain(stragglers.iter().copied()) {
        cache.put(id, coord(id)).expect("put");
    }

    let stats = cache.stats();
    assert_eq!(stats.ram_entries, usize::try_from(filled).expect("fits usize"));
    assert_eq!(stats.overflow_puts, 5);
    assert_eq!(stats.ram_bytes, CHUNK_BYTES);
    for id in (0..filled).chain(stragglers) {
        assert_eq!(cache.get(id).expect("get"), Some(coord(id)), "id {id}");
    }
}

#[rstest]
fn combined_keeps_stragglers_sparse() {
    let mut combined = CombinedCache::new(CHUNK_BYTES);
    let stride = i64::try_from(CHUNK_SLOTS).expect("fits i64");
    for n in 0..10 {
        assert_eq!(combined.put(n * stride, coord(n)), Placement::Stored);
    }
    assert_eq!(combined.dense_chunks(), 0);
    assert_eq!(combined.used_bytes(), 10 * SPARSE_ENTRY_BYTES);
}

#[rstest]
fn strategy_parses_aliases() {
    assert_eq!("optimized".parse(), Ok(AllocationStrategy::Combined));
    assert_eq!(" Chunk ".parse(), Ok(AllocationStrategy::Chunked));
    assert!("striped".parse::<AllocationStrategy>().is_err());
}

#[rstest]
fn overflow_reads_back_ascending_and_shuffled_writes() {
    let mut overflow = PersistentOverflowCache::anonymous().expect("anonymous overflow");
    for id in 1..=1_000 {
        overflow.put(id, coord(id)).expect("put");
    }
    overflow.put(500, coord(5)).expect("out-of-order update");
    assert_eq!(overflow.run_count(), 1);
    assert_eq!(overflow.override_count(), 1);
    assert_eq!(overflow.get(1).expect("get"), Some(coord(1)));
    assert_eq!(overflow.get(1_000).expect("get"), Some(coord(1_000)));
    assert_eq!(overflow.get(500).expect("get"), Some(coord(5)), "newest wins");
    assert_eq!(overflow.get(1_001).expect("get"), None);
}

#[rstest]
fn overflow_indexes_interleaved_streams_with_one_entry_per_record() {
    let mut overflow = PersistentOverflowCache::anonymous().expect("anonymous overflow");
    let streams = 20_000;
    for n in 0..streams {
        overflow.put(n, coord(n)).expect("put low stream");
        overflow.put(1_000_000 + n, coord(n + 7)).expect("put high stream");
    }
    // Only the first two records share a run; the rest are indexed singly.
    assert_eq!(
        overflow.run_count() + overflow.override_count(),
        usize::try_from(2 * streams).expect("fits usize") - 1
    );
    for n in (0..streams).step_by(97) {
        assert_eq!(overflow.get(n).expect("get"), Some(coord(n)), "low {n}");
        assert_eq!(
            overflow.get(1_000_000 + n).expect("get"),
            Some(coord(n + 7)),
            "high {n}"
        );
    }
    assert_eq!(overflow.get(streams).expect("get"), None);
    assert_eq!(overflow.get(999_999).expect("get"), None);
}

#[rstest]
fn overflow_gap_ids_start_runs_that_do_not_swallow_neighbours() {
    let mut overflow = PersistentOverflowCache::anonymous().expect("anonymous overflow");
    for id in [10, 20, 30, 40, 50] {
        overflow.put(id, coord(id)).expect("put");
    }
    overflow.put(5, coord(5)).expect("below every run");
    overflow.put(6, coord(6)).expect("extends the new run");
    overflow.put(11, coord(111)).expect("blocked by the next run");
    overflow.put(25, coord(99)).expect("inside the first run");
    assert_eq!(overflow.run_count(), 2);
    assert_eq!(overflow.override_count(), 2);
    assert_eq!(overflow.get(11).expect("get"), Some(coord(111)));
    for id in [5, 6, 10, 20, 30, 40, 50] {
        assert_eq!(overflow.get(id).expect("get"), Some(coord(id)), "id {id}");
    }
    assert_eq!(overflow.get(25).expect("get"), Some(coord(99)));
    assert_eq!(overflow.get(7).expect("get"), None);
    assert!(!overflow.may_hold(4));
    assert!(!overflow.may_hold(51));
}

#[rstest]
fn overflow_reopen_rebuilds_overrides(temp_dir: TempDir) {
    let path = overflow_path(&temp_dir);
    {
        let mut overflow = PersistentOverflowCache::open(&path).expect("create");
        for id in 1..=100 {
            overflow.put(id, coord(id)).expect("put");
        }
        overflow.put(50, coord(500)).expect("update");
        overflow.remove(60).expect("remove");
        overflow.sync().expect("sync");
    }

    let mut reopened = PersistentOverflowCache::open(&path).expect("reopen");
    assert_eq!(reopened.run_count(), 1);
    assert_eq!(reopened.override_count(), 2);
    assert_eq!(reopened.get(50).expect("get"), Some(coord(500)));
    assert_eq!(reopened.get(60).expect("get"), None);
    assert_eq!(reopened.get(61).expect("get"), Some(coord(61)));
}

#[rstest]
fn overflow_remove_writes_a_tombstone() {
    let mut overflow = PersistentOverflowCache::anonymous().expect("anonymous overflow");
    overflow.put(42, coord(42)).expect("put");
    assert!(overflow.remove(42).expect("remove"));
    assert_eq!(overflow.get(42).expect("get"), None);
    assert!(!overflow.remove(42).expect("second remove"));
    assert_eq!(overflow.record_count(), 2);
}

#[rstest]
fn overflow_survives_reopen(temp_dir: TempDir) {
    let path = overflow_path(&temp_dir);
    {
        let mut overflow = PersistentOverflowCache::open(&path).expect("create");
        for id in 10..20 {
            overflow.put(id, coord(id)).expect("put");
        }
        overflow.remove(15).expect("remove");
        overflow.sync().expect("sync");
    }

    let mut reopened = PersistentOverflowCache::open(&path).expect("reopen");
    assert_eq!(reopened.record_count(), 11);
    assert_eq!(reopened.get(12).expect("get"), Some(coord(12)));
    assert_eq!(reopened.get(15).expect("get"), None);
}

#[rstest]
fn overflow_discards_a_truncated_tail(temp_dir: TempDir) {
    let path = overflow_path(&temp_dir);
    {
        let mut overflow = PersistentOverflowCache::open(&path).expect("create");
        overflow.put(1, coord(1)).expect("put");
        overflow.put(2, coord(2)).expect("put");
        overflow.sync().expect("sync");
    }
    {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(path.as_std_path())
            .expect("open for append");
        file.write_all(&[3, 0, 0, 0, 0]).expect("write partial record");
    }

    let mut reopened = PersistentOverflowCache::open(&path).expect("reopen");
    assert_eq!(reopened.record_count(), 2);
    assert_eq!(reopened.get(2).expect("get"), Some(coord(2)));
    reopened.put(3, coord(3)).expect("append after repair");
    assert_eq!(reopened.get(3).expect("get"), Some(coord(3)));
}

#[rstest]
fn overflow_rejects_foreign_files(temp_dir: TempDir) {
    let path = overflow_path(&temp_dir);
    std::fs::write(path.as_std_path(), b"NOPE0000").expect("write foreign file");

    let err = PersistentOverflowCache::open(&path).expect_err("magic mismatch");
    assert!(matches!(err, OverflowCacheError::InvalidMagic { .. }));
}

#[rstest]
fn overflow_rejects_future_versions(temp_dir: TempDir) {
    let path = overflow_path(&temp_dir);
    let mut header = OVERFLOW_MAGIC.to_vec();
    header.extend_from_slice(&(OVERFLOW_VERSION + 1).to_le_bytes());
    header.extend_from_slice(&[0, 0]);
    std::fs::write(path.as_std_path(), header).expect("write header");

    let err = PersistentOverflowCache::open(&path).expect_err("version mismatch");
    assert!(matches!(
        err,
        OverflowCacheError::UnsupportedVersion { found, supported, .. }
            if found == OVERFLOW_VERSION + 1 && supported == OVERFLOW_VERSION
    ));
}

#[rstest]
fn cache_spills_past_budget_and_keeps_one_authoritative_tier() {
    let overflow = PersistentOverflowCache::anonymous().expect("anonymous overflow");
    let mut cache = CoordinateCache::new(
        AllocationStrategy::Sparse,
        2 * SPARSE_ENTRY_BYTES,
        overflow,
    );
    cache.put(1, coord(1)).expect("put");
    cache.put(2, coord(2)).expect("put");
    cache.put(3, coord(3)).expect("spilled put");
    assert_eq!(cache.stats().overflow_puts, 1);

    cache.remove(1).expect("free a RAM slot");
    cache.put(3, coord(33)).expect("update spilled id");
    assert_eq!(cache.stats().ram_entries, 1, "id 3 stays in overflow");
    assert_eq!(cache.get(3).expect("get"), Some(coord(33)));

    assert!(cache.remove(3).expect("remove spilled id"));
    assert_eq!(cache.get(3).expect("get"), None);
}

#[rstest]
fn putting_the_sentinel_removes() {
    let overflow = PersistentOverflowCache::anonymous().expect("anonymous overflow");
    let mut cache = CoordinateCache::new(AllocationStrategy::Chunked, CHUNK_BYTES, overflow);
    cache.put(9, coord(9)).expect("put");
    cache.put(9, Coordinate::UNSET).expect("put sentinel");
    assert_eq!(cache.get(9).expect("get"), None);
}
