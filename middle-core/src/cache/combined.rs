//! Sparse entries promoted to dense chunks once a chunk fills up.

use std::collections::HashMap;

use log::debug;

use crate::model::{Coordinate, PrimitiveId};

use super::chunked::{CHUNK_BYTES, chunk_of, chunk_range};
use super::sparse::SPARSE_ENTRY_BYTES;
use super::{ChunkedCache, CoordinateStore, Placement, SparseCache};

/// Sparse entries in one chunk at which a dense chunk costs no more memory
/// than the sparse entries it replaces.
pub const PROMOTION_THRESHOLD: usize = CHUNK_BYTES / SPARSE_ENTRY_BYTES;

/// Combined strategy.
///
/// New ids land in the sparse tier. When the number of sparse entries that
/// fall into one chunk reaches [`PROMOTION_THRESHOLD`] the chunk is promoted:
/// a dense chunk is allocated and that chunk's sparse entries migrate into
/// it. Promotion is budget-neutral at the threshold, so stragglers stay cheap
/// while well-filled ranges get O(1) array access.
#[derive(Debug)]
pub struct CombinedCache {
    dense: ChunkedCache,
    sparse: SparseCache,
    sparse_per_chunk: HashMap<PrimitiveId, usize>,
    budget_bytes: usize,
}

impl CombinedCache {
    /// Create a combined store sharing `budget_bytes` between both tiers.
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            dense: ChunkedCache::new(usize::MAX),
            sparse: SparseCache::new(usize::MAX),
            sparse_per_chunk: HashMap::new(),
            budget_bytes,
        }
    }

    /// Number of chunks promoted to dense storage.
    pub fn dense_chunks(&self) -> usize {
        self.dense.used_bytes() / CHUNK_BYTES
    }

    fn promote(&mut self, chunk: PrimitiveId) {
        self.dense.allocate(chunk);
        let migrated = self.sparse.drain_range(chunk_range(chunk));
        debug!(
            "promoting chunk {chunk} to dense storage with {} entries",
            migrated.len()
        );
        for (id, coordinate) in migrated {
            let placement = self.dense.put(id, coordinate);
            debug_assert_eq!(
                placement,
                Placement::Stored,
                "promoted chunk {chunk} is allocated and unbudgeted"
            );
        }
        self.sparse_per_chunk.remove(&chunk);
    }

    fn promotion_fits(&self, chunk_entries: usize) -> bool {
        let freed = chunk_entries * SPARSE_ENTRY_BYTES;
        self.used_bytes() - freed + CHUNK_BYTES <= self.budget_bytes
    }
}

impl CoordinateStore for CombinedCache {
    fn put(&mut self, id: PrimitiveId, coordinate: Coordinate) -> Placement {
        let chunk = chunk_of(id);
        if self.dense.has_chunk(chunk) {
            return self.dense.put(id, coordinate);
        }
        if self.sparse.contains(id) {
            return self.sparse.put(id, coordinate);
        }

        let chunk_entries = self.sparse_per_chunk.get(&chunk).copied().unwrap_or(0);
        if chunk_entries + 1 >= PROMOTION_THRESHOLD && self.promotion_fits(chunk_entries) {
            self.promote(chunk);
            return self.dense.put(id, coordinate);
        }
        if self.used_bytes() + SPARSE_ENTRY_BYTES > self.budget_bytes {
            return Placement::OverBudget;
        }
        let placement = self.sparse.put(id, coordinate);
        *self.sparse_per_chunk.entry(chunk).or_insert(0) += 1;
        placement
    }

    fn get(&self, id: PrimitiveId) -> Option<Coordinate> {
        self.dense.get(id).or_else(|| self.sparse.get(id))
    }

    fn remove(&mut self, id: PrimitiveId) -> bool {
        if self.dense.remove(id) {
            return true;
        }
        if !self.sparse.remove(id) {
            return false;
        }
        let chunk = chunk_of(id);
        if let Some(count) = self.sparse_per_chunk.get_mut(&chunk) {
            *count -= 1;
            if *count == 0 {
                self.sparse_per_chunk.remove(&chunk);
            }
        }
        true
    }

    fn used_bytes(&self) -> usize {
        self.dense.used_bytes() + self.sparse.used_bytes()
    }

    fn len(&self) -> usize {
        self.dense.len() + self.sparse.len()
    }
}
