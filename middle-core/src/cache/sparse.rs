//! Hash map strategy with memory proportional to live entries.

use std::collections::HashMap;

use crate::model::{Coordinate, PrimitiveId};

use super::{CoordinateStore, Placement};

/// Bytes charged per live entry: key, value and hash table overhead.
pub(super) const SPARSE_ENTRY_BYTES: usize = 24;

/// Sparse strategy backed by a hash map.
#[derive(Debug)]
pub struct SparseCache {
    entries: HashMap<PrimitiveId, Coordinate>,
    budget_bytes: usize,
}

impl SparseCache {
    /// Create a sparse store admitting at most `budget_bytes` of entries.
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            budget_bytes,
        }
    }

    /// Remove and return every entry whose id falls in `ids`.
    pub(super) fn drain_range(
        &mut self,
        ids: std::ops::Range<PrimitiveId>,
    ) -> Vec<(PrimitiveId, Coordinate)> {
        ids.filter_map(|id| self.entries.remove(&id).map(|coordinate| (id, coordinate)))
            .collect()
    }
}

impl CoordinateStore for SparseCache {
    fn put(&mut self, id: PrimitiveId, coordinate: Coordinate) -> Placement {
        if let Some(slot) = self.entries.get_mut(&id) {
            *slot = coordinate;
            return Placement::Stored;
        }
        if self.used_bytes() + SPARSE_ENTRY_BYTES > self.budget_bytes {
            return Placement::OverBudget;
        }
        self.entries.insert(id, coordinate);
        Placement::Stored
    }

    fn get(&self, id: PrimitiveId) -> Option<Coordinate> {
        self.entries.get(&id).copied()
    }

    fn remove(&mut self, id: PrimitiveId) -> bool {
        self.entries.remove(&id).is_some()
    }

    fn used_bytes(&self) -> usize {
        self.entries.len() * SPARSE_ENTRY_BYTES
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
