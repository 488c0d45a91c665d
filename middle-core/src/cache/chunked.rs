//! Lazily allocated dense chunks.

use std::collections::HashMap;

use crate::model::{Coordinate, PrimitiveId};

use super::{CoordinateStore, Placement};

/// Each chunk covers `2^CHUNK_SHIFT` consecutive ids.
pub(super) const CHUNK_SHIFT: u32 = 13;
pub(super) const CHUNK_SLOTS: usize = 1 << CHUNK_SHIFT;
pub(super) const CHUNK_BYTES: usize = CHUNK_SLOTS * size_of::<Coordinate>();
const OFFSET_MASK: PrimitiveId = (1 << CHUNK_SHIFT) - 1;

/// Chunk index for `id`; arithmetic shift keeps negative ids ordered.
pub(super) const fn chunk_of(id: PrimitiveId) -> PrimitiveId {
    id >> CHUNK_SHIFT
}

/// Ids covered by `chunk`.
pub(super) const fn chunk_range(chunk: PrimitiveId) -> std::ops::Range<PrimitiveId> {
    let start = chunk << CHUNK_SHIFT;
    start..start.saturating_add(1 << CHUNK_SHIFT)
}

#[expect(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "masked offset is always below CHUNK_SLOTS"
)]
const fn offset_of(id: PrimitiveId) -> usize {
    (id & OFFSET_MASK) as usize
}

/// Chunked-dense strategy: the id space is split into fixed-size chunks and
/// each chunk is allocated as a dense array when first touched.
#[derive(Debug)]
pub struct ChunkedCache {
    chunks: HashMap<PrimitiveId, Box<[Coordinate]>>,
    budget_bytes: usize,
    live: usize,
}

impl ChunkedCache {
    /// Create a chunked store holding at most `budget_bytes / CHUNK_BYTES` chunks.
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            chunks: HashMap::new(),
            budget_bytes,
            live: 0,
        }
    }

    pub(super) fn has_chunk(&self, chunk: PrimitiveId) -> bool {
        self.chunks.contains_key(&chunk)
    }

    /// Allocate `chunk` without consulting the budget; callers account for it.
    pub(super) fn allocate(&mut self, chunk: PrimitiveId) {
        self.chunks
            .entry(chunk)
            .or_insert_with(|| vec![Coordinate::UNSET; CHUNK_SLOTS].into_boxed_slice());
    }

    fn store(&mut self, id: PrimitiveId, coordinate: Coordinate) -> Placement {
        let Some(slot) = self
            .chunks
            .get_mut(&chunk_of(id))
            .and_then(|chunk| chunk.get_mut(offset_of(id)))
        else {
            return Placement::OverBudget;
        };
        if slot.is_unset() {
            self.live += 1;
        }
        *slot = coordinate;
        Placement::Stored
    }
}

impl CoordinateStore for ChunkedCache {
    fn put(&mut self, id: PrimitiveId, coordinate: Coordinate) -> Placement {
        let chunk = chunk_of(id);
        if !self.has_chunk(chunk) {
            if self.used_bytes() + CHUNK_BYTES > self.budget_bytes {
                return Placement::OverBudget;
            }
            self.allocate(chunk);
        }
        self.store(id, coordinate)
    }

    fn get(&self, id: PrimitiveId) -> Option<Coordinate> {
        self.chunks
            .get(&chunk_of(id))
            .and_then(|chunk| chunk.get(offset_of(id)))
            .copied()
            .filter(|coordinate| !coordinate.is_unset())
    }

    fn remove(&mut self, id: PrimitiveId) -> bool {
        match self
            .chunks
            .get_mut(&chunk_of(id))
            .and_then(|chunk| chunk.get_mut(offset_of(id)))
        {
            Some(slot) if !slot.is_unset() => {
                *slot = Coordinate::UNSET;
                self.live -= 1;
                true
            }
            _ => false,
        }
    }

    fn used_bytes(&self) -> usize {
        self.chunks.len() * CHUNK_BYTES
    }

    fn len(&self) -> usize {
        self.live
    }
}
