//! Flat array strategy addressed by `id - base`.

use crate::model::{Coordinate, PrimitiveId};

use super::{CoordinateStore, Placement};

const SLOT_BYTES: usize = size_of::<Coordinate>();
/// Smallest growth step so tiny budgets do not reallocate on every put.
const MIN_GROWTH: usize = 1024;

/// Dense array strategy.
///
/// The first id stored becomes the base; ids below the base or beyond the
/// budgeted slot count are reported as [`Placement::OverBudget`]. Memory is
/// proportional to the id range, so this suits a single consistent extract
/// with densely packed ids.
#[derive(Debug)]
pub struct DenseCache {
    base: Option<PrimitiveId>,
    slots: Vec<Coordinate>,
    max_slots: usize,
    live: usize,
}

impl DenseCache {
    /// Create a dense store that never grows beyond `budget_bytes`.
    pub const fn new(budget_bytes: usize) -> Self {
        Self {
            base: None,
            slots: Vec::new(),
            max_slots: budget_bytes / SLOT_BYTES,
            live: 0,
        }
    }

    fn offset(&self, id: PrimitiveId) -> Option<usize> {
        let base = self.base?;
        let delta = id.checked_sub(base)?;
        usize::try_from(delta).ok()
    }

    fn grow_to_fit(&mut self, offset: usize) -> bool {
        if offset < self.slots.len() {
            return true;
        }
        if offset >= self.max_slots {
            return false;
        }
        let doubled = self.slots.len().saturating_mul(2).max(MIN_GROWTH);
        let target = doubled.max(offset + 1).min(self.max_slots);
        self.slots.reserve_exact(target - self.slots.len());
        self.slots.resize(target, Coordinate::UNSET);
        true
    }
}

impl CoordinateStore for DenseCache {
    fn put(&mut self, id: PrimitiveId, coordinate: Coordinate) -> Placement {
        if self.base.is_none() {
            if self.max_slots == 0 {
                return Placement::OverBudget;
            }
            self.base = Some(id);
        }
        let Some(offset) = self.offset(id) else {
            return Placement::OverBudget;
        };
        if !self.grow_to_fit(offset) {
            return Placement::OverBudget;
        }
        let Some(slot) = self.slots.get_mut(offset) else {
            return Placement::OverBudget;
        };
        if slot.is_unset() {
            self.live += 1;
        }
        *slot = coordinate;
        Placement::Stored
    }

    fn get(&self, id: PrimitiveId) -> Option<Coordinate> {
        let offset = self.offset(id)?;
        self.slots
            .get(offset)
            .copied()
            .filter(|coordinate| !coordinate.is_unset())
    }

    fn remove(&mut self, id: PrimitiveId) -> bool {
        let Some(offset) = self.offset(id) else {
            return false;
        };
        match self.slots.get_mut(offset) {
            Some(slot) if !slot.is_unset() => {
                *slot = Coordinate::UNSET;
                self.live -= 1;
                true
            }
            _ => false,
        }
    }

    fn used_bytes(&self) -> usize {
        self.slots.capacity() * SLOT_BYTES
    }

    fn len(&self) -> usize {
        self.live
    }
}
