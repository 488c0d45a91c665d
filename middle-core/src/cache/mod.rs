//! Two-tier point coordinate cache.
//!
//! The fast tier is an in-memory store with a pluggable allocation strategy
//! and a fixed byte budget. Once a `put` would exceed that budget the value is
//! written straight through to the [`PersistentOverflowCache`]; nothing is
//! evicted. At most one tier holds the authoritative value for any id.

use std::fmt;
use std::str::FromStr;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Coordinate, PrimitiveId};

mod chunked;
mod combined;
mod dense;
mod overflow;
mod sparse;

pub use chunked::ChunkedCache;
pub use combined::CombinedCache;
pub use dense::DenseCache;
pub use overflow::{OVERFLOW_MAGIC, OVERFLOW_VERSION, OverflowCacheError, PersistentOverflowCache};
pub use sparse::SparseCache;

/// Outcome of storing a coordinate in a RAM strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Placement {
    /// The value now lives in this store.
    Stored,
    /// Storing the value would exceed the byte budget; nothing was recorded.
    OverBudget,
}

/// Capability set shared by every in-memory allocation strategy.
pub trait CoordinateStore {
    /// Store `coordinate` for `id`, replacing any previous value.
    fn put(&mut self, id: PrimitiveId, coordinate: Coordinate) -> Placement;
    /// Look up the coordinate for `id`.
    fn get(&self, id: PrimitiveId) -> Option<Coordinate>;
    /// Forget `id`. Returns whether a value was present.
    fn remove(&mut self, id: PrimitiveId) -> bool;
    /// Bytes currently charged against the budget.
    fn used_bytes(&self) -> usize;
    /// Number of live entries.
    fn len(&self) -> usize;

    /// Whether a value is stored for `id`.
    fn contains(&self, id: PrimitiveId) -> bool {
        self.get(id).is_some()
    }

    /// Whether the store holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Allocation strategy for the in-memory tier, fixed for a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStrategy {
    /// Flat array addressed by `id - base`.
    Dense,
    /// Hash map keyed by id.
    Sparse,
    /// Lazily allocated fixed-size dense chunks.
    #[default]
    Chunked,
    /// Sparse entries promoted to dense chunks once a chunk fills up.
    #[serde(alias = "optimized")]
    Combined,
}

impl fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Dense => "dense",
            Self::Sparse => "sparse",
            Self::Chunked => "chunked",
            Self::Combined => "combined",
        })
    }
}

/// Error returned when parsing an unknown [`AllocationStrategy`].
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown cache allocation strategy '{0}' (expected dense, sparse, chunked or combined)")]
pub struct ParseStrategyError(String);

impl FromStr for AllocationStrategy {
    type Err = ParseStrategyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dense" => Ok(Self::Dense),
            "sparse" => Ok(Self::Sparse),
            "chunked" | "chunk" => Ok(Self::Chunked),
            "combined" | "optimized" => Ok(Self::Combined),
            other => Err(ParseStrategyError(other.to_owned())),
        }
    }
}

/// In-memory tier selected once at construction.
#[derive(Debug)]
pub enum RamCache {
    /// See [`DenseCache`].
    Dense(DenseCache),
    /// See [`SparseCache`].
    Sparse(SparseCache),
    /// See [`ChunkedCache`].
    Chunked(ChunkedCache),
    /// See [`CombinedCache`].
    Combined(CombinedCache),
}

impl RamCache {
    /// Build the strategy's store with the given byte budget.
    pub fn new(strategy: AllocationStrategy, budget_bytes: usize) -> Self {
        match strategy {
            AllocationStrategy::Dense => Self::Dense(DenseCache::new(budget_bytes)),
            AllocationStrategy::Sparse => Self::Sparse(SparseCache::new(budget_bytes)),
            AllocationStrategy::Chunked => Self::Chunked(ChunkedCache::new(budget_bytes)),
            AllocationStrategy::Combined => Self::Combined(CombinedCache::new(budget_bytes)),
        }
    }

    /// Strategy backing this tier.
    pub const fn strategy(&self) -> AllocationStrategy {
        match self {
            Self::Dense(_) => AllocationStrategy::Dense,
            Self::Sparse(_) => AllocationStrategy::Sparse,
            Self::Chunked(_) => AllocationStrategy::Chunked,
            Self::Combined(_) => AllocationStrategy::Combined,
        }
    }

    fn inner(&self) -> &dyn CoordinateStore {
        match self {
            Self::Dense(store) => store,
            Self::Sparse(store) => store,
            Self::Chunked(store) => store,
            Self::Combined(store) => store,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn CoordinateStore {
        match self {
            Self::Dense(store) => store,
            Self::Sparse(store) => store,
            Self::Chunked(store) => store,
            Self::Combined(store) => store,
        }
    }
}

impl CoordinateStore for RamCache {
    fn put(&mut self, id: PrimitiveId, coordinate: Coordinate) -> Placement {
        self.inner_mut().put(id, coordinate)
    }

    fn get(&self, id: PrimitiveId) -> Option<Coordinate> {
        self.inner().get(id)
    }

    fn remove(&mut self, id: PrimitiveId) -> bool {
        self.inner_mut().remove(id)
    }

    fn used_bytes(&self) -> usize {
        self.inner().used_bytes()
    }

    fn len(&self) -> usize {
        self.inner().len()
    }
}

/// Counters describing where coordinates currently live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Live entries in the RAM tier.
    pub ram_entries: usize,
    /// Bytes charged against the RAM budget.
    pub ram_bytes: usize,
    /// Puts that were redirected to the overflow tier.
    pub overflow_puts: u64,
    /// Records (including tombstones) in the overflow file.
    pub overflow_records: u64,
}

/// Point coordinate cache combining a bounded RAM tier with a persistent
/// overflow tier.
///
/// # Examples
/// ```
/// use middle_core::{AllocationStrategy, CoordinateCache, Coordinate, PersistentOverflowCache};
///
/// # fn main() -> Result<(), middle_core::OverflowCacheError> {
/// let overflow = PersistentOverflowCache::anonymous()?;
/// // Room for a single sparse entry: the second point spills to disk.
/// let mut cache = CoordinateCache::new(AllocationStrategy::Sparse, 24, overflow);
/// let here = Coordinate::from_degrees(1.0, 2.0).expect("valid");
/// cache.put(1, here)?;
/// cache.put(2, here)?;
/// assert_eq!(cache.get(2)?, Some(here));
/// assert_eq!(cache.stats().overflow_puts, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct CoordinateCache {
    ram: RamCache,
    overflow: PersistentOverflowCache,
    overflow_puts: u64,
}

impl CoordinateCache {
    /// Create a cache with the chosen strategy and RAM byte budget.
    pub fn new(
        strategy: AllocationStrategy,
        budget_bytes: usize,
        overflow: PersistentOverflowCache,
    ) -> Self {
        debug!("coordinate cache: {strategy} strategy with {budget_bytes} byte budget");
        Self {
            ram: RamCache::new(strategy, budget_bytes),
            overflow,
            overflow_puts: 0,
        }
    }

    /// Store `coordinate` for `id`.
    ///
    /// Values already held by the overflow tier stay there so only one tier
    /// is authoritative. Storing [`Coordinate::UNSET`] removes the id.
    pub fn put(
        &mut self,
        id: PrimitiveId,
        coordinate: Coordinate,
    ) -> Result<(), OverflowCacheError> {
        if coordinate.is_unset() {
            return self.remove(id).map(|_| ());
        }
        if !self.ram.contains(id)
            && self.overflow.may_hold(id)
            && self.overflow.get(id)?.is_some()
        {
            return self.overflow.put(id, coordinate);
        }
        match self.ram.put(id, coordinate) {
            Placement::Stored => Ok(()),
            Placement::OverBudget => {
                if self.overflow_puts == 0 {
                    warn!(
                        "coordinate cache budget exhausted at {} bytes; spilling to {}",
                        self.ram.used_bytes(),
                        self.overflow.location()
                    );
                }
                self.overflow_puts += 1;
                self.overflow.put(id, coordinate)
            }
        }
    }

    /// Look up `id`, consulting the overflow tier on a RAM miss.
    pub fn get(&mut self, id: PrimitiveId) -> Result<Option<Coordinate>, OverflowCacheError> {
        if let Some(coordinate) = self.ram.get(id) {
            return Ok(Some(coordinate));
        }
        self.overflow.get(id)
    }

    /// Forget `id` in whichever tier holds it. Returns whether it was present.
    pub fn remove(&mut self, id: PrimitiveId) -> Result<bool, OverflowCacheError> {
        if self.ram.remove(id) {
            return Ok(true);
        }
        self.overflow.remove(id)
    }

    /// Flush buffered overflow records and sync them to stable storage.
    pub fn sync(&mut self) -> Result<(), OverflowCacheError> {
        self.overflow.sync()
    }

    /// Strategy of the RAM tier.
    pub const fn strategy(&self) -> AllocationStrategy {
        self.ram.strategy()
    }

    /// Current tier statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            ram_entries: self.ram.len(),
            ram_bytes: self.ram.used_bytes(),
            overflow_puts: self.overflow_puts,
            overflow_records: self.overflow.record_count(),
        }
    }
}

#[cfg(test)]
mod tests;
