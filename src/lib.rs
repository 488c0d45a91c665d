//! Facade crate for the OSM middle store.
//!
//! This crate re-exports the middle store, its coordinate cache and table
//! descriptors, and exposes the SQLite backing store and PBF loader behind
//! feature flags.

#![forbid(unsafe_code)]

pub use middle_core::{
    AllocationStrategy, Attributes, BackingStore, BackingStoreError, BulkWriteChannel, CacheStats,
    ConfigError, Connector, Coordinate, CoordinateCache, ImportMode, Member, MemberKind,
    MemberTarget, MiddleConfig, MiddleError, MiddleStore, PendingTracker, PersistentOverflowCache,
    PointRecord, PrimitiveId, QueryView, RelationRecord, RelationResolution, ResolvedMember,
    ResolvedRelation, ResolvedWay, StopSummary, StoreState, TableDescriptor, TableKind, TableSet,
    Tags, WayRecord, WayResolution, WriteError, WriterConfig,
};

#[cfg(feature = "store-sqlite")]
pub use middle_core::{SqliteBackingStore, SqliteConnector};

#[cfg(feature = "pbf")]
pub use middle_data::{LoadError, LoadSummary, load_osm_pbf};
