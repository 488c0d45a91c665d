//! Middle storage layer for OpenStreetMap imports.
//!
//! The middle sits between the parser and the output stages. It keeps point
//! coordinates in a two-tier cache, bulk-loads primitives into a relational
//! backing store through a dedicated writer thread, tracks ways and relations
//! that need reprocessing after a change, and resolves way node lists and
//! relation members for output stages.
//!
//! [`MiddleStore`] is the entry point; [`QueryView`] is its read side.

#![forbid(unsafe_code)]

pub mod backing;
pub mod cache;
pub mod copy;
pub mod middle;
pub mod model;
pub mod pending;
pub mod table;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use backing::{BackingStore, BackingStoreError, Connector, Row, Value};
#[cfg(feature = "store-sqlite")]
pub use backing::{SqliteBackingStore, SqliteConnector};
pub use cache::{
    AllocationStrategy, CacheStats, CoordinateCache, CoordinateStore, OverflowCacheError,
    ParseStrategyError, PersistentOverflowCache, RamCache,
};
pub use copy::{BulkWriteChannel, WriteError, WriterConfig, WriterStats};
pub use middle::{
    ConfigError, ImportMode, MemberTarget, MiddleConfig, MiddleError, MiddleStore, QueryView,
    RelationResolution, ResolvedMember, ResolvedRelation, ResolvedWay, StopSummary, StoreState,
    WayResolution,
};
pub use model::{
    Attributes, Coordinate, Member, MemberKind, PointRecord, PrimitiveId, RelationRecord, Tags,
    WayRecord,
};
pub use pending::{PendingSet, PendingTracker};
pub use table::{
    Column, ColumnType, CopyRow, CopyTarget, DecodeError, EncodeError, EncodeReason,
    PreparedStatement, Statement, TableDescriptor, TableKind, TableSet,
};
