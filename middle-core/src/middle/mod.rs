//! The middle store: primitive mutations on the write side, [`QueryView`] on
//! the read side.
//!
//! A store moves through an explicit lifecycle. Create runs start in
//! [`StoreState::Loading`], where every `*_set` bulk-streams rows through the
//! [`BulkWriteChannel`] into unindexed tables, then pass through
//! [`StoreState::IndexBuilding`] into [`StoreState::Ready`]. Append runs open
//! straight into `Ready` and apply each mutation with prepared statements,
//! since the tables are already indexed. Queries are served from `Ready`
//! onward.

use std::error::Error as StdError;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use log::{debug, info};
use thiserror::Error;

use crate::backing::{BackingStore, BackingStoreError, Connector, Row, Value};
use crate::cache::{CacheStats, CoordinateCache, OverflowCacheError, PersistentOverflowCache};
use crate::copy::{BulkWriteChannel, WriteError, WriterStats};
use crate::model::{MemberKind, PointRecord, PrimitiveId, RelationRecord, WayRecord};
use crate::pending::PendingTracker;
use crate::table::{
    CopyRow, DecodeError, EncodeError, Statement, TableKind, TableSet, point_values,
    relation_values, way_values,
};

mod config;
mod query;

pub use config::{ConfigError, ImportMode, MiddleConfig};
pub use query::{
    MemberTarget, QueryView, RelationResolution, ResolvedMember, ResolvedRelation, ResolvedWay,
    WayResolution,
};

/// Lifecycle position of a [`MiddleStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreState {
    /// Create run bulk phase; tables carry no secondary indexes.
    Loading,
    /// Deferred indexes are being built.
    IndexBuilding,
    /// Indexed and queryable.
    Ready,
    /// Writer drained and store closed.
    Stopped,
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Loading => "loading",
            Self::IndexBuilding => "building indexes",
            Self::Ready => "ready",
            Self::Stopped => "stopped",
        })
    }
}

/// Errors raised by [`MiddleStore`] and [`QueryView`].
#[derive(Debug, Error)]
pub enum MiddleError {
    /// The configuration was rejected before anything was touched.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Table setup, verification or teardown failed.
    #[error("schema {step} failed: {source}")]
    Schema {
        /// Lifecycle step that failed.
        step: &'static str,
        /// Underlying store error.
        #[source]
        source: BackingStoreError,
    },
    /// A prepared statement failed.
    #[error("failed to {operation}: {source}")]
    Backing {
        /// Operation that failed.
        operation: &'static str,
        /// Underlying store error.
        #[source]
        source: BackingStoreError,
    },
    /// The overflow coordinate tier failed.
    #[error(transparent)]
    Cache(#[from] OverflowCacheError),
    /// The bulk write channel failed or was already aborted.
    #[error(transparent)]
    Write(#[from] WriteError),
    /// A record could not be encoded; nothing was written for it.
    #[error(transparent)]
    Encode(#[from] EncodeError),
    /// A stored row could not be read back.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// The operation is not valid in the current lifecycle state.
    #[error("cannot {operation} while the store is {state}")]
    InvalidState {
        /// Attempted operation.
        operation: &'static str,
        /// State the store was in.
        state: StoreState,
    },
    /// The operation needs the other import mode.
    #[error("{operation} requires {required} mode")]
    WrongMode {
        /// Attempted operation.
        operation: &'static str,
        /// Mode the operation needs.
        required: ImportMode,
    },
    /// A thread panicked while holding one of the store's locks.
    #[error("{what} lock poisoned")]
    Poisoned {
        /// Which lock.
        what: &'static str,
    },
    /// A pending-reprocessing callback failed. The id is pending again.
    #[error("reprocessing {kind} {id} failed: {source}")]
    Processor {
        /// `"way"` or `"relation"`.
        kind: &'static str,
        /// Id whose processing failed.
        id: PrimitiveId,
        /// Error returned by the callback.
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

/// What [`MiddleStore::stop`] leaves behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopSummary {
    /// Writer counters, for create runs.
    pub writer: Option<WriterStats>,
    /// Final coordinate cache counters.
    pub cache: CacheStats,
}

pub(crate) fn lock<'a, T>(
    mutex: &'a Mutex<T>,
    what: &'static str,
) -> Result<MutexGuard<'a, T>, MiddleError> {
    mutex.lock().map_err(|_| MiddleError::Poisoned { what })
}

/// Register every table statement on `store`.
pub(crate) fn register_statements<S: BackingStore>(
    store: &mut S,
    tables: &TableSet,
) -> Result<(), BackingStoreError> {
    for table in tables.iter() {
        for statement in table.statements() {
            store.prepare(&statement.name, &statement.sql)?;
        }
    }
    Ok(())
}

/// First cell of every row as an id.
pub(crate) fn id_column(table: TableKind, rows: Vec<Row>) -> Result<Vec<PrimitiveId>, DecodeError> {
    rows.into_iter()
        .map(|row| {
            row.first()
                .and_then(Value::as_i64)
                .ok_or_else(|| DecodeError {
                    table,
                    id: None,
                    reason: "id column is not an integer".to_owned(),
                })
        })
        .collect()
}

fn open_overflow(config: &MiddleConfig) -> Result<PersistentOverflowCache, OverflowCacheError> {
    let Some(path) = &config.overflow_path else {
        return PersistentOverflowCache::anonymous();
    };
    if config.mode == ImportMode::Create {
        middle_fs::remove_file_if_exists(path).map_err(|source| OverflowCacheError::Io {
            location: path.to_string(),
            operation: "reset",
            source,
        })?;
    }
    PersistentOverflowCache::open(path)
}

/// Orchestrates the coordinate cache, pending tracker, write channel and
/// backing store for one import run.
///
/// Mutations take `&self` so ingest workers can share the store across
/// threads; each primitive id must be mutated by one thread at a time.
///
/// # Examples
/// ```
/// use camino::Utf8PathBuf;
/// use middle_core::{
///     Coordinate, MiddleConfig, MiddleStore, PointRecord, SqliteConnector, WayRecord,
///     WayResolution,
/// };
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let dir = tempfile::tempdir()?;
/// let connector = SqliteConnector::new(Utf8PathBuf::try_from(dir.path().join("middle.db"))?);
/// let store = MiddleStore::open(connector, MiddleConfig::default())?;
///
/// let here = Coordinate::from_degrees(-3.19, 55.95).ok_or("bad coordinate")?;
/// store.point_set(&PointRecord::new(1, here))?;
/// store.point_set(&PointRecord::new(2, here))?;
/// store.way_set(&WayRecord::new(10, vec![1, 2]))?;
/// store.build_indexes()?;
///
/// let mut view = store.query_view()?;
/// assert!(matches!(view.resolve_way(10)?, WayResolution::Complete(_)));
/// store.stop()?;
/// # Ok(())
/// # }
/// ```
pub struct MiddleStore<C: Connector> {
    connector: C,
    config: MiddleConfig,
    tables: TableSet,
    state: Mutex<StoreState>,
    cache: Mutex<CoordinateCache>,
    pending: Mutex<PendingTracker>,
    mutations: Mutex<C::Store>,
    channel: Option<BulkWriteChannel>,
}

impl<C: Connector> fmt::Debug for MiddleStore<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddleStore")
            .field("backing", &self.connector.describe())
            .field("mode", &self.config.mode)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> MiddleStore<C> {
    /// Open a store for one run.
    ///
    /// Create mode drops and recreates the tables, resets the overflow file,
    /// and starts the bulk writer on its own connection. Append mode checks
    /// that the tables and reverse-lookup tables exist and reuses the
    /// overflow file left by earlier runs.
    ///
    /// # Errors
    /// Returns [`MiddleError::Config`] for rejected settings,
    /// [`MiddleError::Schema`] when tables cannot be created or verified, and
    /// [`MiddleError::Cache`] or [`MiddleError::Write`] when the overflow file
    /// or writer cannot be started.
    pub fn open(connector: C, config: MiddleConfig) -> Result<Self, MiddleError> {
        config.validate()?;
        let tables = TableSet::new(&config.table_prefix);
        info!(
            "opening middle store on {} in {} mode",
            connector.describe(),
            config.mode
        );
        let schema = |step: &'static str| {
            move |source: BackingStoreError| MiddleError::Schema { step, source }
        };

        let mut mutations = connector.connect().map_err(schema("connect"))?;
        if config.mode == ImportMode::Create {
            for table in tables.iter() {
                for sql in table.drop_ddl().into_iter().chain(table.create_ddl()) {
                    mutations.execute_ddl(&sql).map_err(schema("create tables"))?;
                }
            }
        }
        register_statements(&mut mutations, &tables).map_err(schema("prepare statements"))?;
        if config.mode == ImportMode::Append {
            for table in tables.iter() {
                mutations
                    .exec_prepared(&table.statement_name(Statement::Verify), &[])
                    .map_err(schema("verify tables"))?;
            }
        }

        let overflow = open_overflow(&config)?;
        let cache = CoordinateCache::new(config.allocation, config.cache_bytes, overflow);
        let (channel, state) = match config.mode {
            ImportMode::Create => {
                let writer = connector.connect().map_err(schema("connect writer"))?;
                let channel = BulkWriteChannel::start(writer, tables.clone(), config.writer)?;
                (Some(channel), StoreState::Loading)
            }
            ImportMode::Append => (None, StoreState::Ready),
        };
        info!("middle store is {state}");

        Ok(Self {
            connector,
            config,
            tables,
            state: Mutex::new(state),
            cache: Mutex::new(cache),
            pending: Mutex::new(PendingTracker::new()),
            mutations: Mutex::new(mutations),
            channel,
        })
    }

    /// Settings the store was opened with.
    pub const fn config(&self) -> &MiddleConfig {
        &self.config
    }

    /// Table descriptors under the configured prefix.
    pub const fn tables(&self) -> &TableSet {
        &self.tables
    }

    /// Current lifecycle state.
    ///
    /// # Errors
    /// Returns [`MiddleError::Poisoned`] if a thread panicked while changing
    /// state.
    pub fn state(&self) -> Result<StoreState, MiddleError> {
        lock(&self.state, "state").map(|state| *state)
    }

    fn set_state(&self, next: StoreState) -> Result<(), MiddleError> {
        let mut state = lock(&self.state, "state")?;
        debug!("middle store {} -> {next}", *state);
        *state = next;
        Ok(())
    }

    /// Mutations run in `Loading` for create runs and `Ready` for append runs.
    fn require_mutable(&self, operation: &'static str) -> Result<(), MiddleError> {
        let state = self.state()?;
        let allowed = match self.config.mode {
            ImportMode::Create => StoreState::Loading,
            ImportMode::Append => StoreState::Ready,
        };
        if state == allowed {
            Ok(())
        } else {
            Err(MiddleError::InvalidState { operation, state })
        }
    }

    fn require_changes(&self, operation: &'static str) -> Result<(), MiddleError> {
        if self.config.mode != ImportMode::Append {
            return Err(MiddleError::WrongMode {
                operation,
                required: ImportMode::Append,
            });
        }
        self.require_mutable(operation)
    }

    pub(crate) fn lock_cache(&self) -> Result<MutexGuard<'_, CoordinateCache>, MiddleError> {
        lock(&self.cache, "coordinate cache")
    }

    pub(crate) const fn connector(&self) -> &C {
        &self.connector
    }

    fn channel(&self, operation: &'static str) -> Result<&BulkWriteChannel, MiddleError> {
        self.channel.as_ref().ok_or(MiddleError::WrongMode {
            operation,
            required: ImportMode::Create,
        })
    }

    fn exec(
        &self,
        table: TableKind,
        statement: Statement,
        params: &[Value],
        operation: &'static str,
    ) -> Result<Vec<Row>, MiddleError> {
        let name = self.tables.get(table).statement_name(statement);
        lock(&self.mutations, "mutation connection")?
            .exec_prepared(&name, params)
            .map_err(|source| MiddleError::Backing { operation, source })
    }

    /// Replace a row in an indexed table. The old row is deleted first so the
    /// reverse-lookup triggers drop its entries.
    fn replace_row(
        &self,
        table: TableKind,
        id: PrimitiveId,
        values: &[Value],
    ) -> Result<(), MiddleError> {
        self.exec(table, Statement::Delete, &[Value::Integer(id)], "delete row")?;
        self.exec(table, Statement::Upsert, values, "upsert row")?;
        Ok(())
    }

    fn write(
        &self,
        table: TableKind,
        id: PrimitiveId,
        values: &[Value],
        operation: &'static str,
    ) -> Result<(), MiddleError> {
        match self.config.mode {
            ImportMode::Create => {
                let row = CopyRow::from_values(table, id, values);
                self.channel(operation)?.enqueue_row(row)?;
                Ok(())
            }
            ImportMode::Append => self.replace_row(table, id, values),
        }
    }

    fn erase(
        &self,
        table: TableKind,
        id: PrimitiveId,
        operation: &'static str,
    ) -> Result<(), MiddleError> {
        match self.config.mode {
            ImportMode::Create => {
                self.channel(operation)?.enqueue_delete(table, id)?;
                Ok(())
            }
            ImportMode::Append => self
                .exec(table, Statement::Delete, &[Value::Integer(id)], operation)
                .map(|_| ()),
        }
    }

    /// Store a point, replacing any earlier version.
    ///
    /// # Errors
    /// Returns [`MiddleError::Encode`] for an unset location or unencodable
    /// tags (nothing is written), and storage errors from the cache tiers or
    /// backing store.
    pub fn point_set(&self, point: &PointRecord) -> Result<(), MiddleError> {
        self.require_mutable("set point")?;
        let values = point_values(point)?;
        self.lock_cache()?.put(point.id, point.location)?;
        self.write(TableKind::Points, point.id, &values, "set point")
    }

    /// Remove a point from the cache and the backing store.
    ///
    /// # Errors
    /// Returns storage errors from the cache tiers or backing store.
    pub fn point_delete(&self, id: PrimitiveId) -> Result<(), MiddleError> {
        self.require_mutable("delete point")?;
        self.lock_cache()?.remove(id)?;
        self.erase(TableKind::Points, id, "delete point")
    }

    /// Store a way, replacing any earlier version. Node order is kept.
    ///
    /// # Errors
    /// Returns [`MiddleError::Encode`] for unencodable tags or attributes, and
    /// storage errors from the backing store.
    pub fn way_set(&self, way: &WayRecord) -> Result<(), MiddleError> {
        self.require_mutable("set way")?;
        let values = way_values(way, self.config.extra_attributes)?;
        self.write(TableKind::Ways, way.id, &values, "set way")
    }

    /// Remove a way.
    ///
    /// # Errors
    /// Returns storage errors from the backing store.
    pub fn way_delete(&self, id: PrimitiveId) -> Result<(), MiddleError> {
        self.require_mutable("delete way")?;
        self.erase(TableKind::Ways, id, "delete way")
    }

    /// Store a relation, replacing any earlier version. Member order is kept.
    ///
    /// # Errors
    /// Returns [`MiddleError::Encode`] for unencodable roles, tags or
    /// attributes, and storage errors from the backing store.
    pub fn relation_set(&self, relation: &RelationRecord) -> Result<(), MiddleError> {
        self.require_mutable("set relation")?;
        let values = relation_values(relation, self.config.extra_attributes)?;
        self.write(TableKind::Relations, relation.id, &values, "set relation")
    }

    /// Remove a relation.
    ///
    /// # Errors
    /// Returns storage errors from the backing store.
    pub fn relation_delete(&self, id: PrimitiveId) -> Result<(), MiddleError> {
        self.require_mutable("delete relation")?;
        self.erase(TableKind::Relations, id, "delete relation")
    }

    fn relations_with_member(
        &self,
        kind: MemberKind,
        id: PrimitiveId,
    ) -> Result<Vec<PrimitiveId>, MiddleError> {
        let rows = self.exec(
            TableKind::Relations,
            Statement::RelationsByMember,
            &[Value::from(kind.code()), Value::Integer(id)],
            "look up parent relations",
        )?;
        Ok(id_column(TableKind::Relations, rows)?)
    }

    fn mark_relations(&self, relations: &[PrimitiveId]) -> Result<(), MiddleError> {
        let mut pending = lock(&self.pending, "pending tracker")?;
        for &relation in relations {
            pending.mark_relation(relation);
        }
        Ok(())
    }

    /// Mark every way containing point `id` and every relation with the
    /// point as a member for reprocessing.
    ///
    /// # Errors
    /// Returns [`MiddleError::WrongMode`] outside append runs and storage
    /// errors from the reverse lookups.
    pub fn point_changed(&self, id: PrimitiveId) -> Result<(), MiddleError> {
        self.require_changes("mark point changed")?;
        let rows = self.exec(
            TableKind::Ways,
            Statement::WaysByNode,
            &[Value::Integer(id)],
            "look up parent ways",
        )?;
        let ways = id_column(TableKind::Ways, rows)?;
        let relations = self.relations_with_member(MemberKind::Point, id)?;
        {
            let mut pending = lock(&self.pending, "pending tracker")?;
            for &way in &ways {
                pending.mark_way(way);
            }
        }
        self.mark_relations(&relations)?;
        debug!(
            "point {id} changed: {} ways and {} relations pending",
            ways.len(),
            relations.len()
        );
        Ok(())
    }

    /// Mark every relation using way `id` for reprocessing.
    ///
    /// # Errors
    /// As for [`Self::point_changed`].
    pub fn way_changed(&self, id: PrimitiveId) -> Result<(), MiddleError> {
        self.require_changes("mark way changed")?;
        let relations = self.relations_with_member(MemberKind::Way, id)?;
        self.mark_relations(&relations)
    }

    /// Mark every relation having relation `id` as a member for
    /// reprocessing.
    ///
    /// # Errors
    /// As for [`Self::point_changed`].
    pub fn relation_changed(&self, id: PrimitiveId) -> Result<(), MiddleError> {
        self.require_changes("mark relation changed")?;
        let relations = self.relations_with_member(MemberKind::Relation, id)?;
        self.mark_relations(&relations)
    }

    /// Ways and relations currently awaiting reprocessing.
    ///
    /// # Errors
    /// Returns [`MiddleError::Poisoned`] if the tracker lock was poisoned.
    pub fn pending_count(&self) -> Result<(usize, usize), MiddleError> {
        lock(&self.pending, "pending tracker").map(|pending| pending.pending_count())
    }

    fn iterate<F, E>(
        &self,
        kind: &'static str,
        next: fn(&mut PendingTracker) -> Option<PrimitiveId>,
        remark: fn(&mut PendingTracker, PrimitiveId) -> bool,
        mut process: F,
    ) -> Result<usize, MiddleError>
    where
        F: FnMut(PrimitiveId) -> Result<(), E>,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let mut processed = 0;
        loop {
            let Some(id) = next(&mut *lock(&self.pending, "pending tracker")?) else {
                break;
            };
            if let Err(err) = process(id) {
                let _ = remark(&mut *lock(&self.pending, "pending tracker")?, id);
                return Err(MiddleError::Processor {
                    kind,
                    id,
                    source: err.into(),
                });
            }
            processed += 1;
        }
        info!("reprocessed {processed} pending {kind}s");
        Ok(processed)
    }

    /// Drain pending ways in ascending id order, calling `process` for each.
    ///
    /// Stops at the first failing id, which stays pending so a later call
    /// resumes from it. Returns how many ids were processed.
    ///
    /// # Errors
    /// Returns [`MiddleError::Processor`] wrapping the callback's error.
    pub fn iterate_ways<F, E>(&self, process: F) -> Result<usize, MiddleError>
    where
        F: FnMut(PrimitiveId) -> Result<(), E>,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        self.iterate(
            "way",
            PendingTracker::next_way,
            PendingTracker::mark_way,
            process,
        )
    }

    /// Drain pending relations in ascending id order. See
    /// [`Self::iterate_ways`].
    ///
    /// # Errors
    /// Returns [`MiddleError::Processor`] wrapping the callback's error.
    pub fn iterate_relations<F, E>(&self, process: F) -> Result<usize, MiddleError>
    where
        F: FnMut(PrimitiveId) -> Result<(), E>,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        self.iterate(
            "relation",
            PendingTracker::next_relation,
            PendingTracker::mark_relation,
            process,
        )
    }

    /// Make everything written so far durable: a flush barrier on the write
    /// channel plus a sync of the overflow tier.
    ///
    /// # Errors
    /// Surfaces the first writer failure, or an overflow sync failure.
    pub fn commit(&self) -> Result<(), MiddleError> {
        if let Some(channel) = &self.channel {
            channel.flush_barrier()?;
        }
        self.lock_cache()?.sync()?;
        Ok(())
    }

    /// End the bulk phase: flush, build the deferred indexes, enter `Ready`.
    ///
    /// # Errors
    /// Returns [`MiddleError::InvalidState`] outside `Loading`, writer
    /// failures from the flush, and [`MiddleError::Schema`] for index DDL.
    pub fn build_indexes(&self) -> Result<(), MiddleError> {
        let state = self.state()?;
        if state != StoreState::Loading {
            return Err(MiddleError::InvalidState {
                operation: "build indexes",
                state,
            });
        }
        self.commit()?;
        self.set_state(StoreState::IndexBuilding)?;
        let started = Instant::now();
        {
            let mut mutations = lock(&self.mutations, "mutation connection")?;
            for table in self.tables.iter() {
                for sql in table.index_ddl() {
                    mutations
                        .execute_ddl(&sql)
                        .map_err(|source| MiddleError::Schema {
                            step: "build indexes",
                            source,
                        })?;
                }
                debug!("indexed {}", table.name());
            }
        }
        self.set_state(StoreState::Ready)?;
        info!("middle indexes built in {:.2?}", started.elapsed());
        Ok(())
    }

    /// Refresh the backing store's planner statistics.
    ///
    /// # Errors
    /// Returns [`MiddleError::Backing`] when the store rejects the request.
    pub fn analyze(&self) -> Result<(), MiddleError> {
        let mut mutations = lock(&self.mutations, "mutation connection")?;
        for table in self.tables.iter() {
            for sql in table.analyze_ddl() {
                mutations
                    .execute_ddl(&sql)
                    .map_err(|source| MiddleError::Backing {
                        operation: "analyze tables",
                        source,
                    })?;
            }
        }
        Ok(())
    }

    /// Finish the run.
    ///
    /// A create run still `Loading` has its indexes built first unless
    /// `drop_temp` is set, in which case the middle tables are dropped once
    /// the writer has drained.
    ///
    /// # Errors
    /// Returns [`MiddleError::InvalidState`] when already stopped, the first
    /// writer failure, and schema or cache errors from teardown.
    pub fn stop(&self) -> Result<StopSummary, MiddleError> {
        let state = self.state()?;
        if state == StoreState::Stopped {
            return Err(MiddleError::InvalidState {
                operation: "stop",
                state,
            });
        }
        if state == StoreState::Loading && !self.config.drop_temp {
            self.build_indexes()?;
        }
        let writer = match &self.channel {
            Some(channel) => Some(channel.stop()?),
            None => None,
        };
        if self.config.drop_temp {
            let mut mutations = lock(&self.mutations, "mutation connection")?;
            for table in self.tables.iter() {
                for sql in table.drop_ddl() {
                    mutations
                        .execute_ddl(&sql)
                        .map_err(|source| MiddleError::Schema {
                            step: "drop tables",
                            source,
                        })?;
                }
            }
            info!("dropped middle tables");
        }
        let cache = {
            let mut cache = self.lock_cache()?;
            cache.sync()?;
            cache.stats()
        };
        self.set_state(StoreState::Stopped)?;
        info!(
            "middle store stopped: {} coordinates in RAM, {} overflow records",
            cache.ram_entries, cache.overflow_records
        );
        Ok(StopSummary { writer, cache })
    }

    /// Current coordinate cache counters.
    ///
    /// # Errors
    /// Returns [`MiddleError::Poisoned`] if the cache lock was poisoned.
    pub fn cache_stats(&self) -> Result<CacheStats, MiddleError> {
        self.lock_cache().map(|cache| cache.stats())
    }

    /// Open a read-only view on its own backing store connection.
    ///
    /// # Errors
    /// Returns [`MiddleError::InvalidState`] before the store is `Ready`, and
    /// [`MiddleError::Backing`] when the connection cannot be opened.
    pub fn query_view(&self) -> Result<QueryView<'_, C>, MiddleError> {
        let state = self.state()?;
        if state != StoreState::Ready {
            return Err(MiddleError::InvalidState {
                operation: "query",
                state,
            });
        }
        QueryView::new(self)
    }
}
