//! Asynchronous, table-oriented bulk write pipeline.
//!
//! Producers append rows to per-table buffers. A full buffer is handed to a
//! single writer thread over a bounded queue while the table's buffer lock is
//! still held, so batches of one table enter the queue in enqueue order and a
//! full queue blocks producers. The writer owns its own backing store
//! connection and keeps one bulk stream open at a time, ending it whenever
//! the next batch targets another table, a delete arrives, or a flush barrier
//! is reached.
//!
//! Ordering guarantee: FIFO per table across all producers. Nothing is
//! guaranteed between tables except at a barrier.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{SyncSender, sync_channel};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backing::{BackingStore, BackingStoreError};
use crate::model::PrimitiveId;
use crate::table::{CopyRow, TableKind, TableSet};

mod worker;

use worker::{Batch, Command, Op, Writer};

/// Batch and queue thresholds for the write channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Rows buffered per table before a batch is handed to the writer.
    pub batch_rows: usize,
    /// Encoded bytes buffered per table before a batch is handed over.
    pub batch_bytes: usize,
    /// Batches that may wait for the writer before producers block.
    pub queue_depth: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_rows: 10_000,
            batch_bytes: 4 * 1024 * 1024,
            queue_depth: 4,
        }
    }
}

/// Counters reported when the writer stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    committed_rows: [u64; 3],
    deletes: [u64; 3],
    /// Batches applied.
    pub batches: u64,
}

impl WriterStats {
    /// Rows durably committed into `table`.
    pub const fn committed(&self, table: TableKind) -> u64 {
        match table {
            TableKind::Points => self.committed_rows[0],
            TableKind::Ways => self.committed_rows[1],
            TableKind::Relations => self.committed_rows[2],
        }
    }

    /// Deletes executed against `table`.
    pub const fn deleted(&self, table: TableKind) -> u64 {
        match table {
            TableKind::Points => self.deletes[0],
            TableKind::Ways => self.deletes[1],
            TableKind::Relations => self.deletes[2],
        }
    }

    fn add_committed(&mut self, table: TableKind, rows: u64) {
        if let Some(slot) = self.committed_rows.get_mut(table.index()) {
            *slot += rows;
        }
    }

    fn add_delete(&mut self, table: TableKind) {
        if let Some(slot) = self.deletes.get_mut(table.index()) {
            *slot += 1;
        }
    }
}

/// Errors surfaced by the write channel.
#[derive(Debug, Error)]
pub enum WriteError {
    /// The backing store rejected part of a bulk stream. Fatal for the
    /// channel.
    #[error(
        "failed to {operation} for table {table} after {committed_rows} rows were committed: {source}"
    )]
    Stream {
        /// Table being written.
        table: String,
        /// Operation that failed.
        operation: &'static str,
        /// Rows of this table committed before the failure.
        committed_rows: u64,
        /// Underlying store error.
        #[source]
        source: BackingStoreError,
    },
    /// An earlier failure was already reported; further work is refused.
    #[error("write channel aborted by an earlier failure")]
    Aborted,
    /// The channel has been stopped.
    #[error("write channel is stopped")]
    Stopped,
    /// The writer thread exited unexpectedly.
    #[error("writer thread is no longer running")]
    Disconnected,
    /// The writer thread panicked.
    #[error("writer thread panicked")]
    WriterPanicked,
    /// Spawning the writer thread failed.
    #[error("failed to spawn writer thread: {source}")]
    Spawn {
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// A producer panicked while holding a channel lock.
    #[error("{what} lock poisoned")]
    Poisoned {
        /// Which lock.
        what: &'static str,
    },
}

#[derive(Debug)]
struct TableBuffer {
    batch: Batch,
    sender: Option<SyncSender<Command>>,
}

/// Multi-producer, single-writer bulk load channel.
///
/// # Examples
/// ```
/// use camino::Utf8PathBuf;
/// use middle_core::{
///     BackingStore, BulkWriteChannel, Connector, SqliteConnector, TableKind, TableSet,
///     WriterConfig,
/// };
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let dir = tempfile::tempdir()?;
/// let connector = SqliteConnector::new(Utf8PathBuf::try_from(dir.path().join("middle.db"))?);
/// let tables = TableSet::new("osm");
/// let mut store = connector.connect()?;
/// for sql in tables.get(TableKind::Points).create_ddl() {
///     store.execute_ddl(&sql)?;
/// }
///
/// let channel = BulkWriteChannel::start(store, tables, WriterConfig::default())?;
/// channel.enqueue(TableKind::Points, b"1\t0\t0\t\\N".to_vec())?;
/// let stats = channel.stop()?;
/// assert_eq!(stats.committed(TableKind::Points), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct BulkWriteChannel {
    buffers: [Mutex<TableBuffer>; 3],
    control: Mutex<Option<SyncSender<Command>>>,
    handle: Mutex<Option<JoinHandle<WriterStats>>>,
    failed: Arc<AtomicBool>,
    config: WriterConfig,
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &'static str) -> Result<MutexGuard<'a, T>, WriteError> {
    mutex.lock().map_err(|_| WriteError::Poisoned { what })
}

impl BulkWriteChannel {
    /// Spawn the writer thread around `store`.
    ///
    /// The tables' statements are registered on `store` before the thread
    /// starts so deletes can be replayed in stream order.
    pub fn start<S>(mut store: S, tables: TableSet, config: WriterConfig) -> Result<Self, WriteError>
    where
        S: BackingStore + 'static,
    {
        for table in tables.iter() {
            for statement in table.statements() {
                store
                    .prepare(&statement.name, &statement.sql)
                    .map_err(|source| WriteError::Stream {
                        table: table.name().to_owned(),
                        operation: "prepare statements",
                        committed_rows: 0,
                        source,
                    })?;
            }
        }

        let (sender, receiver) = sync_channel(config.queue_depth.max(1));
        let failed = Arc::new(AtomicBool::new(false));
        let writer = Writer::new(store, tables, Arc::clone(&failed));
        let handle = thread::Builder::new()
            .name("middle-writer".into())
            .spawn(move || writer.run(&receiver))
            .map_err(|source| WriteError::Spawn { source })?;
        info!(
            "bulk writer started: batches of {} rows or {} bytes, queue depth {}",
            config.batch_rows, config.batch_bytes, config.queue_depth
        );

        let buffer = |table| {
            Mutex::new(TableBuffer {
                batch: Batch::new(table),
                sender: Some(sender.clone()),
            })
        };
        Ok(Self {
            buffers: TableKind::ALL.map(buffer),
            control: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
            failed,
            config,
        })
    }

    fn buffer(&self, table: TableKind) -> Result<MutexGuard<'_, TableBuffer>, WriteError> {
        let mutex = match table {
            TableKind::Points => &self.buffers[0],
            TableKind::Ways => &self.buffers[1],
            TableKind::Relations => &self.buffers[2],
        };
        lock(mutex, "table buffer")
    }

    fn push(&self, table: TableKind, op: Op) -> Result<(), WriteError> {
        if self.failed.load(Ordering::Acquire) {
            return Err(WriteError::Aborted);
        }
        let mut buffer = self.buffer(table)?;
        if buffer.sender.is_none() {
            return Err(WriteError::Stopped);
        }
        buffer.batch.push(op);
        if buffer.batch.is_full(&self.config) {
            Self::hand_over(&mut buffer)?;
        }
        Ok(())
    }

    /// Send the buffered batch while the caller still holds the table lock.
    fn hand_over(buffer: &mut TableBuffer) -> Result<(), WriteError> {
        if buffer.batch.is_empty() {
            return Ok(());
        }
        let batch = buffer.batch.take();
        let sender = buffer.sender.as_ref().ok_or(WriteError::Stopped)?;
        sender
            .send(Command::Batch(batch))
            .map_err(|_| WriteError::Disconnected)
    }

    /// Append an encoded row for `table`. Blocks while the writer is behind
    /// by more than the configured queue depth.
    pub fn enqueue(&self, table: TableKind, row: Vec<u8>) -> Result<(), WriteError> {
        self.push(table, Op::Row(row))
    }

    /// Append an encoded [`CopyRow`] to its table.
    pub fn enqueue_row(&self, row: CopyRow) -> Result<(), WriteError> {
        let table = row.table();
        self.enqueue(table, row.into_bytes())
    }

    /// Queue a delete of `id` in stream order with `table`'s rows.
    pub fn enqueue_delete(&self, table: TableKind, id: PrimitiveId) -> Result<(), WriteError> {
        self.push(table, Op::Delete(id))
    }

    /// Block until everything enqueued before this call is durable.
    ///
    /// The first writer failure is returned here (or from [`Self::stop`]);
    /// later calls report [`WriteError::Aborted`].
    pub fn flush_barrier(&self) -> Result<(), WriteError> {
        for table in TableKind::ALL {
            let mut buffer = self.buffer(table)?;
            if buffer.sender.is_none() {
                return Err(WriteError::Stopped);
            }
            Self::hand_over(&mut buffer)?;
        }
        let sender = lock(&self.control, "control")?
            .clone()
            .ok_or(WriteError::Stopped)?;
        let (ack, done) = sync_channel(1);
        sender
            .send(Command::Barrier(ack))
            .map_err(|_| WriteError::Disconnected)?;
        done.recv().map_err(|_| WriteError::Disconnected)?
    }

    /// Drain every buffer, wait for the writer to finish, and join it.
    pub fn stop(&self) -> Result<WriterStats, WriteError> {
        let Some(handle) = lock(&self.handle, "writer handle")?.take() else {
            return Err(WriteError::Stopped);
        };
        let flushed = self.flush_barrier();
        for table in TableKind::ALL {
            self.buffer(table)?.sender = None;
        }
        *lock(&self.control, "control")? = None;
        let stats = handle.join().map_err(|_| WriteError::WriterPanicked)?;
        info!(
            "bulk writer stopped: {} point, {} way and {} relation rows committed in {} batches",
            stats.committed(TableKind::Points),
            stats.committed(TableKind::Ways),
            stats.committed(TableKind::Relations),
            stats.batches
        );
        flushed.map(|()| stats)
    }

    /// Whether the writer has hit a fatal error.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

impl Drop for BulkWriteChannel {
    fn drop(&mut self) {
        let running = self
            .handle
            .get_mut()
            .map(|handle| handle.is_some())
            .unwrap_or(false);
        if !running {
            return;
        }
        if let Err(err) = self.stop() {
            warn!("bulk writer dropped without a clean stop: {err}");
        }
    }
}

#[cfg(test)]
mod tests;
