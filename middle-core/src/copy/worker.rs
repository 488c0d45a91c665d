//! The dedicated writer thread behind [`super::BulkWriteChannel`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};

use log::{debug, error};

use crate::backing::{BackingStore, BackingStoreError, Value};
use crate::model::PrimitiveId;
use crate::table::{Statement, TableKind, TableSet};

use super::{WriteError, WriterConfig, WriterStats};

/// One buffered write.
#[derive(Debug)]
pub(super) enum Op {
    Row(Vec<u8>),
    Delete(PrimitiveId),
}

/// Consecutive writes for one table, applied in order.
#[derive(Debug)]
pub(super) struct Batch {
    table: TableKind,
    ops: Vec<Op>,
    bytes: usize,
}

impl Batch {
    pub(super) const fn new(table: TableKind) -> Self {
        Self {
            table,
            ops: Vec::new(),
            bytes: 0,
        }
    }

    pub(super) fn push(&mut self, op: Op) {
        if let Op::Row(row) = &op {
            self.bytes += row.len();
        }
        self.ops.push(op);
    }

    pub(super) fn is_full(&self, config: &WriterConfig) -> bool {
        self.ops.len() >= config.batch_rows || self.bytes >= config.batch_bytes
    }

    pub(super) fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Move the buffered writes out, leaving an empty batch behind.
    pub(super) fn take(&mut self) -> Self {
        let table = self.table;
        std::mem::replace(self, Self::new(table))
    }
}

pub(super) enum Command {
    Batch(Batch),
    Barrier(SyncSender<Result<(), WriteError>>),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Batch(batch) => f
                .debug_struct("Batch")
                .field("table", &batch.table)
                .field("ops", &batch.ops.len())
                .finish(),
            Self::Barrier(_) => f.write_str("Barrier"),
        }
    }
}

pub(super) struct Writer<S> {
    store: S,
    tables: TableSet,
    open: Option<TableKind>,
    stats: WriterStats,
    failure: Option<WriteError>,
    reported: bool,
    failed: Arc<AtomicBool>,
}

impl<S: BackingStore> Writer<S> {
    pub(super) const fn new(store: S, tables: TableSet, failed: Arc<AtomicBool>) -> Self {
        Self {
            store,
            tables,
            open: None,
            stats: WriterStats {
                committed_rows: [0; 3],
                deletes: [0; 3],
                batches: 0,
            },
            failure: None,
            reported: false,
            failed,
        }
    }

    /// Consume commands until every sender is gone.
    pub(super) fn run(mut self, commands: &Receiver<Command>) -> WriterStats {
        while let Ok(command) = commands.recv() {
            match command {
                Command::Batch(batch) => self.apply(batch),
                Command::Barrier(ack) => {
                    let outcome = self.barrier();
                    // The requester may have given up waiting; nothing to do.
                    let _ = ack.send(outcome);
                }
            }
        }
        if self.failure.is_none() && !self.reported {
            if let Err(err) = self.close_stream() {
                self.record(err);
            }
        }
        if let Some(err) = self.failure.take() {
            error!("bulk writer exiting with an unreported failure: {err}");
        }
        self.stats
    }

    fn apply(&mut self, batch: Batch) {
        if self.failure.is_some() || self.reported {
            debug!(
                "discarding {} queued writes for {} after an earlier failure",
                batch.ops.len(),
                batch.table
            );
            return;
        }
        self.stats.batches += 1;
        debug!("writing batch of {} ops for {}", batch.ops.len(), batch.table);
        for op in batch.ops {
            let outcome = match op {
                Op::Row(row) => self.stream_row(batch.table, &row),
                Op::Delete(id) => self.delete(batch.table, id),
            };
            if let Err(err) = outcome {
                self.record(err);
                return;
            }
        }
    }

    fn barrier(&mut self) -> Result<(), WriteError> {
        if let Some(err) = self.failure.take() {
            self.reported = true;
            return Err(err);
        }
        if self.reported {
            return Err(WriteError::Aborted);
        }
        if let Err(err) = self.close_stream() {
            self.record(err);
            self.reported = true;
            return Err(self.failure.take().unwrap_or(WriteError::Aborted));
        }
        Ok(())
    }

    fn record(&mut self, err: WriteError) {
        error!("bulk writer failed, discarding further writes: {err}");
        self.failed.store(true, Ordering::Release);
        self.failure = Some(err);
    }

    fn stream_error(
        &self,
        table: TableKind,
        operation: &'static str,
        source: BackingStoreError,
    ) -> WriteError {
        WriteError::Stream {
            table: self.tables.get(table).name().to_owned(),
            operation,
            committed_rows: self.stats.committed(table),
            source,
        }
    }

    fn stream_row(&mut self, table: TableKind, row: &[u8]) -> Result<(), WriteError> {
        if self.open != Some(table) {
            self.close_stream()?;
            let target = self.tables.get(table).copy_target();
            self.store
                .bulk_stream_begin(&target)
                .map_err(|source| self.stream_error(table, "begin stream", source))?;
            self.open = Some(table);
        }
        self.store
            .bulk_stream_row(row)
            .map_err(|source| self.stream_error(table, "stream row", source))
    }

    fn close_stream(&mut self) -> Result<(), WriteError> {
        let Some(table) = self.open.take() else {
            return Ok(());
        };
        let rows = self
            .store
            .bulk_stream_end()
            .map_err(|source| self.stream_error(table, "end stream", source))?;
        self.stats.add_committed(table, rows);
        debug!("committed {rows} rows into {}", self.tables.get(table).name());
        Ok(())
    }

    fn delete(&mut self, table: TableKind, id: PrimitiveId) -> Result<(), WriteError> {
        self.close_stream()?;
        let name = self.tables.get(table).statement_name(Statement::Delete);
        self.store
            .exec_prepared(&name, &[Value::Integer(id)])
            .map_err(|source| self.stream_error(table, "delete row", source))?;
        self.stats.add_delete(table);
        Ok(())
    }
}
