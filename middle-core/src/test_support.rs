//! Recording `BackingStore` fake used by unit and behaviour tests.
//!
//! Every call is appended to a shared log so tests can assert the exact order
//! in which the write channel reached the collaborator. Failures can be
//! injected at a chosen row to exercise the channel's error path.

use std::sync::{Arc, Mutex, PoisonError};

use crate::backing::{BackingStore, BackingStoreError, Connector, Row, Value};
use crate::table::CopyTarget;

/// One observed collaborator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// `execute_ddl`.
    Ddl(String),
    /// `bulk_stream_begin` for a table.
    Begin(String),
    /// `bulk_stream_row` into a table.
    Row(String, Vec<u8>),
    /// `bulk_stream_end` for a table.
    End(String),
    /// `prepare` of a named statement.
    Prepare(String),
    /// `exec_prepared` with parameters.
    Exec(String, Vec<Value>),
}

#[derive(Debug, Default)]
struct Shared {
    calls: Vec<Call>,
    fail_at_row: Option<usize>,
    rows_seen: usize,
}

/// Handle onto the log shared by every store a [`RecordingConnector`] opens.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    shared: Arc<Mutex<Shared>>,
}

impl CallLog {
    fn with<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> R {
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut shared)
    }

    /// Snapshot of every call so far.
    pub fn calls(&self) -> Vec<Call> {
        self.with(|shared| shared.calls.clone())
    }

    /// Bytes streamed into `table`, in arrival order.
    pub fn rows_for(&self, table: &str) -> Vec<Vec<u8>> {
        self.with(|shared| {
            shared
                .calls
                .iter()
                .filter_map(|call| match call {
                    Call::Row(name, bytes) if name == table => Some(bytes.clone()),
                    _ => None,
                })
                .collect()
        })
    }

    /// Make the `n`th streamed row (zero-based, across all tables) fail.
    pub fn fail_at_row(&self, n: usize) {
        self.with(|shared| shared.fail_at_row = Some(n));
    }
}

/// Fake connection that records calls instead of storing data.
#[derive(Debug)]
pub struct RecordingStore {
    log: CallLog,
    stream: Option<String>,
    rows: u64,
}

impl RecordingStore {
    /// Create a store appending to `log`.
    pub const fn new(log: CallLog) -> Self {
        Self {
            log,
            stream: None,
            rows: 0,
        }
    }
}

impl BackingStore for RecordingStore {
    fn execute_ddl(&mut self, sql: &str) -> Result<(), BackingStoreError> {
        self.log.with(|shared| shared.calls.push(Call::Ddl(sql.to_owned())));
        Ok(())
    }

    fn bulk_stream_begin(&mut self, target: &CopyTarget) -> Result<(), BackingStoreError> {
        if let Some(table) = &self.stream {
            return Err(BackingStoreError::StreamAlreadyActive {
                table: table.clone(),
            });
        }
        self.stream = Some(target.table.clone());
        self.rows = 0;
        self.log
            .with(|shared| shared.calls.push(Call::Begin(target.table.clone())));
        Ok(())
    }

    fn bulk_stream_row(&mut self, row: &[u8]) -> Result<(), BackingStoreError> {
        let table = self
            .stream
            .clone()
            .ok_or(BackingStoreError::NoActiveStream)?;
        self.log.with(|shared| {
            let index = shared.rows_seen;
            shared.rows_seen += 1;
            if shared.fail_at_row == Some(index) {
                return Err(BackingStoreError::Backend {
                    message: format!("injected failure at row {index}"),
                });
            }
            shared.calls.push(Call::Row(table, row.to_vec()));
            Ok(())
        })?;
        self.rows += 1;
        Ok(())
    }

    fn bulk_stream_end(&mut self) -> Result<u64, BackingStoreError> {
        let table = self.stream.take().ok_or(BackingStoreError::NoActiveStream)?;
        self.log.with(|shared| shared.calls.push(Call::End(table)));
        Ok(std::mem::take(&mut self.rows))
    }

    fn prepare(&mut self, name: &str, _sql: &str) -> Result<(), BackingStoreError> {
        self.log
            .with(|shared| shared.calls.push(Call::Prepare(name.to_owned())));
        Ok(())
    }

    fn exec_prepared(
        &mut self,
        name: &str,
        params: &[Value],
    ) -> Result<Vec<Row>, BackingStoreError> {
        self.log
            .with(|shared| shared.calls.push(Call::Exec(name.to_owned(), params.to_vec())));
        Ok(Vec::new())
    }
}

/// Connector handing out [`RecordingStore`]s that share one [`CallLog`].
#[derive(Debug, Clone, Default)]
pub struct RecordingConnector {
    log: CallLog,
}

impl RecordingConnector {
    /// Create a connector with an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared call log.
    pub fn log(&self) -> CallLog {
        self.log.clone()
    }
}

impl Connector for RecordingConnector {
    type Store = RecordingStore;

    fn connect(&self) -> Result<Self::Store, BackingStoreError> {
        Ok(RecordingStore::new(self.log.clone()))
    }

    fn describe(&self) -> String {
        "recording fake".to_owned()
    }
}
