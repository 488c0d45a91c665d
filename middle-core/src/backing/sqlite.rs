//! SQLite implementation of the backing store collaborator.
//!
//! Bulk streams map onto one `BEGIN IMMEDIATE … COMMIT` transaction of cached
//! `INSERT OR REPLACE` statements, which is the fastest row-at-a-time load
//! path SQLite offers. Prepared statements are registered by name and compiled
//! through the connection's statement cache on first use.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use log::debug;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, ToSql, params_from_iter};

use crate::table::{CopyTarget, decode_copy_row};

use super::{BackingStore, BackingStoreError, Connector, Row, Value};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);
const STATEMENT_CACHE_CAPACITY: usize = 64;

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Self::Integer(value) => ToSqlOutput::Borrowed(ValueRef::Integer(*value)),
            Self::Text(value) => ToSqlOutput::Borrowed(ValueRef::Text(value.as_bytes())),
        })
    }
}

fn value_from_ref(cell: ValueRef<'_>) -> Value {
    match cell {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(value) => Value::Integer(value),
        ValueRef::Real(value) => Value::Text(value.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

/// Opens [`SqliteBackingStore`] connections to one database file.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: Utf8PathBuf,
    busy_timeout: Duration,
}

impl SqliteConnector {
    /// Target the database at `path`, creating it on first connect.
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    /// Override how long a connection waits on a locked database.
    #[must_use]
    pub const fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Database location.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Connector for SqliteConnector {
    type Store = SqliteBackingStore;

    fn connect(&self) -> Result<Self::Store, BackingStoreError> {
        SqliteBackingStore::open(&self.path, self.busy_timeout)
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path)
    }
}

struct ActiveStream {
    target: CopyTarget,
    insert_sql: String,
    rows: u64,
}

/// One SQLite connection speaking the backing store protocol.
pub struct SqliteBackingStore {
    connection: Connection,
    statements: HashMap<String, String>,
    stream: Option<ActiveStream>,
}

impl fmt::Debug for SqliteBackingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteBackingStore")
            .field("path", &self.connection.path())
            .field("statements", &self.statements.len())
            .field("stream", &self.stream.as_ref().map(|s| s.target.table.as_str()))
            .finish_non_exhaustive()
    }
}

impl SqliteBackingStore {
    /// Open `path` in WAL mode so the writer and readers do not block each
    /// other.
    pub fn open(path: &Utf8Path, busy_timeout: Duration) -> Result<Self, BackingStoreError> {
        middle_fs::ensure_parent_dir(path).map_err(|err| BackingStoreError::Connect {
            location: path.to_string(),
            message: err.to_string(),
        })?;
        let connection =
            Connection::open(path.as_std_path()).map_err(|err| BackingStoreError::Connect {
                location: path.to_string(),
                message: err.to_string(),
            })?;
        connection.busy_timeout(busy_timeout)?;
        let mode: String =
            connection.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        connection.pragma_update(None, "synchronous", "NORMAL")?;
        connection.pragma_update(None, "recursive_triggers", true)?;
        connection.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
        debug!("opened sqlite backing store at {path} (journal mode {mode})");
        Ok(Self {
            connection,
            statements: HashMap::new(),
            stream: None,
        })
    }

    fn insert_sql(target: &CopyTarget) -> String {
        let fields = target
            .columns
            .iter()
            .map(|column| column.name)
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=target.columns.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT OR REPLACE INTO {} ({fields}) VALUES ({placeholders})",
            target.table
        )
    }
}

impl BackingStore for SqliteBackingStore {
    fn execute_ddl(&mut self, sql: &str) -> Result<(), BackingStoreError> {
        self.connection.execute_batch(sql)?;
        Ok(())
    }

    fn bulk_stream_begin(&mut self, target: &CopyTarget) -> Result<(), BackingStoreError> {
        if let Some(active) = &self.stream {
            return Err(BackingStoreError::StreamAlreadyActive {
                table: active.target.table.clone(),
            });
        }
        self.connection.execute_batch("BEGIN IMMEDIATE")?;
        self.stream = Some(ActiveStream {
            target: target.clone(),
            insert_sql: Self::insert_sql(target),
            rows: 0,
        });
        Ok(())
    }

    fn bulk_stream_row(&mut self, row: &[u8]) -> Result<(), BackingStoreError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or(BackingStoreError::NoActiveStream)?;
        let values = decode_copy_row(row, &stream.target).map_err(|reason| {
            BackingStoreError::MalformedRow {
                table: stream.target.table.clone(),
                reason,
            }
        })?;
        let mut statement = self.connection.prepare_cached(&stream.insert_sql)?;
        statement.execute(params_from_iter(values.iter()))?;
        stream.rows += 1;
        Ok(())
    }

    fn bulk_stream_end(&mut self) -> Result<u64, BackingStoreError> {
        let stream = self.stream.take().ok_or(BackingStoreError::NoActiveStream)?;
        self.connection.execute_batch("COMMIT")?;
        Ok(stream.rows)
    }

    fn prepare(&mut self, name: &str, sql: &str) -> Result<(), BackingStoreError> {
        self.statements.insert(name.to_owned(), sql.to_owned());
        Ok(())
    }

    fn exec_prepared(
        &mut self,
        name: &str,
        params: &[Value],
    ) -> Result<Vec<Row>, BackingStoreError> {
        let sql = self
            .statements
            .get(name)
            .ok_or_else(|| BackingStoreError::UnknownStatement {
                name: name.to_owned(),
            })?;
        let mut statement = self.connection.prepare_cached(sql)?;
        let width = statement.column_count();
        let mut rows = statement.query(params_from_iter(params.iter()))?;
        let mut collected = Vec::new();
        while let Some(row) = rows.next()? {
            let mut cells = Vec::with_capacity(width);
            for index in 0..width {
                cells.push(value_from_ref(row.get_ref(index)?));
            }
            collected.push(cells);
        }
        Ok(collected)
    }
}
