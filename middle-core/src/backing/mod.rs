//! Collaborator interface onto the relational backing store.
//!
//! The middle layer only needs three capabilities from the store: DDL
//! execution, a bulk row-copy stream, and named prepared statements. Each
//! [`BackingStore`] value is one connection; a [`Connector`] opens further
//! independent connections for the writer thread and for query views.

use thiserror::Error;

use crate::table::CopyTarget;

#[cfg(feature = "store-sqlite")]
mod sqlite;

#[cfg(feature = "store-sqlite")]
pub use sqlite::{SqliteBackingStore, SqliteConnector};

/// Parameter or result cell exchanged with prepared statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// SQL `NULL`.
    Null,
    /// 64-bit signed integer.
    Integer(i64),
    /// UTF-8 text.
    Text(String),
}

impl Value {
    /// Integer payload, if this is an integer cell.
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Text payload, if this is a text cell.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    /// Whether this is `NULL`.
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// One result row.
pub type Row = Vec<Value>;

/// Errors surfaced by a backing store connection.
#[derive(Debug, Error)]
pub enum BackingStoreError {
    /// SQLite reported a failure.
    #[cfg(feature = "store-sqlite")]
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    /// Opening a connection failed.
    #[error("failed to connect to backing store at {location}: {message}")]
    Connect {
        /// Database location.
        location: String,
        /// Description of the failure.
        message: String,
    },
    /// A statement was executed before being prepared.
    #[error("prepared statement '{name}' is not registered")]
    UnknownStatement {
        /// Name the caller used.
        name: String,
    },
    /// A row or end marker arrived with no stream open.
    #[error("no bulk stream is active")]
    NoActiveStream,
    /// A stream was opened while another was still active.
    #[error("bulk stream into {table} is already active")]
    StreamAlreadyActive {
        /// Table of the open stream.
        table: String,
    },
    /// A streamed row did not match the target's column layout.
    #[error("malformed row for {table}: {reason}")]
    MalformedRow {
        /// Target table.
        table: String,
        /// What was wrong with it.
        reason: String,
    },
    /// Any other backend-specific failure.
    #[error("backing store failure: {message}")]
    Backend {
        /// Description of the failure.
        message: String,
    },
}

/// One connection to the backing store.
///
/// Implementations are moved onto the writer thread, hence the `Send` bound.
pub trait BackingStore: Send {
    /// Run a schema statement synchronously.
    fn execute_ddl(&mut self, sql: &str) -> Result<(), BackingStoreError>;

    /// Open a bulk row-copy stream into `target`.
    fn bulk_stream_begin(&mut self, target: &CopyTarget) -> Result<(), BackingStoreError>;

    /// Append one encoded row to the open stream.
    fn bulk_stream_row(&mut self, row: &[u8]) -> Result<(), BackingStoreError>;

    /// Finish the open stream, making its rows durable. Returns the number of
    /// rows committed by this stream.
    fn bulk_stream_end(&mut self) -> Result<u64, BackingStoreError>;

    /// Register `sql` under `name` for later execution.
    fn prepare(&mut self, name: &str, sql: &str) -> Result<(), BackingStoreError>;

    /// Execute a registered statement and collect every result row.
    fn exec_prepared(&mut self, name: &str, params: &[Value]) -> Result<Vec<Row>, BackingStoreError>;
}

/// Factory for independent [`BackingStore`] connections.
pub trait Connector: Send + Sync {
    /// Connection type produced by this connector.
    type Store: BackingStore + 'static;

    /// Open a new connection.
    fn connect(&self) -> Result<Self::Store, BackingStoreError>;

    /// Human-readable description of the target, used in log lines.
    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Value::from(7_i64), Some(7), None)]
    #[case(Value::from("x"), None, Some("x"))]
    #[case(Value::from(None::<i64>), None, None)]
    fn value_accessors_match_variant(
        #[case] value: Value,
        #[case] integer: Option<i64>,
        #[case] text: Option<&str>,
    ) {
        assert_eq!(value.as_i64(), integer);
        assert_eq!(value.as_str(), text);
        assert_eq!(value.is_null(), integer.is_none() && text.is_none());
    }
}
