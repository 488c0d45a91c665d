//! Values the middle store is configured with.

use std::fmt;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::AllocationStrategy;
use crate::copy::WriterConfig;

const DEFAULT_CACHE_BYTES: usize = 800 * 1024 * 1024;
const DEFAULT_TABLE_PREFIX: &str = "planet_osm";

/// Whether a run loads a fresh dataset or applies changes to a loaded one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    /// Recreate the tables and bulk-load them; indexes are built at the end.
    #[default]
    Create,
    /// Update already indexed tables row by row.
    Append,
}

impl fmt::Display for ImportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Append => "append",
        })
    }
}

/// Configuration consumed by [`super::MiddleStore::open`].
///
/// Every field has a default, so partial documents deserialise cleanly.
///
/// # Examples
/// ```
/// use middle_core::{AllocationStrategy, ImportMode, MiddleConfig};
///
/// let config: MiddleConfig =
///     serde_json::from_str(r#"{"allocation": "optimized", "mode": "append"}"#)
///         .expect("valid config");
/// assert_eq!(config.allocation, AllocationStrategy::Combined);
/// assert_eq!(config.mode, ImportMode::Append);
/// assert_eq!(config.table_prefix, "planet_osm");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddleConfig {
    /// Allocation strategy of the RAM coordinate tier.
    pub allocation: AllocationStrategy,
    /// Byte budget of the RAM coordinate tier.
    pub cache_bytes: usize,
    /// Create or append run.
    pub mode: ImportMode,
    /// Prefix of every table name.
    pub table_prefix: String,
    /// Persistent overflow file. An anonymous temporary file is used when
    /// absent, which cannot be resumed by a later append run.
    pub overflow_path: Option<Utf8PathBuf>,
    /// Persist version, timestamp, changeset and user attributes.
    pub extra_attributes: bool,
    /// Drop the middle tables at [`super::MiddleStore::stop`] instead of
    /// indexing them.
    pub drop_temp: bool,
    /// Bulk write channel thresholds.
    pub writer: WriterConfig,
}

impl Default for MiddleConfig {
    fn default() -> Self {
        Self {
            allocation: AllocationStrategy::default(),
            cache_bytes: DEFAULT_CACHE_BYTES,
            mode: ImportMode::default(),
            table_prefix: DEFAULT_TABLE_PREFIX.to_owned(),
            overflow_path: None,
            extra_attributes: false,
            drop_temp: false,
            writer: WriterConfig::default(),
        }
    }
}

/// A configuration value the store cannot work with.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The table prefix is empty or not a plain SQL identifier.
    #[error("table prefix '{prefix}' must be a non-empty identifier of letters, digits and '_'")]
    InvalidPrefix {
        /// Rejected prefix.
        prefix: String,
    },
    /// A writer threshold was zero.
    #[error("writer {field} must be greater than zero")]
    ZeroThreshold {
        /// Offending field.
        field: &'static str,
    },
}

impl MiddleConfig {
    /// Check the values that would otherwise fail deep inside the store.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidPrefix`] when the prefix could not be
    /// spliced into SQL safely and [`ConfigError::ZeroThreshold`] when a
    /// batch threshold is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_identifier(&self.table_prefix) {
            return Err(ConfigError::InvalidPrefix {
                prefix: self.table_prefix.clone(),
            });
        }
        if self.writer.batch_rows == 0 {
            return Err(ConfigError::ZeroThreshold {
                field: "batch_rows",
            });
        }
        if self.writer.batch_bytes == 0 {
            return Err(ConfigError::ZeroThreshold {
                field: "batch_bytes",
            });
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
