//! Append-only on-disk coordinate store used as the overflow tier.
//!
//! Layout: an 8-byte header (`MOVC` magic, little-endian `u16` version, two
//! reserved bytes) followed by 16-byte records of little-endian
//! `(id: i64, x: i32, y: i32)`. Removals append a record carrying the unset
//! sentinel, so the newest record for an id always wins.
//!
//! The in-memory index has two parts. Runs are stretches of consecutive
//! records with strictly increasing ids, keyed by first id and never
//! overlapping; an ascending import collapses into a handful of them. Records
//! whose id falls inside the span of an existing run go to a per-id override
//! map instead, so interleaved or repeated ids cost one map entry each and a
//! lookup is a map search followed by at most one binary search on disk.
//! The file is scanned once on open to rebuild both parts.

use std::{
    cmp::Ordering,
    collections::BTreeMap,
    io::{self, BufReader, Read, Seek, SeekFrom, Write},
    ops::Bound,
};

use camino::Utf8Path;
use log::{debug, warn};
use middle_fs::Utf8File;
use thiserror::Error;

use crate::model::{Coordinate, PrimitiveId};

/// File identifier for overflow cache files.
pub const OVERFLOW_MAGIC: [u8; 4] = *b"MOVC";

/// Supported version of the overflow cache format.
pub const OVERFLOW_VERSION: u16 = 1;

const HEADER_BYTES: u64 = 8;
const RECORD_BYTES: usize = 16;
const RECORD_BYTES_U64: u64 = 16;
const WRITE_BUFFER_BYTES: usize = 64 * 1024;
const ANONYMOUS_LOCATION: &str = "<anonymous overflow file>";

/// Error emitted by the overflow tier.
#[derive(Debug, Error)]
pub enum OverflowCacheError {
    /// Reading or writing the backing file failed.
    #[error("failed to {operation} overflow cache at {location}: {source}")]
    Io {
        /// Path of the overflow file, or a placeholder for anonymous files.
        location: String,
        /// Operation that failed.
        operation: &'static str,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The file did not start with the expected header.
    #[error("invalid overflow cache magic in {location}: expected {expected:?}, found {found:?}")]
    InvalidMagic {
        /// Path of the overflow file.
        location: String,
        /// Expected byte sequence.
        expected: [u8; 4],
        /// Sequence read from the file.
        found: [u8; 4],
    },
    /// The file uses a format version this build cannot read.
    #[error(
        "unsupported overflow cache version {found} in {location}; supported version is {supported}"
    )]
    UnsupportedVersion {
        /// Path of the overflow file.
        location: String,
        /// Version present in the file header.
        found: u16,
        /// Version written by this build.
        supported: u16,
    },
}

/// A stretch of consecutive records whose ids strictly increase, keyed by
/// its first id.
#[derive(Debug, Clone, Copy)]
struct Run {
    last_id: PrimitiveId,
    start: u64,
    len: u64,
}

/// Where the newest record for an id lives.
#[derive(Debug, Clone, Copy)]
enum Slot {
    /// Search this run.
    Run(Run),
    /// Read this record directly.
    Record(u64),
}

/// Ordered index from ids to record positions.
#[derive(Debug, Default)]
struct RecordIndex {
    runs: BTreeMap<PrimitiveId, Run>,
    overrides: BTreeMap<PrimitiveId, u64>,
    /// First id of the run ending with the newest record, if any.
    tail: Option<PrimitiveId>,
    bounds: Option<(PrimitiveId, PrimitiveId)>,
}

impl RecordIndex {
    /// Register record `index` for `id`. Records must be tracked in file
    /// order.
    fn track(&mut self, id: PrimitiveId, index: u64) {
        self.bounds = Some(match self.bounds {
            Some((low, high)) => (low.min(id), high.max(id)),
            None => (id, id),
        });
        if self.extend_tail(id, index) {
            return;
        }
        if self.run_covering(id).is_some() {
            self.overrides.insert(id, index);
            self.tail = None;
            return;
        }
        self.runs.insert(
            id,
            Run {
                last_id: id,
                start: index,
                len: 1,
            },
        );
        self.tail = Some(id);
    }

    /// Append `id` to the run holding the previous record when that keeps
    /// ids ascending and the run clear of its successor.
    fn extend_tail(&mut self, id: PrimitiveId, index: u64) -> bool {
        let Some(first) = self.tail else {
            return false;
        };
        let successor = self
            .runs
            .range((Bound::Excluded(first), Bound::Unbounded))
            .next()
            .map(|(next, _)| *next);
        if successor.is_some_and(|next| next <= id) {
            return false;
        }
        let Some(run) = self.runs.get_mut(&first) else {
            return false;
        };
        if id <= run.last_id || run.start + run.len != index {
            return false;
        }
        run.last_id = id;
        run.len += 1;
        true
    }

    fn run_covering(&self, id: PrimitiveId) -> Option<Run> {
        self.runs
            .range(..=id)
            .next_back()
            .map(|(_, run)| *run)
            .filter(|run| id <= run.last_id)
    }

    /// Whether `id` lies within the range of ids ever recorded.
    fn may_hold(&self, id: PrimitiveId) -> bool {
        self.bounds.is_some_and(|(low, high)| low <= id && id <= high)
    }

    fn locate(&self, id: PrimitiveId) -> Option<Slot> {
        if !self.may_hold(id) {
            return None;
        }
        if let Some(index) = self.overrides.get(&id) {
            return Some(Slot::Record(*index));
        }
        self.run_covering(id).map(Slot::Run)
    }
}

/// Disk-backed coordinate store with unbounded logical capacity.
///
/// `get` on an id that was never written returns `Ok(None)`.
#[derive(Debug)]
pub struct PersistentOverflowCache {
    file: Utf8File,
    location: String,
    index: RecordIndex,
    pending: Vec<u8>,
    records: u64,
    /// Records already written to the file; later ones sit in `pending`.
    flushed: u64,
}

impl PersistentOverflowCache {
    /// Open or create the overflow file at `path`, rebuilding the run index
    /// from any records already present.
    ///
    /// A truncated trailing record left by an unclean shutdown is discarded.
    pub fn open(path: &Utf8Path) -> Result<Self, OverflowCacheError> {
        let location = path.to_string();
        let file = middle_fs::open_read_write(path).map_err(|source| OverflowCacheError::Io {
            location: location.clone(),
            operation: "open",
            source,
        })?;
        Self::from_file(file, location)
    }

    /// Create an overflow tier backed by an anonymous temporary file that is
    /// removed when the cache is dropped.
    pub fn anonymous() -> Result<Self, OverflowCacheError> {
        let file = tempfile::tempfile().map_err(|source| OverflowCacheError::Io {
            location: ANONYMOUS_LOCATION.to_owned(),
            operation: "create",
            source,
        })?;
        Self::from_file(middle_fs::from_std(file), ANONYMOUS_LOCATION.to_owned())
    }

    fn from_file(file: Utf8File, location: String) -> Result<Self, OverflowCacheError> {
        let mut cache = Self {
            file,
            location,
            index: RecordIndex::default(),
            pending: Vec::with_capacity(WRITE_BUFFER_BYTES),
            records: 0,
            flushed: 0,
        };
        let len = cache
            .file
            .metadata()
            .map_err(cache.io_error("inspect"))?
            .len();
        if len < HEADER_BYTES {
            if len > 0 {
                warn!(
                    "overflow cache {} has a partial header; reinitialising",
                    cache.location
                );
            }
            cache.write_header()?;
            return Ok(cache);
        }
        cache.check_header()?;

        let body = len - HEADER_BYTES;
        let whole_records = body / RECORD_BYTES_U64;
        if body % RECORD_BYTES_U64 != 0 {
            warn!(
                "overflow cache {} ends with a truncated record; discarding {} trailing bytes",
                cache.location,
                body % RECORD_BYTES_U64
            );
            cache
                .file
                .set_len(HEADER_BYTES + whole_records * RECORD_BYTES_U64)
                .map_err(cache.io_error("truncate"))?;
        }
        cache.rebuild_index(whole_records)?;
        debug!(
            "overflow cache {} reopened with {} records in {} runs and {} overrides",
            cache.location,
            cache.records,
            cache.index.runs.len(),
            cache.index.overrides.len()
        );
        Ok(cache)
    }

    fn io_error(&self, operation: &'static str) -> impl FnOnce(io::Error) -> OverflowCacheError {
        let location = self.location.clone();
        move |source| OverflowCacheError::Io {
            location,
            operation,
            source,
        }
    }

    fn write_header(&mut self) -> Result<(), OverflowCacheError> {
        let [m0, m1, m2, m3] = OVERFLOW_MAGIC;
        let [v0, v1] = OVERFLOW_VERSION.to_le_bytes();
        let header = [m0, m1, m2, m3, v0, v1, 0, 0];
        self.file.set_len(0).map_err(self.io_error("reset"))?;
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(self.io_error("seek"))?;
        self.file
            .write_all(&header)
            .map_err(self.io_error("write header"))
    }

    fn check_header(&mut self) -> Result<(), OverflowCacheError> {
        let mut header = [0_u8; 8];
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(self.io_error("seek"))?;
        self.file
            .read_exact(&mut header)
            .map_err(self.io_error("read header"))?;
        let [m0, m1, m2, m3, v0, v1, _, _] = header;
        let found = [m0, m1, m2, m3];
        if found != OVERFLOW_MAGIC {
            return Err(OverflowCacheError::InvalidMagic {
                location: self.location.clone(),
                expected: OVERFLOW_MAGIC,
                found,
            });
        }
        let version = u16::from_le_bytes([v0, v1]);
        if version != OVERFLOW_VERSION {
            return Err(OverflowCacheError::UnsupportedVersion {
                location: self.location.clone(),
                found: version,
                supported: OVERFLOW_VERSION,
            });
        }
        Ok(())
    }

    fn rebuild_index(&mut self, whole_records: u64) -> Result<(), OverflowCacheError> {
        self.file
            .seek(SeekFrom::Start(HEADER_BYTES))
            .map_err(self.io_error("seek"))?;
        let mut ids = Vec::new();
        {
            let mut reader = BufReader::with_capacity(WRITE_BUFFER_BYTES, &mut self.file);
            let mut buf = [0_u8; RECORD_BYTES];
            for _ in 0..whole_records {
                if let Err(source) = reader.read_exact(&mut buf) {
                    return Err(OverflowCacheError::Io {
                        location: self.location.clone(),
                        operation: "scan",
                        source,
                    });
                }
                ids.push(decode_record(&buf).0);
            }
        }
        for id in ids {
            self.track(id);
        }
        self.flushed = self.records;
        Ok(())
    }

    fn track(&mut self, id: PrimitiveId) {
        self.index.track(id, self.records);
        self.records += 1;
    }

    fn append(
        &mut self,
        id: PrimitiveId,
        coordinate: Coordinate,
    ) -> Result<(), OverflowCacheError> {
        self.pending
            .extend_from_slice(&encode_record(id, coordinate));
        self.track(id);
        if self.pending.len() >= WRITE_BUFFER_BYTES {
            self.flush_pending()?;
        }
        Ok(())
    }

    fn flush_pending(&mut self) -> Result<(), OverflowCacheError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.file
            .seek(SeekFrom::End(0))
            .map_err(self.io_error("seek"))?;
        self.file
            .write_all(&self.pending)
            .map_err(self.io_error("append"))?;
        self.pending.clear();
        self.flushed = self.records;
        Ok(())
    }

    fn read_record(
        &mut self,
        index: u64,
    ) -> Result<(PrimitiveId, Option<Coordinate>), OverflowCacheError> {
        if let Some(buf) = self.buffered_record(index) {
            return Ok(decode_record(&buf));
        }
        if index >= self.flushed {
            self.flush_pending()?;
        }
        let mut buf = [0_u8; RECORD_BYTES];
        self.file
            .seek(SeekFrom::Start(HEADER_BYTES + index * RECORD_BYTES_U64))
            .map_err(self.io_error("seek"))?;
        self.file
            .read_exact(&mut buf)
            .map_err(self.io_error("read"))?;
        Ok(decode_record(&buf))
    }

    fn buffered_record(&self, index: u64) -> Option<[u8; RECORD_BYTES]> {
        let slot = usize::try_from(index.checked_sub(self.flushed)?).ok()?;
        let start = slot.checked_mul(RECORD_BYTES)?;
        self.pending
            .get(start..start.checked_add(RECORD_BYTES)?)?
            .try_into()
            .ok()
    }

    /// Binary search a run. `Some(None)` means the newest record there is a
    /// removal.
    fn search_run(
        &mut self,
        run: Run,
        id: PrimitiveId,
    ) -> Result<Option<Option<Coordinate>>, OverflowCacheError> {
        let (mut low, mut high) = (0_u64, run.len);
        while low < high {
            let mid = low + (high - low) / 2;
            let (found, coordinate) = self.read_record(run.start + mid)?;
            match found.cmp(&id) {
                Ordering::Equal => return Ok(Some(coordinate)),
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid,
            }
        }
        Ok(None)
    }

    /// Store `coordinate` for `id`.
    pub fn put(
        &mut self,
        id: PrimitiveId,
        coordinate: Coordinate,
    ) -> Result<(), OverflowCacheError> {
        self.append(id, coordinate)
    }

    /// Look up the newest coordinate recorded for `id`.
    pub fn get(&mut self, id: PrimitiveId) -> Result<Option<Coordinate>, OverflowCacheError> {
        match self.index.locate(id) {
            None => Ok(None),
            Some(Slot::Record(index)) => Ok(self.read_record(index)?.1),
            Some(Slot::Run(run)) => Ok(self.search_run(run, id)?.flatten()),
        }
    }

    /// Whether `id` falls within the range of ids ever written here. A
    /// `false` answer means `get` would return `Ok(None)` without any I/O.
    pub fn may_hold(&self, id: PrimitiveId) -> bool {
        self.index.may_hold(id)
    }

    /// Record a removal for `id`. Returns whether a value was present.
    pub fn remove(&mut self, id: PrimitiveId) -> Result<bool, OverflowCacheError> {
        if self.get(id)?.is_none() {
            return Ok(false);
        }
        self.append(id, Coordinate::UNSET)?;
        Ok(true)
    }

    /// Write buffered records and sync the file to stable storage.
    pub fn sync(&mut self) -> Result<(), OverflowCacheError> {
        self.flush_pending()?;
        self.file.sync_all().map_err(self.io_error("sync"))
    }

    /// Number of records, removals included.
    pub const fn record_count(&self) -> u64 {
        self.records
    }

    /// Number of ascending runs in the index.
    pub fn run_count(&self) -> usize {
        self.index.runs.len()
    }

    /// Number of ids indexed individually because they landed inside an
    /// existing run.
    pub fn override_count(&self) -> usize {
        self.index.overrides.len()
    }

    /// Human-readable location of the backing file.
    pub fn location(&self) -> &str {
        &self.location
    }
}

impl Drop for PersistentOverflowCache {
    fn drop(&mut self) {
        if let Err(err) = self.flush_pending() {
            warn!("dropping overflow cache with unflushed records: {err}");
        }
    }
}

fn encode_record(id: PrimitiveId, coordinate: Coordinate) -> [u8; RECORD_BYTES] {
    let [i0, i1, i2, i3, i4, i5, i6, i7] = id.to_le_bytes();
    let [x0, x1, x2, x3] = coordinate.x().to_le_bytes();
    let [y0, y1, y2, y3] = coordinate.y().to_le_bytes();
    [
        i0, i1, i2, i3, i4, i5, i6, i7, x0, x1, x2, x3, y0, y1, y2, y3,
    ]
}

fn decode_record(buf: &[u8; RECORD_BYTES]) -> (PrimitiveId, Option<Coordinate>) {
    let [i0, i1, i2, i3, i4, i5, i6, i7, x0, x1, x2, x3, y0, y1, y2, y3] = *buf;
    let id = i64::from_le_bytes([i0, i1, i2, i3, i4, i5, i6, i7]);
    let x = i32::from_le_bytes([x0, x1, x2, x3]);
    let y = i32::from_le_bytes([y0, y1, y2, y3]);
    (id, Coordinate::from_fixed(x, y))
}
