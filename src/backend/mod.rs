//! Storage backends: ordered maps from timestamp to `(metadata, value)` with
//! quota-bounded recycling and transactional access.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::{SqliteBackend, SqliteDatabase};

use crate::types::{SeriesStatistics, Timestamp};

/// A transaction over the content of a single time series.
///
/// Transactions are created through [`TimeSeriesBackend::begin`] and are
/// isolated by the caller: the cursor layer acquires the series lock (shared
/// for read-only transactions, exclusive for writable ones) before opening
/// one. Writable transactions commit when dropped on the normal path; the
/// SQL backend rolls back instead when dropped during a panic unwind.
pub trait BackendTransaction {
    /// Removes every item. The last-timestamp high-water mark is preserved.
    /// Returns `true` if anything was removed.
    fn clear_content(&mut self) -> bool;

    /// Removes exactly the items with `start <= ts < end`; `start >= end` is
    /// a no-op. The last-timestamp high-water mark is preserved. Returns
    /// `true` if anything was removed.
    fn delete_range(&mut self, start: Timestamp, end: Timestamp) -> bool;

    fn seek_first(&mut self) -> Option<Timestamp>;

    fn seek_last(&mut self) -> Option<Timestamp>;

    /// Returns the first timestamp that is after or equal to `timestamp`.
    fn seek_nearest(&mut self, timestamp: Timestamp) -> Option<Timestamp>;

    /// Returns the first timestamp strictly after `timestamp`.
    fn seek_next(&mut self, timestamp: Timestamp) -> Option<Timestamp>;

    /// Returns the last timestamp strictly before `timestamp`.
    fn seek_previous(&mut self, timestamp: Timestamp) -> Option<Timestamp>;

    fn read(&mut self, timestamp: Timestamp) -> Option<(String, Vec<u8>)>;

    /// Returns `false` if the value exceeds the size quota, or if
    /// `timestamp <= last_timestamp`. A successful append evicts oldest
    /// items as needed to restore the quota invariants.
    fn append(&mut self, timestamp: Timestamp, metadata: &str, value: &[u8]) -> bool;

    fn statistics(&mut self) -> SeriesStatistics;

    /// Highest timestamp ever appended, if any. Persistent: not reset by
    /// `clear_content`, `delete_range`, or quota eviction.
    fn last_timestamp(&mut self) -> Option<Timestamp>;
}

/// Concrete storage for one time series.
pub trait TimeSeriesBackend: Send + Sync {
    fn begin(&self, read_only: bool) -> Box<dyn BackendTransaction>;
}
