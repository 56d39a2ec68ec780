//! Read cursor over a time series.

use std::sync::RwLockReadGuard;
use std::time::Duration;

use crate::backend::BackendTransaction;
use crate::error::EngineError;
use crate::manager::{SeriesAccessor, SeriesState, TimeSeriesManager};
use crate::types::{SeriesStatistics, Timestamp};

/// User-facing read transactions over a named series.
///
/// Opened with `blocking_wait` set, the reader can block on
/// [`TimeSeriesReader::wait_modification`] until a writer commits; otherwise
/// that call degrades to a plain sleep.
pub struct TimeSeriesReader {
    accessor: SeriesAccessor,
}

impl TimeSeriesReader {
    pub fn new(
        manager: &TimeSeriesManager,
        name: &str,
        blocking_wait: bool,
    ) -> Result<Self, EngineError> {
        Ok(TimeSeriesReader {
            accessor: manager.open_accessor(name, blocking_wait)?,
        })
    }

    /// Opens a transaction: takes the series lock shared and begins a
    /// read-only backend transaction. On a deleted series the transaction
    /// still works, observing empty content.
    pub fn transaction(&self) -> ReadTransaction<'_> {
        let state = self.accessor.series.read_state();
        let transaction = state.backend.as_ref().map(|backend| backend.begin(true));

        ReadTransaction {
            _state: state,
            transaction,
            position: None,
        }
    }

    pub fn wait_modification(&self, timeout: Duration) -> bool {
        self.accessor.wait_modification(timeout)
    }
}

/// A read transaction, holding the series lock shared for its lifetime.
///
/// The cursor keeps a virtual position independent of the backend iterator:
/// `seek` on a non-existing timestamp is a legal position from which
/// `seek_next`/`seek_previous` work.
pub struct ReadTransaction<'a> {
    _state: RwLockReadGuard<'a, SeriesState>,
    transaction: Option<Box<dyn BackendTransaction>>,
    position: Option<Timestamp>,
}

impl ReadTransaction<'_> {
    pub fn is_valid(&self) -> bool {
        self.position.is_some()
    }

    pub fn timestamp(&self) -> Option<Timestamp> {
        self.position
    }

    /// Moves the virtual position, whether or not an item exists there.
    pub fn seek(&mut self, timestamp: Timestamp) {
        self.position = Some(timestamp);
    }

    pub fn seek_first(&mut self) -> bool {
        self.apply_seek(|txn, _| txn.seek_first(), 0)
    }

    pub fn seek_last(&mut self) -> bool {
        self.apply_seek(|txn, _| txn.seek_last(), 0)
    }

    /// Moves to the first item at or after `timestamp`.
    pub fn seek_nearest(&mut self, timestamp: Timestamp) -> bool {
        self.apply_seek(|txn, ts| txn.seek_nearest(ts), timestamp)
    }

    /// Moves to the first item strictly after the current position.
    pub fn seek_next(&mut self) -> bool {
        match self.position {
            Some(current) => self.apply_seek(|txn, ts| txn.seek_next(ts), current),
            None => false,
        }
    }

    /// Moves to the last item strictly before the current position.
    pub fn seek_previous(&mut self) -> bool {
        match self.position {
            Some(current) => self.apply_seek(|txn, ts| txn.seek_previous(ts), current),
            None => false,
        }
    }

    fn apply_seek<F>(&mut self, seek: F, timestamp: Timestamp) -> bool
    where
        F: FnOnce(&mut dyn BackendTransaction, Timestamp) -> Option<Timestamp>,
    {
        match &mut self.transaction {
            Some(txn) => match seek(txn.as_mut(), timestamp) {
                Some(found) => {
                    self.position = Some(found);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Reads the item at the current position, if one exists.
    pub fn read(&mut self) -> Option<(String, Vec<u8>)> {
        let timestamp = self.position?;
        self.transaction.as_mut()?.read(timestamp)
    }

    pub fn statistics(&mut self) -> SeriesStatistics {
        match &mut self.transaction {
            Some(txn) => txn.statistics(),
            None => SeriesStatistics::default(),
        }
    }
}
