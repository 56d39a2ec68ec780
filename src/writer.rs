//! Write cursor over a time series, including timestamp policy resolution.

use std::sync::RwLockWriteGuard;

use crate::backend::BackendTransaction;
use crate::error::EngineError;
use crate::manager::{Series, SeriesAccessor, SeriesState, TimeSeriesManager};
use crate::telemetry::{engine_metrics, EngineEvent, EngineEventListener};
use crate::types::{
    milliseconds_clock_timestamp, nanoseconds_clock_timestamp, seconds_clock_timestamp, Message,
    SeriesStatistics, Timestamp, TimestampKind,
};
use std::sync::Arc;

/// User-facing write transactions over a named series.
pub struct TimeSeriesWriter {
    accessor: SeriesAccessor,
    events: Arc<dyn EngineEventListener>,
}

impl TimeSeriesWriter {
    pub fn new(manager: &TimeSeriesManager, name: &str) -> Result<Self, EngineError> {
        Ok(TimeSeriesWriter {
            accessor: manager.open_accessor(name, false)?,
            events: manager.events(),
        })
    }

    /// Opens a transaction: takes the series lock exclusive and begins a
    /// writable backend transaction. When the transaction is dropped on the
    /// normal path, the backend commits and, iff a mutation occurred,
    /// observers receive a `series_modified` notification while the lock is
    /// still held.
    pub fn transaction(&self) -> WriteTransaction<'_> {
        let state = self.accessor.series.write_state();
        let transaction = state.backend.as_ref().map(|backend| backend.begin(false));

        WriteTransaction {
            series: &self.accessor.series,
            state,
            transaction,
            modified: false,
        }
    }

    /// Appends a message, materializing its timestamp according to the
    /// message policy (falling back to the series policy for `Default`).
    /// Returns `false` when the append is rejected by the backend
    /// (monotonicity or quota violation).
    pub fn append(&self, message: &Message) -> bool {
        let series_name = self.accessor.series.name().to_string();
        let mut transaction = self.transaction();

        let mut kind = message.timestamp_kind();
        if kind == TimestampKind::Default {
            kind = transaction.default_timestamp_kind();
        }

        let timestamp = match kind {
            TimestampKind::Fixed => match message.timestamp() {
                Some(ts) => ts,
                None => return false,
            },
            TimestampKind::ClockNanoseconds => nanoseconds_clock_timestamp(),
            TimestampKind::ClockMilliseconds => milliseconds_clock_timestamp(),
            TimestampKind::ClockSeconds => seconds_clock_timestamp(),
            TimestampKind::Sequence => match transaction.last_timestamp() {
                Some(last) => last + 1,
                None => 0, // the sequence is empty
            },
            TimestampKind::Default => return false,
        };

        if transaction.append(timestamp, message.metadata(), message.value()) {
            engine_metrics::record_append(message.value().len() as u64);
            true
        } else {
            engine_metrics::record_rejected_append();
            self.events.on_event(EngineEvent::AppendRejected {
                series: series_name,
                timestamp,
            });
            false
        }
    }
}

/// A write transaction, holding the series lock exclusive for its lifetime.
pub struct WriteTransaction<'a> {
    series: &'a Arc<Series>,
    state: RwLockWriteGuard<'a, SeriesState>,
    transaction: Option<Box<dyn BackendTransaction>>,
    modified: bool,
}

impl WriteTransaction<'_> {
    pub(crate) fn default_timestamp_kind(&self) -> TimestampKind {
        self.series.default_timestamp()
    }

    pub fn last_timestamp(&mut self) -> Option<Timestamp> {
        self.transaction.as_mut()?.last_timestamp()
    }

    /// Low-level append at an explicit timestamp. Returns `false` on a
    /// deleted series or when the backend rejects the item.
    pub fn append(&mut self, timestamp: Timestamp, metadata: &str, value: &[u8]) -> bool {
        match &mut self.transaction {
            Some(txn) => {
                if txn.append(timestamp, metadata, value) {
                    self.modified = true;
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Removes the items with `start <= ts < end`. Returns `false` on a
    /// deleted series. Observers are only notified when an item was
    /// actually removed.
    pub fn delete_range(&mut self, start: Timestamp, end: Timestamp) -> bool {
        match &mut self.transaction {
            Some(txn) => {
                if txn.delete_range(start, end) {
                    self.modified = true;
                }
                true
            }
            None => false,
        }
    }

    /// Removes every item; the last-timestamp high-water mark is preserved.
    /// Observers are only notified when the series was non-empty.
    pub fn clear_content(&mut self) {
        if let Some(txn) = &mut self.transaction {
            if txn.clear_content() {
                self.modified = true;
            }
        }
    }

    pub fn statistics(&mut self) -> SeriesStatistics {
        match &mut self.transaction {
            Some(txn) => txn.statistics(),
            None => SeriesStatistics::default(),
        }
    }
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        // Commit (or roll back, inside the backend) before notifying, so
        // observers never wake up to an uncommitted state.
        let panicking = std::thread::panicking();
        self.transaction.take();

        if self.modified && !panicking {
            self.series.notify_modification(&self.state);
        }
    }
}
