use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use rusqlite::{params, Connection, OptionalExtension};

use crate::backend::{BackendTransaction, TimeSeriesBackend};
use crate::error::EngineError;
use crate::telemetry::{EngineEvent, EngineEventListener};
use crate::types::{SeriesStatistics, Timestamp};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS series(
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    name           TEXT NOT NULL UNIQUE,
    max_length     INTEGER NOT NULL,
    max_size       INTEGER NOT NULL,
    length         INTEGER NOT NULL,
    size           INTEGER NOT NULL,
    last_timestamp INTEGER
);
CREATE TABLE IF NOT EXISTS item(
    series    INTEGER NOT NULL REFERENCES series(id) ON DELETE CASCADE,
    timestamp INTEGER NOT NULL,
    size      INTEGER NOT NULL,
    metadata  TEXT NOT NULL,
    value     BLOB NOT NULL,
    PRIMARY KEY(series, timestamp)
);
";

const CHECKPOINT_TICK: Duration = Duration::from_millis(100);
const CHECKPOINT_EVERY_TICKS: u32 = 100; // ~10 seconds

/// A single on-disk (or in-memory) SQLite database hosting many time series.
///
/// All series operations run inside one database-level transaction at a
/// time: a backend transaction holds the connection mutex for its whole
/// lifetime. A background thread flushes dirty WAL pages to disk every
/// ~10 seconds.
#[derive(Debug)]
pub struct SqliteDatabase {
    connection: Arc<Mutex<Connection>>,
    running: Arc<AtomicBool>,
    checkpoint_thread: Option<JoinHandle<()>>,
}

impl SqliteDatabase {
    /// Opens (creating if needed) the database at `path`.
    pub fn open(
        path: impl AsRef<Path>,
        events: Arc<dyn EngineEventListener>,
    ) -> Result<Self, EngineError> {
        let connection = Connection::open(path)?;
        Self::setup(connection, events)
    }

    /// Opens a transient database kept entirely in memory.
    pub fn open_in_memory(events: Arc<dyn EngineEventListener>) -> Result<Self, EngineError> {
        let connection = Connection::open_in_memory()?;
        Self::setup(connection, events)
    }

    fn setup(
        connection: Connection,
        events: Arc<dyn EngineEventListener>,
    ) -> Result<Self, EngineError> {
        connection.pragma_update(None, "synchronous", "OFF")?;
        connection.pragma_update(None, "journal_mode", "WAL")?;
        connection.pragma_update(None, "locking_mode", "EXCLUSIVE")?;
        connection.pragma_update(None, "foreign_keys", "ON")?;
        connection.execute_batch(SCHEMA)?;

        let connection = Arc::new(Mutex::new(connection));
        let running = Arc::new(AtomicBool::new(true));

        let thread_connection = Arc::clone(&connection);
        let thread_running = Arc::clone(&running);
        let checkpoint_thread = thread::Builder::new()
            .name("rill-sqlite-checkpoint".to_string())
            .spawn(move || {
                let mut ticks = 0;
                while thread_running.load(Ordering::Relaxed) {
                    thread::sleep(CHECKPOINT_TICK);
                    ticks += 1;
                    if ticks == CHECKPOINT_EVERY_TICKS {
                        let connection = thread_connection.lock();
                        let flushed = connection
                            .query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_row| Ok(()));
                        if let Err(e) = flushed {
                            events.on_event(EngineEvent::CheckpointFailed {
                                error: e.to_string(),
                            });
                        }
                        ticks = 0;
                    }
                }
            })
            .map_err(|e| EngineError::Internal(format!("cannot spawn checkpoint thread: {}", e)))?;

        Ok(SqliteDatabase {
            connection,
            running,
            checkpoint_thread: Some(checkpoint_thread),
        })
    }

    /// Declares a time series, creating its row if absent.
    ///
    /// Re-declaring an existing series updates its quotas and evicts oldest
    /// items until the invariants hold again; the last-timestamp high-water
    /// mark is never lowered by this eviction.
    pub fn declare_series(
        &self,
        name: &str,
        max_length: u64,
        max_size: u64,
    ) -> Result<(), EngineError> {
        {
            let connection = self.connection.lock();
            let existing: Option<i64> = connection
                .query_row("SELECT id FROM series WHERE name=?1", params![name], |row| {
                    row.get(0)
                })
                .optional()?;

            match existing {
                None => {
                    connection.execute(
                        "INSERT INTO series(name, max_length, max_size, length, size, last_timestamp)
                         VALUES(?1, ?2, ?3, 0, 0, NULL)",
                        params![name, max_length as i64, max_size as i64],
                    )?;
                    return Ok(());
                }
                Some(_) => {
                    connection.execute(
                        "UPDATE series SET max_length=?1, max_size=?2 WHERE name=?3",
                        params![max_length as i64, max_size as i64, name],
                    )?;
                }
            }
        }

        // Quotas may have been tightened: evict before admitting any write.
        let mut txn = SqliteTransaction::begin(self, name, false)?;
        txn.enforce_quotas();
        Ok(())
    }

    /// Drops a time series and its content.
    pub fn delete_series(&self, name: &str) -> Result<(), EngineError> {
        let connection = self.connection.lock();
        connection.execute_batch("BEGIN IMMEDIATE;")?;
        let result = connection.execute("DELETE FROM series WHERE name=?1", params![name]);
        if result.is_ok() {
            connection.execute_batch("COMMIT;")?;
        } else {
            connection.execute_batch("ROLLBACK;")?;
        }
        result?;
        Ok(())
    }

    pub fn has_series(&self, name: &str) -> Result<bool, EngineError> {
        let connection = self.connection.lock();
        let found: Option<i64> = connection
            .query_row("SELECT id FROM series WHERE name=?1", params![name], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(found.is_some())
    }
}

impl Drop for SqliteDatabase {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.checkpoint_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Per-series view onto a shared [`SqliteDatabase`].
pub struct SqliteBackend {
    database: Arc<SqliteDatabase>,
    name: String,
}

impl SqliteBackend {
    pub fn new(database: Arc<SqliteDatabase>, name: impl Into<String>) -> Self {
        SqliteBackend {
            database,
            name: name.into(),
        }
    }
}

impl TimeSeriesBackend for SqliteBackend {
    fn begin(&self, read_only: bool) -> Box<dyn BackendTransaction> {
        match SqliteTransaction::begin(&self.database, &self.name, read_only) {
            Ok(txn) => Box::new(txn),
            // The series row is gone (or the engine failed): degrade to the
            // empty transaction so cursor calls keep their contract.
            Err(_) => Box::new(VoidTransaction),
        }
    }
}

/// Database-level transaction scoped to one series.
///
/// Holds the connection mutex for its whole lifetime, serializing all
/// database access. Commits on drop; rolls back instead when dropped during
/// a panic unwind. The quota counters and the high-water mark are cached in
/// the struct and written back with each mutation, as rescanning the item
/// table on every append would be quadratic.
struct SqliteTransaction {
    connection: ArcMutexGuard<RawMutex, Connection>,
    id: i64,
    max_length: u64,
    max_size: u64,
    length: u64,
    size: u64,
    last_timestamp: Option<Timestamp>,
    read_only: bool,
    open: bool,
}

impl SqliteTransaction {
    fn begin(
        database: &SqliteDatabase,
        name: &str,
        read_only: bool,
    ) -> Result<Self, EngineError> {
        let connection = Mutex::lock_arc(&database.connection);

        let row = connection
            .query_row(
                "SELECT id, max_length, max_size, length, size, last_timestamp
                 FROM series WHERE name=?1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                    ))
                },
            )
            .optional()?;

        let (id, max_length, max_size, length, size, last_timestamp) = match row {
            Some(row) => row,
            None => return Err(EngineError::SeriesNotFound(name.to_string())),
        };

        if read_only {
            connection.execute_batch("BEGIN;")?;
        } else {
            connection.execute_batch("BEGIN IMMEDIATE;")?;
        }

        Ok(SqliteTransaction {
            connection,
            id,
            max_length: max_length as u64,
            max_size: max_size as u64,
            length: length as u64,
            size: size as u64,
            last_timestamp,
            read_only,
            open: true,
        })
    }

    fn update_series_row(&mut self) {
        let _ = self.connection.execute(
            "UPDATE series SET length=?1, size=?2, last_timestamp=?3 WHERE id=?4",
            params![
                self.length as i64,
                self.size as i64,
                self.last_timestamp,
                self.id
            ],
        );
    }

    fn remove_oldest(&mut self) -> bool {
        let oldest: Option<(Timestamp, i64)> = self
            .connection
            .query_row(
                "SELECT timestamp, size FROM item WHERE series=?1
                 ORDER BY timestamp ASC LIMIT 1",
                params![self.id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .unwrap_or(None);

        match oldest {
            Some((timestamp, size)) => {
                let _ = self.connection.execute(
                    "DELETE FROM item WHERE series=?1 AND timestamp=?2",
                    params![self.id, timestamp],
                );
                self.length -= 1;
                self.size -= size as u64;
                true
            }
            None => false,
        }
    }

    /// Evicts oldest items until the current quotas are satisfied. Used when
    /// quotas are tightened on an existing series.
    fn enforce_quotas(&mut self) {
        if self.max_length != 0 {
            while self.length > self.max_length {
                if !self.remove_oldest() {
                    break;
                }
            }
        }
        if self.max_size != 0 {
            while self.size > self.max_size {
                if !self.remove_oldest() {
                    break;
                }
            }
        }
        self.update_series_row();
    }

    fn query_timestamp(&mut self, sql: &str, bind: Option<Timestamp>) -> Option<Timestamp> {
        let result = match bind {
            Some(value) => {
                self.connection
                    .query_row(sql, params![self.id, value], |row| row.get(0))
            }
            None => self.connection.query_row(sql, params![self.id], |row| row.get(0)),
        };
        result.optional().unwrap_or(None)
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        if !self.read_only && thread::panicking() {
            let _ = self.connection.execute_batch("ROLLBACK;");
        } else {
            let _ = self.connection.execute_batch("COMMIT;");
        }
        self.open = false;
    }
}

impl BackendTransaction for SqliteTransaction {
    fn clear_content(&mut self) -> bool {
        if self.length == 0 {
            return false;
        }

        let _ = self
            .connection
            .execute("DELETE FROM item WHERE series=?1", params![self.id]);
        self.length = 0;
        self.size = 0;
        self.update_series_row();
        true
    }

    fn delete_range(&mut self, start: Timestamp, end: Timestamp) -> bool {
        if start >= end {
            return false;
        }

        let removed: Option<(i64, Option<i64>)> = self
            .connection
            .query_row(
                "SELECT COUNT(*), SUM(size) FROM item
                 WHERE series=?1 AND timestamp>=?2 AND timestamp<?3",
                params![self.id, start, end],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .unwrap_or(None);

        match removed {
            Some((count, bytes)) if count > 0 => {
                let _ = self.connection.execute(
                    "DELETE FROM item WHERE series=?1 AND timestamp>=?2 AND timestamp<?3",
                    params![self.id, start, end],
                );
                self.length -= count as u64;
                self.size -= bytes.unwrap_or(0) as u64;
                self.update_series_row();
                true
            }
            _ => false,
        }
    }

    fn seek_first(&mut self) -> Option<Timestamp> {
        self.query_timestamp(
            "SELECT timestamp FROM item WHERE series=?1 ORDER BY timestamp ASC LIMIT 1",
            None,
        )
    }

    fn seek_last(&mut self) -> Option<Timestamp> {
        self.query_timestamp(
            "SELECT timestamp FROM item WHERE series=?1 ORDER BY timestamp DESC LIMIT 1",
            None,
        )
    }

    fn seek_nearest(&mut self, timestamp: Timestamp) -> Option<Timestamp> {
        self.query_timestamp(
            "SELECT timestamp FROM item WHERE series=?1 AND timestamp>=?2
             ORDER BY timestamp ASC LIMIT 1",
            Some(timestamp),
        )
    }

    fn seek_next(&mut self, timestamp: Timestamp) -> Option<Timestamp> {
        self.query_timestamp(
            "SELECT timestamp FROM item WHERE series=?1 AND timestamp>?2
             ORDER BY timestamp ASC LIMIT 1",
            Some(timestamp),
        )
    }

    fn seek_previous(&mut self, timestamp: Timestamp) -> Option<Timestamp> {
        self.query_timestamp(
            "SELECT timestamp FROM item WHERE series=?1 AND timestamp<?2
             ORDER BY timestamp DESC LIMIT 1",
            Some(timestamp),
        )
    }

    fn read(&mut self, timestamp: Timestamp) -> Option<(String, Vec<u8>)> {
        self.connection
            .query_row(
                "SELECT metadata, value FROM item WHERE series=?1 AND timestamp=?2",
                params![self.id, timestamp],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .unwrap_or(None)
    }

    fn append(&mut self, timestamp: Timestamp, metadata: &str, value: &[u8]) -> bool {
        if self.max_size != 0 && value.len() as u64 > self.max_size {
            return false;
        }

        if let Some(last) = self.last_timestamp {
            if timestamp <= last {
                return false;
            }
        }

        if self.max_length != 0 {
            while self.length + 1 > self.max_length {
                if !self.remove_oldest() {
                    break;
                }
            }
        }

        if self.max_size != 0 {
            while self.size + value.len() as u64 > self.max_size {
                if !self.remove_oldest() {
                    break;
                }
            }
        }

        let inserted = self.connection.execute(
            "INSERT INTO item(series, timestamp, size, metadata, value)
             VALUES(?1, ?2, ?3, ?4, ?5)",
            params![self.id, timestamp, value.len() as i64, metadata, value],
        );

        if inserted.is_err() {
            return false;
        }

        self.length += 1;
        self.size += value.len() as u64;
        self.last_timestamp = Some(timestamp);
        self.update_series_row();
        true
    }

    fn statistics(&mut self) -> SeriesStatistics {
        SeriesStatistics {
            length: self.length,
            size: self.size,
        }
    }

    fn last_timestamp(&mut self) -> Option<Timestamp> {
        self.last_timestamp
    }
}

/// Transaction over a series whose backing row no longer exists: every read
/// comes back empty and every mutation is ignored.
struct VoidTransaction;

impl BackendTransaction for VoidTransaction {
    fn clear_content(&mut self) -> bool {
        false
    }
    fn delete_range(&mut self, _start: Timestamp, _end: Timestamp) -> bool {
        false
    }
    fn seek_first(&mut self) -> Option<Timestamp> {
        None
    }
    fn seek_last(&mut self) -> Option<Timestamp> {
        None
    }
    fn seek_nearest(&mut self, _timestamp: Timestamp) -> Option<Timestamp> {
        None
    }
    fn seek_next(&mut self, _timestamp: Timestamp) -> Option<Timestamp> {
        None
    }
    fn seek_previous(&mut self, _timestamp: Timestamp) -> Option<Timestamp> {
        None
    }
    fn read(&mut self, _timestamp: Timestamp) -> Option<(String, Vec<u8>)> {
        None
    }
    fn append(&mut self, _timestamp: Timestamp, _metadata: &str, _value: &[u8]) -> bool {
        false
    }
    fn statistics(&mut self) -> SeriesStatistics {
        SeriesStatistics::default()
    }
    fn last_timestamp(&mut self) -> Option<Timestamp> {
        None
    }
}
