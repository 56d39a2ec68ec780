//! Manager, cursor, and timestamp-policy behavior through the public API.

use std::sync::Arc;
use std::time::Duration;

use rill::backend::{MemoryBackend, TimeSeriesBackend};
use rill::manager::TimeSeriesFactory;
use rill::types::{Message, TimestampKind};
use rill::{EngineError, TimeSeriesManager, TimeSeriesReader, TimeSeriesWriter};

/// Memory-backed factory auto-creating every series with the given policy.
struct AutoFactory {
    policy: TimestampKind,
}

impl TimeSeriesFactory for AutoFactory {
    fn manual_series(&self) -> Vec<(String, TimestampKind)> {
        Vec::new()
    }

    fn create_manual(&self, _name: &str) -> Result<Box<dyn TimeSeriesBackend>, EngineError> {
        Ok(Box::new(MemoryBackend::new(0, 0)))
    }

    fn create_auto(
        &self,
        _name: &str,
    ) -> Result<Option<(Box<dyn TimeSeriesBackend>, TimestampKind)>, EngineError> {
        Ok(Some((Box::new(MemoryBackend::new(0, 0)), self.policy)))
    }
}

fn manager(policy: TimestampKind) -> Arc<TimeSeriesManager> {
    Arc::new(TimeSeriesManager::new(Box::new(AutoFactory { policy })).unwrap())
}

fn message(value: &str) -> Message {
    let mut message = Message::default();
    message.set_metadata("text/plain");
    message.set_value(value.as_bytes().to_vec());
    message
}

/// R1 / scenario 1: sequence policy yields timestamps 0..N-1.
#[test]
fn sequence_policy_numbers_from_zero() {
    let manager = manager(TimestampKind::Sequence);
    let writer = TimeSeriesWriter::new(&manager, "hello").unwrap();

    for i in 0..50 {
        assert!(writer.append(&message(&format!("value {}", i))));
    }

    let reader = TimeSeriesReader::new(&manager, "hello", false).unwrap();
    let mut transaction = reader.transaction();

    let stats = transaction.statistics();
    assert_eq!(stats.length, 50);
    let expected_size: u64 = (0..50).map(|i| format!("value {}", i).len() as u64).sum();
    assert_eq!(stats.size, expected_size);

    let mut expected = 0;
    let mut valid = transaction.seek_first();
    while valid {
        assert_eq!(transaction.timestamp(), Some(expected));
        let (metadata, value) = transaction.read().unwrap();
        assert_eq!(metadata, "text/plain");
        assert_eq!(value, format!("value {}", expected).into_bytes());
        expected += 1;
        valid = transaction.seek_next();
    }
    assert_eq!(expected, 50);
}

#[test]
fn clock_policies_use_wall_clock() {
    let manager = manager(TimestampKind::ClockMilliseconds);
    let writer = TimeSeriesWriter::new(&manager, "clocked").unwrap();

    assert!(writer.append(&message("tick")));

    let reader = TimeSeriesReader::new(&manager, "clocked", false).unwrap();
    let mut transaction = reader.transaction();
    assert!(transaction.seek_first());

    // Milliseconds since the epoch: after 2017, before 2100.
    let timestamp = transaction.timestamp().unwrap();
    assert!(timestamp > 1_500_000_000_000);
    assert!(timestamp < 4_100_000_000_000);
}

#[test]
fn fixed_policy_overrides_series_default() {
    let manager = manager(TimestampKind::Sequence);
    let writer = TimeSeriesWriter::new(&manager, "fixed").unwrap();

    let mut fixed = message("pinned");
    fixed.set_timestamp(1000);
    assert!(writer.append(&fixed));

    // A stale fixed timestamp fails without disturbing the series.
    let mut stale = message("stale");
    stale.set_timestamp(1000);
    assert!(!writer.append(&stale));

    // Sequence resumes from the high-water mark.
    assert!(writer.append(&message("next")));

    let reader = TimeSeriesReader::new(&manager, "fixed", false).unwrap();
    let mut transaction = reader.transaction();
    assert!(transaction.seek_last());
    assert_eq!(transaction.timestamp(), Some(1001));
}

#[test]
fn reader_virtual_position_survives_missing_timestamps() {
    let manager = manager(TimestampKind::Sequence);
    let writer = TimeSeriesWriter::new(&manager, "sparse").unwrap();

    {
        let mut transaction = writer.transaction();
        for ts in [10, 20, 30] {
            assert!(transaction.append(ts, "", b"x"));
        }
    }

    let reader = TimeSeriesReader::new(&manager, "sparse", false).unwrap();
    let mut transaction = reader.transaction();

    assert!(!transaction.is_valid());

    // Seeking a hole is a legal position.
    transaction.seek(15);
    assert!(transaction.is_valid());
    assert_eq!(transaction.timestamp(), Some(15));
    assert!(transaction.read().is_none());

    assert!(transaction.seek_next());
    assert_eq!(transaction.timestamp(), Some(20));

    transaction.seek(25);
    assert!(transaction.seek_previous());
    assert_eq!(transaction.timestamp(), Some(20));

    assert!(transaction.seek_nearest(21));
    assert_eq!(transaction.timestamp(), Some(30));
}

#[test]
fn writer_notifies_blocking_readers() {
    let manager = manager(TimestampKind::Sequence);
    let reader = TimeSeriesReader::new(&manager, "notified", true).unwrap();

    let manager_clone = Arc::clone(&manager);
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        let writer = TimeSeriesWriter::new(&manager_clone, "notified").unwrap();
        assert!(writer.append(&message("wake up")));
    });

    assert!(reader.wait_modification(Duration::from_secs(5)));
    handle.join().unwrap();

    let mut transaction = reader.transaction();
    assert!(transaction.seek_first());
    assert_eq!(transaction.read().unwrap().1, b"wake up");
}

#[test]
fn rejected_append_does_not_notify() {
    let manager = manager(TimestampKind::Sequence);
    let writer = TimeSeriesWriter::new(&manager, "silent").unwrap();
    assert!(writer.append(&message("first")));

    let reader = TimeSeriesReader::new(&manager, "silent", true).unwrap();

    let mut stale = message("stale");
    stale.set_timestamp(0);
    assert!(!writer.append(&stale));

    assert!(!reader.wait_modification(Duration::from_millis(50)));
}

#[test]
fn noop_mutations_do_not_notify() {
    let manager = manager(TimestampKind::Sequence);
    let writer = TimeSeriesWriter::new(&manager, "quiet").unwrap();
    assert!(writer.append(&message("only")));

    let reader = TimeSeriesReader::new(&manager, "quiet", true).unwrap();

    // Degenerate and empty ranges remove nothing and stay silent.
    {
        let mut transaction = writer.transaction();
        assert!(transaction.delete_range(8, 8));
        assert!(transaction.delete_range(20, 10));
        assert!(transaction.delete_range(100, 200));
    }
    assert!(!reader.wait_modification(Duration::from_millis(50)));

    // Clearing a non-empty series notifies once; clearing again does not.
    {
        let mut transaction = writer.transaction();
        transaction.clear_content();
    }
    assert!(reader.wait_modification(Duration::from_millis(50)));

    {
        let mut transaction = writer.transaction();
        transaction.clear_content();
    }
    assert!(!reader.wait_modification(Duration::from_millis(50)));
}

#[test]
fn deleted_series_becomes_empty_and_read_only() {
    let manager = manager(TimestampKind::Sequence);
    let writer = TimeSeriesWriter::new(&manager, "doomed").unwrap();
    assert!(writer.append(&message("gone")));

    let reader = TimeSeriesReader::new(&manager, "doomed", true).unwrap();
    manager.delete("doomed").unwrap();

    // The deletion notification is immediately observable.
    assert!(reader.wait_modification(Duration::from_millis(10)));

    // Cursor handles survive, observing an empty read-only series.
    let mut read = reader.transaction();
    assert!(!read.seek_first());
    assert_eq!(read.statistics().length, 0);

    assert!(!writer.append(&message("rejected")));
    let mut write = writer.transaction();
    assert!(!write.append(99, "", b"rejected"));
    assert!(!write.delete_range(0, 100));

    // The name is free again; re-creation starts from scratch.
    assert!(manager.list().unwrap().is_empty());
    let recreated = TimeSeriesWriter::new(&manager, "doomed").unwrap();
    assert!(recreated.append(&message("fresh")));
}

#[test]
fn delete_range_through_writer_cursor() {
    let manager = manager(TimestampKind::Sequence);
    let writer = TimeSeriesWriter::new(&manager, "ranged").unwrap();

    for i in 0..10 {
        assert!(writer.append(&message(&format!("{}", i))));
    }

    {
        let mut transaction = writer.transaction();
        assert!(transaction.delete_range(2, 5));
    }

    let reader = TimeSeriesReader::new(&manager, "ranged", false).unwrap();
    let mut transaction = reader.transaction();
    assert_eq!(transaction.statistics().length, 7);
    assert!(transaction.seek_nearest(2));
    assert_eq!(transaction.timestamp(), Some(5));
}
