use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included, Unbounded};
use std::sync::{Arc, RwLock};

use crate::backend::{BackendTransaction, TimeSeriesBackend};
use crate::types::{SeriesStatistics, Timestamp};

#[derive(Debug, Default)]
struct Item {
    metadata: String,
    value: Vec<u8>,
}

/// Content of an in-memory time series: a sorted map from timestamp to item,
/// plus the quota counters and the persistent last-timestamp high-water mark.
#[derive(Debug)]
struct MemoryContent {
    items: BTreeMap<Timestamp, Item>,
    size: u64,
    max_length: u64,
    max_size: u64,
    last_timestamp: Option<Timestamp>,
}

impl MemoryContent {
    fn new(max_length: u64, max_size: u64) -> Self {
        MemoryContent {
            items: BTreeMap::new(),
            size: 0,
            max_length,
            max_size,
            last_timestamp: None,
        }
    }

    fn remove_oldest(&mut self) {
        if let Some((&timestamp, item)) = self.items.iter().next() {
            self.size -= item.value.len() as u64;
            self.items.remove(&timestamp);
        }
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
            while self.items.len() as u64 + 1 > self.max_length {
                self.remove_oldest();
            }
        }

        if self.max_size != 0 {
            while self.size + value.len() as u64 > self.max_size {
                self.remove_oldest();
            }
        }

        self.size += value.len() as u64;
        self.items.insert(
            timestamp,
            Item {
                metadata: metadata.to_string(),
                value: value.to_vec(),
            },
        );
        self.last_timestamp = Some(timestamp);
        true
    }

    fn delete_range(&mut self, start: Timestamp, end: Timestamp) -> bool {
        if start >= end {
            return false;
        }

        let doomed: Vec<Timestamp> = self
            .items
            .range((Included(start), Excluded(end)))
            .map(|(&ts, _)| ts)
            .collect();

        let removed = !doomed.is_empty();
        for timestamp in doomed {
            if let Some(item) = self.items.remove(&timestamp) {
                self.size -= item.value.len() as u64;
            }
        }
        removed
    }

    fn clear_content(&mut self) -> bool {
        let removed = !self.items.is_empty();
        self.items.clear();
        self.size = 0;
        removed
    }
}

/// In-memory time series backend: a sorted map behind a `RwLock`.
///
/// Read-only transactions take the lock shared, writable ones exclusive. The
/// transaction scope equals the method scope; cross-call isolation is the
/// responsibility of the series-level lock held by the cursor layer.
#[derive(Debug)]
pub struct MemoryBackend {
    content: Arc<RwLock<MemoryContent>>,
}

impl MemoryBackend {
    /// Quotas of zero mean unlimited.
    pub fn new(max_length: u64, max_size: u64) -> Self {
        MemoryBackend {
            content: Arc::new(RwLock::new(MemoryContent::new(max_length, max_size))),
        }
    }
}

impl TimeSeriesBackend for MemoryBackend {
    fn begin(&self, read_only: bool) -> Box<dyn BackendTransaction> {
        Box::new(MemoryTransaction {
            content: Arc::clone(&self.content),
            read_only,
        })
    }
}

struct MemoryTransaction {
    content: Arc<RwLock<MemoryContent>>,
    read_only: bool,
}

impl BackendTransaction for MemoryTransaction {
    fn clear_content(&mut self) -> bool {
        assert!(!self.read_only);
        match self.content.write() {
            Ok(mut content) => content.clear_content(),
            Err(_) => false,
        }
    }

    fn delete_range(&mut self, start: Timestamp, end: Timestamp) -> bool {
        assert!(!self.read_only);
        match self.content.write() {
            Ok(mut content) => content.delete_range(start, end),
            Err(_) => false,
        }
    }

    fn seek_first(&mut self) -> Option<Timestamp> {
        let content = self.content.read().ok()?;
        content.items.keys().next().copied()
    }

    fn seek_last(&mut self) -> Option<Timestamp> {
        let content = self.content.read().ok()?;
        content.items.keys().next_back().copied()
    }

    fn seek_nearest(&mut self, timestamp: Timestamp) -> Option<Timestamp> {
        let content = self.content.read().ok()?;
        content
            .items
            .range((Included(timestamp), Unbounded))
            .next()
            .map(|(&ts, _)| ts)
    }

    fn seek_next(&mut self, timestamp: Timestamp) -> Option<Timestamp> {
        let content = self.content.read().ok()?;
        content
            .items
            .range((Excluded(timestamp), Unbounded))
            .next()
            .map(|(&ts, _)| ts)
    }

    fn seek_previous(&mut self, timestamp: Timestamp) -> Option<Timestamp> {
        let content = self.content.read().ok()?;
        content
            .items
            .range((Unbounded, Excluded(timestamp)))
            .next_back()
            .map(|(&ts, _)| ts)
    }

    fn read(&mut self, timestamp: Timestamp) -> Option<(String, Vec<u8>)> {
        let content = self.content.read().ok()?;
        content
            .items
            .get(&timestamp)
            .map(|item| (item.metadata.clone(), item.value.clone()))
    }

    fn append(&mut self, timestamp: Timestamp, metadata: &str, value: &[u8]) -> bool {
        assert!(!self.read_only);
        match self.content.write() {
            Ok(mut content) => content.append(timestamp, metadata, value),
            Err(_) => false,
        }
    }

    fn statistics(&mut self) -> SeriesStatistics {
        match self.content.read() {
            Ok(content) => SeriesStatistics {
                length: content.items.len() as u64,
                size: content.size,
            },
            Err(_) => SeriesStatistics::default(),
        }
    }

    fn last_timestamp(&mut self) -> Option<Timestamp> {
        self.content.read().ok()?.last_timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(txn: &mut dyn BackendTransaction) -> Vec<Timestamp> {
        let mut result = Vec::new();
        let mut current = txn.seek_first();
        while let Some(ts) = current {
            result.push(ts);
            current = txn.seek_next(ts);
        }
        result
    }

    #[test]
    fn test_append_and_seek() {
        let backend = MemoryBackend::new(0, 0);
        let mut txn = backend.begin(false);

        assert!(txn.seek_first().is_none());
        assert!(txn.seek_last().is_none());

        for ts in [10, 20, 30] {
            assert!(txn.append(ts, "text/plain", b"x"));
        }

        assert_eq!(txn.seek_first(), Some(10));
        assert_eq!(txn.seek_last(), Some(30));
        assert_eq!(txn.seek_nearest(15), Some(20));
        assert_eq!(txn.seek_nearest(20), Some(20));
        assert_eq!(txn.seek_nearest(31), None);
        assert_eq!(txn.seek_next(20), Some(30));
        assert_eq!(txn.seek_next(30), None);
        assert_eq!(txn.seek_previous(20), Some(10));
        assert_eq!(txn.seek_previous(10), None);
    }

    #[test]
    fn test_append_monotonicity() {
        let backend = MemoryBackend::new(0, 0);
        let mut txn = backend.begin(false);

        assert!(txn.append(5, "", b"a"));
        assert!(!txn.append(5, "", b"b"));
        assert!(!txn.append(4, "", b"b"));
        assert!(txn.append(6, "", b"b"));
        assert_eq!(txn.last_timestamp(), Some(6));
    }

    #[test]
    fn test_length_quota() {
        let backend = MemoryBackend::new(10, 0);
        let mut txn = backend.begin(false);

        for i in 0..50 {
            assert!(txn.append(i * 10, "", b"v"));
        }

        let stats = txn.statistics();
        assert_eq!(stats.length, 10);
        assert_eq!(txn.seek_first(), Some(400));
        assert_eq!(txn.seek_last(), Some(490));
    }

    #[test]
    fn test_size_quota() {
        let backend = MemoryBackend::new(0, 10);
        let mut txn = backend.begin(false);

        assert!(txn.append(0, "", b"0123456789"));
        // Larger than the whole quota: rejected without evicting anything.
        assert!(!txn.append(1, "", b"0123456789a"));
        assert_eq!(txn.statistics().length, 1);

        assert!(txn.append(1, "", b"56789"));
        assert_eq!(scan(txn.as_mut()), vec![1]);
        assert_eq!(txn.statistics().size, 5);

        assert!(txn.append(2, "", b"01234"));
        assert_eq!(scan(txn.as_mut()), vec![1, 2]);
        assert_eq!(txn.statistics().size, 10);
    }

    #[test]
    fn test_delete_range_and_clear() {
        let backend = MemoryBackend::new(0, 0);
        let mut txn = backend.begin(false);

        for ts in 0..10 {
            assert!(txn.append(ts, "", b"x"));
        }

        txn.delete_range(3, 7);
        assert_eq!(scan(txn.as_mut()), vec![0, 1, 2, 7, 8, 9]);

        txn.delete_range(-10, 2);
        assert_eq!(scan(txn.as_mut()), vec![2, 7, 8, 9]);

        txn.delete_range(9, 20);
        assert_eq!(scan(txn.as_mut()), vec![2, 7, 8]);

        txn.delete_range(2, 3);
        assert_eq!(scan(txn.as_mut()), vec![7, 8]);

        // Degenerate range is a no-op.
        txn.delete_range(8, 8);
        txn.delete_range(9, 2);
        assert_eq!(scan(txn.as_mut()), vec![7, 8]);

        txn.clear_content();
        assert_eq!(txn.statistics(), SeriesStatistics::default());

        // The high-water mark survives both delete_range and clear_content.
        assert_eq!(txn.last_timestamp(), Some(9));
        assert!(!txn.append(9, "", b"x"));
        assert!(txn.append(10, "", b"x"));
    }

    #[test]
    fn test_read() {
        let backend = MemoryBackend::new(0, 0);
        let mut txn = backend.begin(false);

        assert!(txn.append(7, "application/json", b"{}"));
        assert_eq!(
            txn.read(7),
            Some(("application/json".to_string(), b"{}".to_vec()))
        );
        assert!(txn.read(8).is_none());
    }
}
