use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;

use crate::error::EngineError;

/// Timestamp type (signed, unit defined by the series policy).
pub type Timestamp = i64;

/// Policy used to materialize the timestamp of a message when it is appended
/// to a time series.
///
/// `Default` defers to the policy declared on the target series. `Fixed` is
/// only reachable through [`Message::set_timestamp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum TimestampKind {
    Default,
    Fixed,
    Sequence,
    #[serde(rename = "ClockNs")]
    ClockNanoseconds,
    #[serde(rename = "ClockMs")]
    ClockMilliseconds,
    #[serde(rename = "ClockS")]
    ClockSeconds,
}

impl Default for TimestampKind {
    fn default() -> Self {
        TimestampKind::Default
    }
}

/// Statistics of a single time series at a transaction boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeriesStatistics {
    /// Number of items currently stored.
    pub length: u64,
    /// Sum of the value sizes, in bytes.
    pub size: u64,
}

/// The in-transit form of a time series item.
///
/// A message carries opaque `value` bytes, a short MIME-like `metadata`
/// string, and a timestamp policy that is resolved by the writer cursor at
/// append time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    kind: TimestampKind,
    timestamp: Timestamp,
    metadata: String,
    value: Vec<u8>,
}

impl Message {
    pub fn timestamp_kind(&self) -> TimestampKind {
        self.kind
    }

    /// Selects a non-fixed timestamp policy. Use [`Message::set_timestamp`]
    /// to fix the timestamp instead.
    pub fn set_timestamp_kind(&mut self, kind: TimestampKind) -> Result<(), EngineError> {
        if kind == TimestampKind::Fixed {
            Err(EngineError::BadInput(
                "use set_timestamp() to fix the timestamp of a message".to_string(),
            ))
        } else {
            self.kind = kind;
            Ok(())
        }
    }

    /// The fixed timestamp, if one has been assigned.
    pub fn timestamp(&self) -> Option<Timestamp> {
        if self.kind == TimestampKind::Fixed {
            Some(self.timestamp)
        } else {
            None
        }
    }

    pub fn set_timestamp(&mut self, timestamp: Timestamp) {
        self.kind = TimestampKind::Fixed;
        self.timestamp = timestamp;
    }

    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    pub fn set_metadata(&mut self, metadata: impl Into<String>) {
        self.metadata = metadata.into();
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn set_value(&mut self, value: impl Into<Vec<u8>>) {
        self.value = value.into();
    }

    pub fn take_value(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.value)
    }

    /// Human-readable rendering of the value for event payloads.
    pub fn format_value(&self) -> String {
        if is_printable_ascii(&self.value) {
            String::from_utf8_lossy(&self.value).into_owned()
        } else {
            "(binary)".to_string()
        }
    }
}

/// Whether a value can be embedded verbatim in JSON/logs, or must be
/// base64-encoded first.
pub fn is_printable_ascii(value: &[u8]) -> bool {
    value
        .iter()
        .all(|&b| (0x20..0x7f).contains(&b) || b == b'\t' || b == b'\n' || b == b'\r')
}

fn since_epoch() -> std::time::Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

pub fn nanoseconds_clock_timestamp() -> Timestamp {
    since_epoch().as_nanos() as Timestamp
}

pub fn milliseconds_clock_timestamp() -> Timestamp {
    since_epoch().as_millis() as Timestamp
}

pub fn seconds_clock_timestamp() -> Timestamp {
    since_epoch().as_secs() as Timestamp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_defaults() {
        let message = Message::default();
        assert_eq!(message.timestamp_kind(), TimestampKind::Default);
        assert!(message.timestamp().is_none());
        assert_eq!(message.metadata(), "");
        assert!(message.value().is_empty());
    }

    #[test]
    fn test_fixed_timestamp() {
        let mut message = Message::default();
        message.set_timestamp(-42);
        assert_eq!(message.timestamp_kind(), TimestampKind::Fixed);
        assert_eq!(message.timestamp(), Some(-42));
    }

    #[test]
    fn test_set_kind_rejects_fixed() {
        let mut message = Message::default();
        assert!(message.set_timestamp_kind(TimestampKind::Fixed).is_err());
        assert!(message.set_timestamp_kind(TimestampKind::Sequence).is_ok());
        assert_eq!(message.timestamp_kind(), TimestampKind::Sequence);
    }

    #[test]
    fn test_format_value() {
        let mut message = Message::default();
        message.set_value(b"hello world".to_vec());
        assert_eq!(message.format_value(), "hello world");

        message.set_value(vec![0x00, 0xff, 0x80]);
        assert_eq!(message.format_value(), "(binary)");
    }

    #[test]
    fn test_clock_timestamps_ordered() {
        let ns = nanoseconds_clock_timestamp();
        let ms = milliseconds_clock_timestamp();
        let s = seconds_clock_timestamp();
        assert!(ns > ms);
        assert!(ms > s);
        assert!(s > 1_500_000_000); // after mid-2017
    }
}
