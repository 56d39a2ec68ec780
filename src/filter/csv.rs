//! CSV file source and sink.
//!
//! The wire format is one message per line, four comma-separated fields:
//! `series, timestamp, metadata, value`, each wrapped in double quotes with
//! `""` escaping an embedded `"`. Values are base64-encoded unless the
//! base64 option is disabled, in which case values containing commas or
//! newlines cannot round-trip.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::EngineError;
use crate::filter::adapter::{AdapterFilter, Push, PushStatus};
use crate::filter::source::{Fetch, FetchStatus, SourceFilter};
use crate::manager::TimeSeriesManager;
use crate::types::{Message, Timestamp};
use crate::writers_pool::{FileAccessor, FileWritersPool};

pub const CSV_HEADER: &str = "\"series\",\"timestamp\",\"metadata\",\"value\"\n";

fn escape(field: &str) -> String {
    let mut result = String::with_capacity(field.len() + 2);
    result.push('"');
    for c in field.chars() {
        if c == '"' {
            result.push('"');
        }
        result.push(c);
    }
    result.push('"');
    result
}

fn unescape(field: &str) -> String {
    let trimmed = field.trim();
    let inner = if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    };
    inner.replace("\"\"", "\"")
}

/// Renders one CSV line for a message of the given series.
pub fn encode_row(series: &str, timestamp: Timestamp, metadata: &str, value: &[u8], base64: bool) -> String {
    let value = if base64 {
        BASE64.encode(value)
    } else {
        String::from_utf8_lossy(value).into_owned()
    };

    format!(
        "{},{},{},{}\n",
        escape(series),
        escape(&timestamp.to_string()),
        escape(metadata),
        escape(&value)
    )
}

/// Parses one CSV line into `(series, timestamp, metadata, value)`.
pub fn decode_row(line: &str, base64: bool) -> Result<(String, Timestamp, String, Vec<u8>), EngineError> {
    let columns: Vec<&str> = line.split(',').collect();
    if columns.len() != 4 {
        return Err(EngineError::BadInput(format!(
            "CSV rows must have 4 columns, got {}",
            columns.len()
        )));
    }

    let series = unescape(columns[0]);
    let timestamp = unescape(columns[1]);
    let metadata = unescape(columns[2]);
    let value = unescape(columns[3]);

    let timestamp: Timestamp = timestamp
        .parse()
        .map_err(|_| EngineError::BadInput(format!("cannot decode timestamp: {:?}", timestamp)))?;

    let value = if base64 {
        BASE64
            .decode(value.as_bytes())
            .map_err(|_| EngineError::BadInput("the value is not encoded as base64".to_string()))?
    } else {
        value.into_bytes()
    };

    Ok((series, timestamp, metadata, value))
}

// ---------- Source ----------

pub struct CsvSourceFetcher {
    path: PathBuf,
    base64: bool,
    reader: Option<BufReader<File>>,
    line: u64,
}

impl Fetch for CsvSourceFetcher {
    fn fetch(&mut self, message: &mut Message) -> Result<FetchStatus, EngineError> {
        let reader = match &mut self.reader {
            Some(reader) => reader,
            None => return Ok(FetchStatus::Done),
        };

        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(FetchStatus::Done);
        }
        self.line += 1;

        let line = line.trim();
        if line.is_empty() {
            return Ok(FetchStatus::Invalid);
        }

        match decode_row(line, self.base64) {
            // The series column names the origin; routing is fixed by the
            // filter's configured output.
            Ok((_series, timestamp, metadata, value)) => {
                message.set_timestamp(timestamp);
                message.set_metadata(metadata);
                message.set_value(value);
                Ok(FetchStatus::Success)
            }
            Err(e) => Err(EngineError::BadInput(format!(
                "cannot decode line {} of {}: {}",
                self.line,
                self.path.display(),
                e
            ))),
        }
    }

    fn on_start(&mut self) -> Result<(), EngineError> {
        self.line = 0;
        self.reader = Some(BufReader::new(File::open(&self.path)?));
        Ok(())
    }

    fn on_stop(&mut self) -> Result<(), EngineError> {
        self.reader = None;
        Ok(())
    }
}

/// A source filter replaying messages recorded in a CSV file.
pub type CsvSourceFilter = SourceFilter<CsvSourceFetcher>;

pub fn csv_source_filter(
    name: impl Into<String>,
    manager: &TimeSeriesManager,
    output: impl Into<String>,
    path: impl Into<PathBuf>,
) -> Result<CsvSourceFilter, EngineError> {
    SourceFilter::new(
        name,
        manager,
        output,
        CsvSourceFetcher {
            path: path.into(),
            base64: true,
            reader: None,
            line: 0,
        },
    )
}

impl CsvSourceFilter {
    pub fn set_base64(&mut self, base64: bool) {
        self.fetcher_mut().base64 = base64;
    }
}

// ---------- Sink ----------

pub struct CsvSinkPusher {
    series: String,
    pool: FileWritersPool,
    path: PathBuf,
    append: bool,
    header: bool,
    base64: bool,
    accessor: Option<FileAccessor>,
}

impl Push for CsvSinkPusher {
    fn push(&mut self, message: &Message) -> Result<PushStatus, EngineError> {
        let accessor = match &self.accessor {
            Some(accessor) => accessor,
            None => return Ok(PushStatus::Retry),
        };

        let timestamp = match message.timestamp() {
            Some(ts) => ts,
            None => return Ok(PushStatus::Failure),
        };

        let row = encode_row(
            &self.series,
            timestamp,
            message.metadata(),
            message.value(),
            self.base64,
        );

        match accessor.write(row.as_bytes()) {
            Ok(()) => Ok(PushStatus::Success),
            Err(_) => Ok(PushStatus::Retry),
        }
    }

    fn on_start(&mut self) -> Result<(), EngineError> {
        let header = if self.header { CSV_HEADER } else { "" };
        self.accessor = Some(self.pool.open(&self.path, self.append, header.as_bytes())?);
        Ok(())
    }

    fn on_stop(&mut self) -> Result<(), EngineError> {
        self.accessor = None;
        Ok(())
    }
}

/// A sink filter recording a series into a (possibly shared) CSV file.
pub type CsvSinkFilter = AdapterFilter<CsvSinkPusher>;

pub fn csv_sink_filter(
    name: impl Into<String>,
    manager: &TimeSeriesManager,
    input: impl Into<String>,
    pool: FileWritersPool,
    path: impl Into<PathBuf>,
) -> Result<CsvSinkFilter, EngineError> {
    let input = input.into();
    let pusher = CsvSinkPusher {
        series: input.clone(),
        pool,
        path: path.into(),
        append: true,
        header: false,
        base64: true,
        accessor: None,
    };
    AdapterFilter::new(name, manager, input, pusher)
}

impl CsvSinkFilter {
    pub fn set_append(&mut self, append: bool) {
        self.pusher_mut().append = append;
    }

    pub fn set_header(&mut self, header: bool) {
        self.pusher_mut().header = header;
    }

    pub fn set_base64(&mut self, base64: bool) {
        self.pusher_mut().base64 = base64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_roundtrip() {
        for field in ["", "plain", "with \"quotes\"", "trailing\"", "\"", "a,b"] {
            assert_eq!(unescape(&escape(field)), field);
        }
    }

    #[test]
    fn test_unescape_unquoted() {
        assert_eq!(unescape("  plain  "), "plain");
        assert_eq!(unescape("\"\""), "");
    }

    #[test]
    fn test_row_roundtrip_base64() {
        // All byte values survive when base64 is enabled.
        let value: Vec<u8> = (0..=255u8).collect();
        let row = encode_row("lora", -7, "application/octet-stream", &value, true);
        let (series, timestamp, metadata, decoded) = decode_row(row.trim(), true).unwrap();

        assert_eq!(series, "lora");
        assert_eq!(timestamp, -7);
        assert_eq!(metadata, "application/octet-stream");
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_row_roundtrip_plain() {
        let row = encode_row("hello", 42, "text/plain", b"value 42", false);
        let (series, timestamp, metadata, value) = decode_row(row.trim(), false).unwrap();

        assert_eq!(series, "hello");
        assert_eq!(timestamp, 42);
        assert_eq!(metadata, "text/plain");
        assert_eq!(value, b"value 42");
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(decode_row("only,three,columns", true).is_err());
        assert!(decode_row("\"a\",\"nan\",\"m\",\"\"", true).is_err());
        assert!(decode_row("\"a\",\"1\",\"m\",\"not base64!!\"", true).is_err());
    }
}
