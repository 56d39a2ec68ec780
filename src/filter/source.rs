//! Base for source filters: no input series, one output series.

use crate::error::EngineError;
use crate::filter::Filter;
use crate::manager::TimeSeriesManager;
use crate::reader::TimeSeriesReader;
use crate::telemetry::{EngineEvent, EngineEventListener};
use crate::types::{Message, TimestampKind};
use crate::writer::TimeSeriesWriter;
use std::sync::Arc;

/// Outcome of one fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// The message is valid and must be appended to the output series.
    Success,
    /// The message could not be decoded; it is skipped.
    Invalid,
    /// The source is exhausted; the filter terminates.
    Done,
}

/// User-supplied part of a source filter.
pub trait Fetch: Send {
    /// Produces the next message, blocking at most ~1 s.
    fn fetch(&mut self, message: &mut Message) -> Result<FetchStatus, EngineError>;

    /// Called when the filter starts, before the first fetch.
    fn on_start(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Called when the filter stops.
    fn on_stop(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// A 0-in/1-out filter: each step fetches one message and appends it to the
/// output series.
///
/// With `max_pending > 0`, the source applies back-pressure: while the
/// output series already holds that many items, the step skips the fetch and
/// briefly blocks on the output's modification signal instead.
pub struct SourceFilter<F: Fetch> {
    name: String,
    output: String,
    writer: TimeSeriesWriter,
    room_reader: TimeSeriesReader,
    max_pending: u64,
    default_timestamp: TimestampKind,
    events: Arc<dyn EngineEventListener>,
    fetcher: F,
}

impl<F: Fetch> SourceFilter<F> {
    pub fn new(
        name: impl Into<String>,
        manager: &TimeSeriesManager,
        output: impl Into<String>,
        fetcher: F,
    ) -> Result<Self, EngineError> {
        let output = output.into();
        Ok(SourceFilter {
            name: name.into(),
            writer: TimeSeriesWriter::new(manager, &output)?,
            room_reader: TimeSeriesReader::new(manager, &output, true)?,
            output,
            max_pending: 0,
            default_timestamp: TimestampKind::Default,
            events: manager.events(),
            fetcher,
        })
    }

    /// Limits the number of not-yet-consumed items in the output series;
    /// zero disables back-pressure.
    pub fn set_max_pending_messages(&mut self, max_pending: u64) {
        self.max_pending = max_pending;
    }

    /// Policy stamped on fetched messages; must not be `Fixed` (sources that
    /// know their timestamps fix them inside `fetch`).
    pub fn set_default_timestamp_kind(&mut self, kind: TimestampKind) -> Result<(), EngineError> {
        match kind {
            TimestampKind::Fixed => Err(EngineError::BadInput(
                "a source filter cannot default to fixed timestamps".to_string(),
            )),
            _ => {
                self.default_timestamp = kind;
                Ok(())
            }
        }
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn fetcher_mut(&mut self) -> &mut F {
        &mut self.fetcher
    }

    fn has_room(&mut self) -> bool {
        if self.max_pending == 0 {
            return true;
        }

        let length = self.room_reader.transaction().statistics().length;
        if length < self.max_pending {
            return true;
        }

        // Too many pending messages in the output series, wait a bit.
        self.room_reader.wait_modification(crate::DEFAULT_WAIT_TIMEOUT);
        false
    }
}

impl<F: Fetch> Filter for SourceFilter<F> {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<(), EngineError> {
        self.fetcher.on_start()
    }

    fn step(&mut self) -> Result<bool, EngineError> {
        if !self.has_room() {
            return Ok(true);
        }

        let mut message = Message::default();
        message.set_timestamp_kind(self.default_timestamp)?;

        match self.fetcher.fetch(&mut message)? {
            FetchStatus::Success => {
                self.events.on_event(EngineEvent::MessageFetched {
                    filter: self.name.clone(),
                    value: message.format_value(),
                    metadata: message.metadata().to_string(),
                });
                self.writer.append(&message);
                Ok(true)
            }
            FetchStatus::Invalid => Ok(true),
            FetchStatus::Done => Ok(false),
        }
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        self.fetcher.on_stop()
    }
}
