//! Base for adapter filters: one input series, any number of outputs.

use crate::error::EngineError;
use crate::filter::Filter;
use crate::manager::TimeSeriesManager;
use crate::reader::TimeSeriesReader;
use crate::telemetry::{EngineEvent, EngineEventListener};
use crate::types::{Message, Timestamp};
use crate::writer::TimeSeriesWriter;
use std::sync::Arc;

/// Outcome of one push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    /// Consumed; the read head advances (and the input item is popped when
    /// pop-input is enabled).
    Success,
    /// Transient failure; the same message is retried on the next step.
    Retry,
    /// Permanent failure; the read head advances past the message
    /// (at-most-once delivery).
    Failure,
}

/// User-supplied part of an adapter filter.
pub trait Push: Send {
    fn push(&mut self, message: &Message) -> Result<PushStatus, EngineError>;

    fn on_start(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn on_stop(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// A 1-in/N-out filter: each step reads one message from the input series
/// and hands it to the pusher.
///
/// With `replay_history` unset (the default), `start` places the virtual
/// read head on the last existing item so only future items are seen; set,
/// the input is replayed from the beginning. With `pop_input`, successfully
/// pushed items are deleted from the input series.
pub struct AdapterFilter<P: Push> {
    name: String,
    input: String,
    reader: TimeSeriesReader,
    input_popper: Option<TimeSeriesWriter>,
    replay_history: bool,
    head: Option<Timestamp>,
    events: Arc<dyn EngineEventListener>,
    pusher: P,
}

impl<P: Push> AdapterFilter<P> {
    pub fn new(
        name: impl Into<String>,
        manager: &TimeSeriesManager,
        input: impl Into<String>,
        pusher: P,
    ) -> Result<Self, EngineError> {
        let input = input.into();
        Ok(AdapterFilter {
            name: name.into(),
            reader: TimeSeriesReader::new(manager, &input, true)?,
            input_popper: None,
            replay_history: false,
            head: None,
            events: manager.events(),
            input,
            pusher,
        })
    }

    pub fn set_replay_history(&mut self, replay: bool) {
        self.replay_history = replay;
    }

    /// Enables deletion of input items once they have been pushed.
    pub fn set_pop_input(
        &mut self,
        manager: &TimeSeriesManager,
        pop: bool,
    ) -> Result<(), EngineError> {
        self.input_popper = if pop {
            Some(TimeSeriesWriter::new(manager, &self.input)?)
        } else {
            None
        };
        Ok(())
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn pusher_mut(&mut self) -> &mut P {
        &mut self.pusher
    }
}

impl<P: Push> Filter for AdapterFilter<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<(), EngineError> {
        self.head = None;

        if !self.replay_history {
            // Ignore the history: park the reading head on the last existing
            // item so only newly appended items are consumed.
            let mut transaction = self.reader.transaction();
            if transaction.seek_last() {
                self.head = transaction.timestamp();
            }
        }

        self.pusher.on_start()
    }

    fn step(&mut self) -> Result<bool, EngineError> {
        let next = {
            // Lock the input series as briefly as possible.
            let mut transaction = self.reader.transaction();

            let found = match self.head {
                // Look up the item just after the last-consumed one.
                Some(head) => transaction.seek_nearest(head.saturating_add(1)),
                // Empty at start time, or replaying the whole history.
                None => transaction.seek_first(),
            };

            if found {
                transaction
                    .timestamp()
                    .and_then(|ts| transaction.read().map(|(metadata, value)| (ts, metadata, value)))
            } else {
                None
            }
        };

        let (timestamp, metadata, value) = match next {
            Some(item) => item,
            None => {
                // No new input; wait for the next modification.
                self.reader.wait_modification(crate::DEFAULT_WAIT_TIMEOUT);
                return Ok(true);
            }
        };

        let mut message = Message::default();
        message.set_timestamp(timestamp);
        message.set_metadata(metadata);
        message.set_value(value);

        let status = self.pusher.push(&message)?;

        match status {
            PushStatus::Success | PushStatus::Failure => {
                // In both cases, advance the reading head past the message.
                self.head = Some(timestamp);
            }
            PushStatus::Retry => {}
        }

        if status == PushStatus::Success {
            if let Some(popper) = &self.input_popper {
                let mut transaction = popper.transaction();
                transaction.delete_range(timestamp, timestamp.saturating_add(1));
            }
        } else if status == PushStatus::Failure {
            self.events.on_event(EngineEvent::MessageDiscarded {
                filter: self.name.clone(),
                reason: format!("push failed for timestamp {}", timestamp),
            });
        }

        Ok(true)
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        self.pusher.on_stop()
    }
}
