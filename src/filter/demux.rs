//! Demultiplexer: an adapter whose pusher routes each input message to any
//! number of named output series.

use std::sync::Arc;

use crate::error::EngineError;
use crate::filter::adapter::{AdapterFilter, Push, PushStatus};
use crate::manager::TimeSeriesManager;
use crate::telemetry::{EngineEvent, EngineEventListener};
use crate::types::Message;
use crate::writer::TimeSeriesWriter;

/// User-supplied part of a demultiplexer: maps one input message to a
/// (possibly empty) set of `(series, message)` pairs.
pub trait Demultiplexer: Send {
    fn demux(&mut self, message: &Message) -> Result<Vec<(String, Message)>, EngineError>;

    fn on_start(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn on_stop(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Adapter pusher that appends each demultiplexed message to the series it
/// addresses, logging failed appends and carrying on (at-most-once).
pub struct DemuxPusher<D: Demultiplexer> {
    filter_name: String,
    manager: Arc<TimeSeriesManager>,
    events: Arc<dyn EngineEventListener>,
    demultiplexer: D,
}

impl<D: Demultiplexer> Push for DemuxPusher<D> {
    fn push(&mut self, message: &Message) -> Result<PushStatus, EngineError> {
        let outputs = self.demultiplexer.demux(message)?;

        for (series, output) in outputs {
            let appended = match TimeSeriesWriter::new(&self.manager, &series) {
                Ok(writer) => writer.append(&output),
                Err(_) => false,
            };

            if !appended {
                self.events.on_event(EngineEvent::MessageDiscarded {
                    filter: self.filter_name.clone(),
                    reason: format!("cannot demux message to time series {}", series),
                });
            }
        }

        Ok(PushStatus::Success)
    }

    fn on_start(&mut self) -> Result<(), EngineError> {
        self.demultiplexer.on_start()
    }

    fn on_stop(&mut self) -> Result<(), EngineError> {
        self.demultiplexer.on_stop()
    }
}

/// A 1-in/N-out filter built from a [`Demultiplexer`].
pub type DemultiplexerFilter<D> = AdapterFilter<DemuxPusher<D>>;

/// Builds a demultiplexer filter over the given input series.
pub fn demultiplexer_filter<D: Demultiplexer>(
    name: impl Into<String>,
    manager: &Arc<TimeSeriesManager>,
    input: impl Into<String>,
    demultiplexer: D,
) -> Result<DemultiplexerFilter<D>, EngineError> {
    let name = name.into();
    let pusher = DemuxPusher {
        filter_name: name.clone(),
        manager: Arc::clone(manager),
        events: manager.events(),
        demultiplexer,
    };
    AdapterFilter::new(name, manager, input, pusher)
}
