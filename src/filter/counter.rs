//! Counter source: emits an arithmetic sequence as decimal strings, one
//! message per delay tick. Useful for smoke-testing a pipeline.

use std::time::Duration;

use crate::error::EngineError;
use crate::filter::source::{Fetch, FetchStatus, SourceFilter};
use crate::manager::TimeSeriesManager;
use crate::types::Message;

pub struct CounterFetcher {
    metadata: String,
    counter: i64,
    stop: i64,
    increment: u64,
    delay: Duration,
}

impl Fetch for CounterFetcher {
    fn fetch(&mut self, message: &mut Message) -> Result<FetchStatus, EngineError> {
        if self.counter >= self.stop {
            return Ok(FetchStatus::Done);
        }

        std::thread::sleep(self.delay);
        message.set_metadata(self.metadata.clone());
        message.set_value(self.counter.to_string().into_bytes());
        self.counter += self.increment as i64;
        Ok(FetchStatus::Success)
    }
}

/// A counter source filter.
pub type CounterFilter = SourceFilter<CounterFetcher>;

/// Builds a counter filter with the default range `0..100`, increment 1,
/// delay 100 ms, and `text/plain` metadata.
pub fn counter_filter(
    name: impl Into<String>,
    manager: &TimeSeriesManager,
    output: impl Into<String>,
) -> Result<CounterFilter, EngineError> {
    SourceFilter::new(
        name,
        manager,
        output,
        CounterFetcher {
            metadata: "text/plain".to_string(),
            counter: 0,
            stop: 100,
            increment: 1,
            delay: Duration::from_millis(100),
        },
    )
}

impl CounterFilter {
    pub fn set_range(&mut self, start: i64, stop: i64) -> Result<(), EngineError> {
        if start > stop {
            return Err(EngineError::ConfigError(format!(
                "counter start {} is after stop {}",
                start, stop
            )));
        }
        let fetcher = self.fetcher_mut();
        fetcher.counter = start;
        fetcher.stop = stop;
        Ok(())
    }

    pub fn set_increment(&mut self, increment: u64) -> Result<(), EngineError> {
        if increment == 0 {
            return Err(EngineError::ConfigError(
                "counter increment cannot be zero".to_string(),
            ));
        }
        self.fetcher_mut().increment = increment;
        Ok(())
    }

    pub fn set_delay(&mut self, delay: Duration) {
        self.fetcher_mut().delay = delay;
    }

    pub fn set_metadata(&mut self, metadata: impl Into<String>) {
        self.fetcher_mut().metadata = metadata.into();
    }
}
