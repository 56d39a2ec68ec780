//! Filter runtime: the `Filter` trait and the scheduler that drives every
//! filter on its own worker thread.

pub mod adapter;
pub mod counter;
pub mod csv;
pub mod demux;
pub mod file_lines;
pub mod lora;
pub mod source;

pub use adapter::{AdapterFilter, Push, PushStatus};
pub use counter::CounterFilter;
pub use csv::{CsvSinkFilter, CsvSourceFilter};
pub use demux::{Demultiplexer, DemultiplexerFilter};
pub use file_lines::FileLinesFilter;
pub use lora::LoRaDecoderFilter;
pub use source::{Fetch, FetchStatus, SourceFilter};

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::error::EngineError;
use crate::telemetry::{engine_metrics, noop_event_listener, EngineEvent, EngineEventListener};

/// A producer, consumer, or transformer of messages, driven by the
/// scheduler.
///
/// The cooperative contract: every `step` must either advance bounded work
/// or block on a cursor's `wait_modification` with a timeout, so that the
/// scheduler's continue flag is observed within ~100 ms.
pub trait Filter: Send {
    fn name(&self) -> &str;

    fn start(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    /// One unit of work. `Ok(false)` means the filter is done and its worker
    /// terminates; an error is logged and the worker keeps stepping.
    fn step(&mut self) -> Result<bool, EngineError>;

    fn stop(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

enum ServerState {
    Setup,
    Running,
    Done,
}

/// Drives user-supplied filters in parallel with a graceful lifecycle.
///
/// `start` calls every filter's `start` in declared order (unwinding the
/// already-started ones in reverse on failure), then spawns one worker per
/// filter. `stop` clears the continue flag, joins all workers, then calls
/// `stop` on each filter best-effort.
pub struct FilterServer {
    filters: Vec<Box<dyn Filter>>,
    workers: Vec<(String, JoinHandle<Box<dyn Filter>>)>,
    running: Arc<AtomicBool>,
    state: ServerState,
    events: Arc<dyn EngineEventListener>,
}

impl FilterServer {
    pub fn new() -> Self {
        Self::with_events(noop_event_listener())
    }

    pub fn with_events(events: Arc<dyn EngineEventListener>) -> Self {
        FilterServer {
            filters: Vec::new(),
            workers: Vec::new(),
            running: Arc::new(AtomicBool::new(true)),
            state: ServerState::Setup,
            events,
        }
    }

    pub fn add_filter(&mut self, filter: Box<dyn Filter>) -> Result<(), EngineError> {
        match self.state {
            ServerState::Setup => {
                self.filters.push(filter);
                Ok(())
            }
            _ => Err(EngineError::Internal(
                "cannot add filters to a started server".to_string(),
            )),
        }
    }

    fn start_filter(filter: &mut dyn Filter, events: &dyn EngineEventListener) -> bool {
        match filter.start() {
            Ok(()) => {
                events.on_event(EngineEvent::FilterStarted {
                    name: filter.name().to_string(),
                });
                true
            }
            Err(e) => {
                events.on_event(EngineEvent::FilterStartFailed {
                    name: filter.name().to_string(),
                    error: e.to_string(),
                });
                false
            }
        }
    }

    fn stop_filter(filter: &mut dyn Filter, events: &dyn EngineEventListener) -> bool {
        match filter.stop() {
            Ok(()) => {
                events.on_event(EngineEvent::FilterStopped {
                    name: filter.name().to_string(),
                });
                true
            }
            Err(e) => {
                events.on_event(EngineEvent::FilterStopFailed {
                    name: filter.name().to_string(),
                    error: e.to_string(),
                });
                false
            }
        }
    }

    /// Starts every filter and spawns the workers. On a start failure the
    /// already-started filters are stopped in reverse order and the server
    /// aborts with a configuration error.
    pub fn start(&mut self) -> Result<(), EngineError> {
        match self.state {
            ServerState::Setup => {}
            ServerState::Running => return Ok(()),
            ServerState::Done => {
                return Err(EngineError::Internal(
                    "cannot restart a stopped server".to_string(),
                ))
            }
        }

        for index in 0..self.filters.len() {
            if !Self::start_filter(self.filters[index].as_mut(), self.events.as_ref()) {
                // Unwind the already-started filters in reverse order.
                for started in (0..index).rev() {
                    Self::stop_filter(self.filters[started].as_mut(), self.events.as_ref());
                }
                return Err(EngineError::ConfigError(
                    "one of the filters could not start".to_string(),
                ));
            }
        }

        self.events.on_event(EngineEvent::SchedulerStarted {
            filters: self.filters.len(),
        });

        for mut filter in self.filters.drain(..) {
            let name = filter.name().to_string();
            let running = Arc::clone(&self.running);
            let events = Arc::clone(&self.events);

            let handle = thread::Builder::new()
                .name(format!("rill-filter-{}", name))
                .spawn(move || {
                    worker_loop(filter.as_mut(), &running, events.as_ref());
                    filter
                })
                .map_err(|e| EngineError::Internal(format!("cannot spawn worker: {}", e)))?;

            self.workers.push((name, handle));
        }

        self.state = ServerState::Running;
        Ok(())
    }

    /// Stops the workers and the filters. Returns `false` if some filter
    /// failed to stop cleanly.
    pub fn stop(&mut self) -> bool {
        match self.state {
            ServerState::Running => {}
            ServerState::Done => return true,
            ServerState::Setup => return false,
        }

        self.events.on_event(EngineEvent::SchedulerStopping);
        self.running.store(false, Ordering::Relaxed);

        let mut success = true;
        for (name, handle) in self.workers.drain(..) {
            match handle.join() {
                Ok(mut filter) => {
                    if !Self::stop_filter(filter.as_mut(), self.events.as_ref()) {
                        success = false;
                    }
                }
                Err(_) => {
                    self.events.on_event(EngineEvent::FilterPanicked { name });
                    success = false;
                }
            }
        }

        self.state = ServerState::Done;
        success
    }
}

impl Default for FilterServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FilterServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(filter: &mut dyn Filter, running: &AtomicBool, events: &dyn EngineEventListener) {
    while running.load(Ordering::Relaxed) {
        engine_metrics::record_filter_step();

        let step = catch_unwind(AssertUnwindSafe(|| filter.step()));
        match step {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                events.on_event(EngineEvent::FilterFinished {
                    name: filter.name().to_string(),
                });
                break;
            }
            Ok(Err(e)) => {
                engine_metrics::record_filter_step_error();
                events.on_event(EngineEvent::FilterStepError {
                    name: filter.name().to_string(),
                    error: e.to_string(),
                });
            }
            Err(_) => {
                engine_metrics::record_filter_step_error();
                events.on_event(EngineEvent::FilterPanicked {
                    name: filter.name().to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingFilter {
        name: String,
        steps: Arc<AtomicUsize>,
        limit: usize,
        fail_start: bool,
        stopped: Arc<AtomicBool>,
    }

    impl Filter for CountingFilter {
        fn name(&self) -> &str {
            &self.name
        }

        fn start(&mut self) -> Result<(), EngineError> {
            if self.fail_start {
                Err(EngineError::ConfigError("boom".to_string()))
            } else {
                Ok(())
            }
        }

        fn step(&mut self) -> Result<bool, EngineError> {
            let count = self.steps.fetch_add(1, Ordering::Relaxed) + 1;
            if count >= self.limit {
                Ok(false)
            } else {
                thread::sleep(Duration::from_millis(1));
                Ok(true)
            }
        }

        fn stop(&mut self) -> Result<(), EngineError> {
            self.stopped.store(true, Ordering::Relaxed);
            Ok(())
        }
    }

    fn counting(name: &str, limit: usize, fail_start: bool) -> (CountingFilter, Arc<AtomicUsize>, Arc<AtomicBool>) {
        let steps = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicBool::new(false));
        (
            CountingFilter {
                name: name.to_string(),
                steps: Arc::clone(&steps),
                limit,
                fail_start,
                stopped: Arc::clone(&stopped),
            },
            steps,
            stopped,
        )
    }

    #[test]
    fn test_filters_run_until_done() {
        let (filter, steps, stopped) = counting("worker", 5, false);

        let mut server = FilterServer::new();
        server.add_filter(Box::new(filter)).unwrap();
        server.start().unwrap();

        // The filter finishes on its own after 5 steps.
        for _ in 0..200 {
            if steps.load(Ordering::Relaxed) >= 5 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        assert!(server.stop());
        assert_eq!(steps.load(Ordering::Relaxed), 5);
        assert!(stopped.load(Ordering::Relaxed));
    }

    #[test]
    fn test_start_failure_unwinds() {
        let (good, _, good_stopped) = counting("good", usize::MAX, false);
        let (bad, bad_steps, _) = counting("bad", usize::MAX, true);

        let mut server = FilterServer::new();
        server.add_filter(Box::new(good)).unwrap();
        server.add_filter(Box::new(bad)).unwrap();

        assert!(server.start().is_err());
        // The already-started filter was stopped; nothing ever stepped.
        assert!(good_stopped.load(Ordering::Relaxed));
        assert_eq!(bad_steps.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_stop_interrupts_long_running_filter() {
        let (filter, steps, stopped) = counting("endless", usize::MAX, false);

        let mut server = FilterServer::new();
        server.add_filter(Box::new(filter)).unwrap();
        server.start().unwrap();

        while steps.load(Ordering::Relaxed) == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        assert!(server.stop());
        assert!(stopped.load(Ordering::Relaxed));
    }

    #[test]
    fn test_step_error_is_not_fatal() {
        struct FlakyFilter {
            calls: Arc<AtomicUsize>,
        }

        impl Filter for FlakyFilter {
            fn name(&self) -> &str {
                "flaky"
            }

            fn step(&mut self) -> Result<bool, EngineError> {
                let calls = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
                match calls {
                    1 => Err(EngineError::BadInput("transient".to_string())),
                    2 => Ok(true),
                    _ => Ok(false),
                }
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let mut server = FilterServer::new();
        server
            .add_filter(Box::new(FlakyFilter {
                calls: Arc::clone(&calls),
            }))
            .unwrap();
        server.start().unwrap();

        for _ in 0..200 {
            if calls.load(Ordering::Relaxed) >= 3 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        assert!(server.stop());
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }
}
