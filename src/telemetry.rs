use std::sync::Arc;

/// Structured, in-process event hook for observability.
///
/// This crate is a library; emitting logs directly (e.g. `println!`) is not
/// acceptable for production. Instead, callers can provide an implementation
/// that forwards these events to `tracing`, `log`, metrics, or custom sinks.
pub trait EngineEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: EngineEvent);
}

/// Structured events emitted by the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    SeriesCreated { name: String },
    SeriesAutoCreated { name: String },
    SeriesDeleted { name: String },

    AppendRejected { series: String, timestamp: i64 },

    FilterStarted { name: String },
    FilterStopped { name: String },
    FilterFinished { name: String },
    FilterStartFailed { name: String, error: String },
    FilterStopFailed { name: String, error: String },
    FilterStepError { name: String, error: String },
    FilterPanicked { name: String },
    MessageFetched { filter: String, value: String, metadata: String },
    MessageDiscarded { filter: String, reason: String },

    SchedulerStarted { filters: usize },
    SchedulerStopping,

    CheckpointFailed { error: String },
    FileOpened { path: std::path::PathBuf },
    FileClosed { path: std::path::PathBuf },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl EngineEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: EngineEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn EngineEventListener> {
    Arc::new(NoopEventListener)
}

/// Metrics instrumentation through the `metrics` facade.
///
/// Recording is effectively a no-op until the embedding application installs
/// a recorder, so the engine can emit unconditionally.
pub mod engine_metrics {
    pub const APPENDED_ITEMS: &str = "rill_appended_items";
    pub const APPENDED_BYTES: &str = "rill_appended_bytes";
    pub const REJECTED_APPENDS: &str = "rill_rejected_appends";
    pub const FILTER_STEPS: &str = "rill_filter_steps";
    pub const FILTER_STEP_ERRORS: &str = "rill_filter_step_errors";

    #[inline]
    pub fn record_append(bytes: u64) {
        ::metrics::counter!(APPENDED_ITEMS).increment(1);
        if bytes > 0 {
            ::metrics::counter!(APPENDED_BYTES).increment(bytes);
        }
    }

    #[inline]
    pub fn record_rejected_append() {
        ::metrics::counter!(REJECTED_APPENDS).increment(1);
    }

    #[inline]
    pub fn record_filter_step() {
        ::metrics::counter!(FILTER_STEPS).increment(1);
    }

    #[inline]
    pub fn record_filter_step_error() {
        ::metrics::counter!(FILTER_STEP_ERRORS).increment(1);
    }

    pub fn describe_all() {
        use ::metrics::{describe_counter, Unit};

        describe_counter!(
            APPENDED_ITEMS,
            Unit::Count,
            "Total number of items committed to time series."
        );
        describe_counter!(
            APPENDED_BYTES,
            Unit::Bytes,
            "Total number of value bytes committed to time series."
        );
        describe_counter!(
            REJECTED_APPENDS,
            Unit::Count,
            "Appends rejected for monotonicity or quota violations."
        );
        describe_counter!(
            FILTER_STEPS,
            Unit::Count,
            "Total number of filter step() invocations."
        );
        describe_counter!(
            FILTER_STEP_ERRORS,
            Unit::Count,
            "Filter step() invocations that returned an error."
        );
    }
}
