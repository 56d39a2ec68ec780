//! Time-series manager: names, creates, destroys, and locks series, and
//! dispatches change notifications to registered observers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use crate::backend::TimeSeriesBackend;
use crate::error::EngineError;
use crate::telemetry::{noop_event_listener, EngineEvent, EngineEventListener};
use crate::types::TimestampKind;

/// Observer of the lifecycle of a single time series.
///
/// Observers are held through weak handles; dropping the observer
/// unregisters it implicitly. `series_modified` is dispatched after a write
/// transaction commits, while the series lock is still held, so observers
/// never see an incoherent state. Implementations must therefore be quick
/// and must not re-enter the series.
pub trait SeriesObserver: Send + Sync {
    fn series_modified(&self, name: &str);
    fn series_deleted(&self, name: &str);
}

/// Materializes backends for declared and auto-created series.
pub trait TimeSeriesFactory: Send + Sync {
    /// The series to create when the manager is constructed.
    fn manual_series(&self) -> Vec<(String, TimestampKind)>;

    /// Backend for a manually declared series.
    fn create_manual(&self, name: &str) -> Result<Box<dyn TimeSeriesBackend>, EngineError>;

    /// Backend and policy for an auto-created series, or `None` when
    /// auto-creation is not configured.
    fn create_auto(
        &self,
        name: &str,
    ) -> Result<Option<(Box<dyn TimeSeriesBackend>, TimestampKind)>, EngineError>;
}

pub(crate) struct SeriesState {
    pub(crate) backend: Option<Box<dyn TimeSeriesBackend>>,
    observers: Vec<(u64, Weak<dyn SeriesObserver>)>,
}

/// One named series: its backend, default timestamp policy, and observers,
/// all behind the series lock (shared for read transactions, exclusive for
/// write transactions and lifecycle changes).
pub(crate) struct Series {
    name: String,
    default_timestamp: TimestampKind,
    pub(crate) state: RwLock<SeriesState>,
}

impl Series {
    fn new(name: &str, backend: Box<dyn TimeSeriesBackend>, kind: TimestampKind) -> Self {
        Series {
            name: name.to_string(),
            default_timestamp: kind,
            state: RwLock::new(SeriesState {
                backend: Some(backend),
                observers: Vec::new(),
            }),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn default_timestamp(&self) -> TimestampKind {
        self.default_timestamp
    }

    pub(crate) fn read_state(&self) -> RwLockReadGuard<'_, SeriesState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn write_state(&self) -> RwLockWriteGuard<'_, SeriesState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Notifies observers of a committed mutation. The caller must hold the
    /// series lock through `state`.
    pub(crate) fn notify_modification(&self, state: &SeriesState) {
        for (_, observer) in &state.observers {
            if let Some(observer) = observer.upgrade() {
                observer.series_modified(&self.name);
            }
        }
    }

    fn delete(&self) {
        let mut state = self.write_state();
        for (_, observer) in &state.observers {
            if let Some(observer) = observer.upgrade() {
                observer.series_deleted(&self.name);
            }
        }
        state.backend = None;
    }

    fn register_observer(&self, id: u64, observer: Weak<dyn SeriesObserver>) {
        let mut state = self.write_state();
        state.observers.retain(|(_, o)| o.strong_count() > 0);
        state.observers.push((id, observer));
    }

    fn unregister_observer(&self, id: u64) {
        let mut state = self.write_state();
        state.observers.retain(|(other, _)| *other != id);
    }
}

/// Condvar-based waiter for blocking accessors. A series modification or
/// deletion raises the flag and wakes the waiter; `wait` consumes the flag.
#[derive(Default)]
struct ModificationWaiter {
    modified: Mutex<bool>,
    condition: Condvar,
}

impl ModificationWaiter {
    fn raise(&self) {
        let mut modified = self.modified.lock().unwrap_or_else(|e| e.into_inner());
        *modified = true;
        self.condition.notify_one();
    }

    fn wait(&self, timeout: Duration) -> bool {
        let mut modified = self.modified.lock().unwrap_or_else(|e| e.into_inner());
        while !*modified {
            let (guard, result) = self
                .condition
                .wait_timeout(modified, timeout)
                .unwrap_or_else(|e| e.into_inner());
            modified = guard;
            if result.timed_out() && !*modified {
                return false;
            }
        }
        *modified = false;
        true
    }
}

impl SeriesObserver for ModificationWaiter {
    fn series_modified(&self, _name: &str) {
        self.raise();
    }

    fn series_deleted(&self, _name: &str) {
        self.raise();
    }
}

/// Shared handle onto a series held by reader and writer cursors.
///
/// The series outlives its longest-living accessor; deleting the series
/// drops the backend but the handle survives, observing an empty read-only
/// series. A blocking accessor registers a waiter observer and supports
/// synchronous `wait_modification`; the non-blocking flavor degrades to a
/// plain sleep.
pub struct SeriesAccessor {
    pub(crate) series: Arc<Series>,
    waiter: Option<Arc<ModificationWaiter>>,
    observer_id: u64,
}

impl SeriesAccessor {
    /// Blocks until the series is modified or deleted, or until `timeout`
    /// expires. Returns `true` if a notification was consumed. Accessors
    /// opened without `blocking_wait` sleep for the timeout and return
    /// `true` (polling fallback).
    pub fn wait_modification(&self, timeout: Duration) -> bool {
        match &self.waiter {
            Some(waiter) => waiter.wait(timeout),
            None => {
                std::thread::sleep(timeout);
                true
            }
        }
    }
}

impl Drop for SeriesAccessor {
    fn drop(&mut self) {
        if self.waiter.is_some() {
            self.series.unregister_observer(self.observer_id);
        }
    }
}

/// Process-wide registry of time series.
///
/// The manager exclusively owns series state. It is constructed around a
/// [`TimeSeriesFactory`] that materializes backends for declared series and,
/// optionally, for series auto-created on first lookup.
pub struct TimeSeriesManager {
    content: Mutex<BTreeMap<String, Arc<Series>>>,
    factory: Box<dyn TimeSeriesFactory>,
    next_observer_id: AtomicU64,
    events: Arc<dyn EngineEventListener>,
}

impl TimeSeriesManager {
    pub fn new(factory: Box<dyn TimeSeriesFactory>) -> Result<Self, EngineError> {
        Self::with_events(factory, noop_event_listener())
    }

    pub fn with_events(
        factory: Box<dyn TimeSeriesFactory>,
        events: Arc<dyn EngineEventListener>,
    ) -> Result<Self, EngineError> {
        let manager = TimeSeriesManager {
            content: Mutex::new(BTreeMap::new()),
            factory,
            next_observer_id: AtomicU64::new(0),
            events,
        };

        for (name, kind) in manager.factory.manual_series() {
            manager.create(&name, kind)?;
        }

        Ok(manager)
    }

    /// Creates a declared series. Fails if the name already exists.
    pub fn create(&self, name: &str, kind: TimestampKind) -> Result<(), EngineError> {
        let mut content = self.content.lock()?;

        if content.contains_key(name) {
            return Err(EngineError::SeriesAlreadyExists(name.to_string()));
        }

        let backend = self.factory.create_manual(name)?;
        content.insert(name.to_string(), Arc::new(Series::new(name, backend, kind)));
        self.events.on_event(EngineEvent::SeriesCreated {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Deletes a series: notifies observers, then drops the backend. Cursors
    /// holding the series observe an empty read-only series afterwards.
    pub fn delete(&self, name: &str) -> Result<(), EngineError> {
        let series = {
            let mut content = self.content.lock()?;
            content
                .remove(name)
                .ok_or_else(|| EngineError::SeriesNotFound(name.to_string()))?
        };

        series.delete();
        self.events.on_event(EngineEvent::SeriesDeleted {
            name: name.to_string(),
        });
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<String>, EngineError> {
        let content = self.content.lock()?;
        Ok(content.keys().cloned().collect())
    }

    /// Looks a series up, auto-creating it if the factory provides an
    /// auto-configuration.
    fn series(&self, name: &str) -> Result<Arc<Series>, EngineError> {
        let mut content = self.content.lock()?;

        if let Some(series) = content.get(name) {
            return Ok(Arc::clone(series));
        }

        match self.factory.create_auto(name)? {
            Some((backend, kind)) => {
                let series = Arc::new(Series::new(name, backend, kind));
                content.insert(name.to_string(), Arc::clone(&series));
                self.events.on_event(EngineEvent::SeriesAutoCreated {
                    name: name.to_string(),
                });
                Ok(series)
            }
            None => Err(EngineError::SeriesNotFound(name.to_string())),
        }
    }

    /// Opens a shared handle onto a series for a cursor. With
    /// `blocking_wait`, the accessor subscribes to modification
    /// notifications and `wait_modification` blocks on them.
    pub fn open_accessor(
        &self,
        name: &str,
        blocking_wait: bool,
    ) -> Result<SeriesAccessor, EngineError> {
        let series = self.series(name)?;
        let observer_id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);

        let waiter = if blocking_wait {
            let waiter = Arc::new(ModificationWaiter::default());
            let weak: Weak<ModificationWaiter> = Arc::downgrade(&waiter);
            series.register_observer(observer_id, weak);
            Some(waiter)
        } else {
            None
        };

        Ok(SeriesAccessor {
            series,
            waiter,
            observer_id,
        })
    }

    /// Registers an external observer on a series. Returns a token for
    /// [`TimeSeriesManager::unregister_observer`]. The observer is held
    /// weakly; it is also dropped implicitly with its last strong handle.
    pub fn register_observer(
        &self,
        name: &str,
        observer: Weak<dyn SeriesObserver>,
    ) -> Result<u64, EngineError> {
        let series = self.series(name)?;
        let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
        series.register_observer(id, observer);
        Ok(id)
    }

    pub fn unregister_observer(&self, name: &str, id: u64) -> Result<(), EngineError> {
        let series = self.series(name)?;
        series.unregister_observer(id);
        Ok(())
    }

    pub(crate) fn events(&self) -> Arc<dyn EngineEventListener> {
        Arc::clone(&self.events)
    }
}
