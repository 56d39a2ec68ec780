#![doc = r#"
rill: IoT Time-Series Message Engine in Rust

This crate provides the core of a lightweight IoT microservice: it ingests,
stores, transforms, and emits small timestamped messages through named,
ordered logs called time series. Producers and consumers are modeled
uniformly as filters wired together by shared series. It supports:
- Pluggable storage backends (in-memory sorted map, embedded SQLite)
- Transactional reader/writer cursors with modification notifications
- A parallel filter scheduler with graceful lifecycle
- Source/adapter/demultiplexer filter primitives with replay/pop semantics
- A LoRaWAN 1.0.x uplink codec (AES-CMAC MIC, AES-CTR payload crypto)

See the README for usage examples and more details.
"#]
// Declare modules
pub mod backend;
pub mod error;
pub mod factory;
pub mod filter;
pub mod lora;
pub mod manager;
pub mod reader;
pub mod telemetry;
pub mod types;
pub mod writer;
pub mod writers_pool;

/// Error type for engine operations.
pub use crate::error::EngineError;
/// Declarative configuration of series and filters.
pub use crate::factory::{build_filters, EngineConfig, MainSeriesFactory};
/// Scheduler driving every filter on its own worker.
pub use crate::filter::{Filter, FilterServer};
/// Registry of named time series.
pub use crate::manager::TimeSeriesManager;
/// Read cursor over a time series.
pub use crate::reader::TimeSeriesReader;
/// Structured event hook for observability.
pub use crate::telemetry::{EngineEvent, EngineEventListener};
/// The in-transit form of a time series item.
pub use crate::types::Message;
/// Timestamp assignment policies.
pub use crate::types::TimestampKind;
/// Write cursor over a time series.
pub use crate::writer::TimeSeriesWriter;
/// Reference-counted pool of shared output files.
pub use crate::writers_pool::FileWritersPool;

use std::time::Duration;
/// Default timeout for blocking waits inside filter steps, keeping shutdown
/// responsive.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(100);
