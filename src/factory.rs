//! Factory & registry: turns a declarative configuration into storage
//! backends and filter instances.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;

use crate::backend::{MemoryBackend, SqliteBackend, SqliteDatabase, TimeSeriesBackend};
use crate::error::EngineError;
use crate::filter::counter::counter_filter;
use crate::filter::csv::{csv_sink_filter, csv_source_filter};
use crate::filter::file_lines::file_lines_filter;
use crate::filter::lora::lora_decoder_filter;
use crate::filter::Filter;
use crate::manager::{TimeSeriesFactory, TimeSeriesManager};
use crate::telemetry::{noop_event_listener, EngineEventListener};
use crate::types::TimestampKind;
use crate::writers_pool::FileWritersPool;

fn default_timestamp_kind() -> TimestampKind {
    TimestampKind::Sequence
}

/// Storage backend selector for a declared series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum BackendKind {
    #[default]
    Memory,
    #[serde(rename = "SQLite")]
    Sqlite,
}

/// Declaration of one time series (or of the auto-creation template).
#[derive(Debug, Clone, Deserialize)]
pub struct SeriesConfig {
    #[serde(default)]
    pub backend: BackendKind,
    /// Database file for the SQLite backend; required there, ignored for the
    /// memory backend.
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub max_length: u64,
    #[serde(default)]
    pub max_size: u64,
    #[serde(default = "default_timestamp_kind")]
    pub timestamp_policy: TimestampKind,
}

impl Default for SeriesConfig {
    fn default() -> Self {
        SeriesConfig {
            backend: BackendKind::Memory,
            path: None,
            max_length: 0,
            max_size: 0,
            timestamp_policy: TimestampKind::Sequence,
        }
    }
}

/// Declaration of one named series.
#[derive(Debug, Clone, Deserialize)]
pub struct NamedSeriesConfig {
    pub name: String,
    #[serde(flatten)]
    pub series: SeriesConfig,
}

fn default_counter_stop() -> i64 {
    100
}

fn default_counter_increment() -> u64 {
    1
}

fn default_counter_delay_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

/// Configuration of one filter. The tag selects the filter type; unknown
/// types fail deserialization, which is a fatal configuration error.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum FilterConfig {
    Counter {
        name: Option<String>,
        output: String,
        metadata: Option<String>,
        #[serde(default)]
        start: i64,
        #[serde(default = "default_counter_stop")]
        stop: i64,
        #[serde(default = "default_counter_increment")]
        increment: u64,
        #[serde(default = "default_counter_delay_ms")]
        delay_ms: u64,
    },
    #[serde(rename = "CSVSource")]
    CsvSource {
        name: Option<String>,
        output: String,
        path: PathBuf,
        #[serde(default)]
        max_pending_messages: u64,
    },
    #[serde(rename = "CSVSink")]
    CsvSink {
        name: Option<String>,
        input: String,
        path: PathBuf,
        #[serde(default = "default_true")]
        append: bool,
        #[serde(default)]
        header: bool,
        #[serde(default = "default_true")]
        base64: bool,
        #[serde(default)]
        replay_history: bool,
        #[serde(default)]
        pop_input: bool,
    },
    FileLines {
        name: Option<String>,
        output: String,
        path: PathBuf,
        metadata: Option<String>,
        #[serde(default)]
        max_pending_messages: u64,
    },
    LoRaDecoder {
        name: Option<String>,
        input: String,
        output: String,
        #[serde(rename = "nwkSKey")]
        nwk_skey: String,
        #[serde(rename = "appSKey")]
        app_skey: String,
        #[serde(default)]
        replay_history: bool,
        #[serde(default)]
        pop_input: bool,
    },
    // The transports and script hosts behind these types are external
    // collaborators; builds without them reject the configuration.
    #[serde(rename = "MQTTSource")]
    MqttSource(serde_json::Value),
    #[serde(rename = "MQTTSink")]
    MqttSink(serde_json::Value),
    HttpPost(serde_json::Value),
    Lua(serde_json::Value),
    #[serde(rename = "IMST")]
    Imst(serde_json::Value),
}

impl FilterConfig {
    fn type_name(&self) -> &'static str {
        match self {
            FilterConfig::Counter { .. } => "Counter",
            FilterConfig::CsvSource { .. } => "CSVSource",
            FilterConfig::CsvSink { .. } => "CSVSink",
            FilterConfig::FileLines { .. } => "FileLines",
            FilterConfig::LoRaDecoder { .. } => "LoRaDecoder",
            FilterConfig::MqttSource(_) => "MQTTSource",
            FilterConfig::MqttSink(_) => "MQTTSink",
            FilterConfig::HttpPost(_) => "HttpPost",
            FilterConfig::Lua(_) => "Lua",
            FilterConfig::Imst(_) => "IMST",
        }
    }
}

/// Complete declarative description of an engine instance.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub series: Vec<NamedSeriesConfig>,
    /// Template for series auto-created on first lookup.
    pub auto_series: Option<SeriesConfig>,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
}

/// Factory materializing backends for the configured series, opening one
/// shared SQLite database per distinct path.
pub struct MainSeriesFactory {
    series: HashMap<String, SeriesConfig>,
    auto: Option<SeriesConfig>,
    databases: Mutex<HashMap<PathBuf, Arc<SqliteDatabase>>>,
    events: Arc<dyn EngineEventListener>,
}

impl MainSeriesFactory {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        Self::with_events(config, noop_event_listener())
    }

    pub fn with_events(
        config: &EngineConfig,
        events: Arc<dyn EngineEventListener>,
    ) -> Result<Self, EngineError> {
        let mut series = HashMap::new();
        for declared in &config.series {
            if series
                .insert(declared.name.clone(), declared.series.clone())
                .is_some()
            {
                return Err(EngineError::ConfigError(format!(
                    "time series declared twice: {}",
                    declared.name
                )));
            }
        }

        if let Some(auto) = &config.auto_series {
            if auto.backend == BackendKind::Sqlite && auto.path.is_none() {
                return Err(EngineError::ConfigError(
                    "the auto-created series need a database path".to_string(),
                ));
            }
        }

        Ok(MainSeriesFactory {
            series,
            auto: config.auto_series.clone(),
            databases: Mutex::new(HashMap::new()),
            events,
        })
    }

    fn database(&self, path: &PathBuf) -> Result<Arc<SqliteDatabase>, EngineError> {
        let mut databases = self.databases.lock()?;
        if let Some(database) = databases.get(path) {
            return Ok(Arc::clone(database));
        }

        let database = Arc::new(SqliteDatabase::open(path, Arc::clone(&self.events))?);
        databases.insert(path.clone(), Arc::clone(&database));
        Ok(database)
    }

    fn build_backend(
        &self,
        name: &str,
        config: &SeriesConfig,
    ) -> Result<Box<dyn TimeSeriesBackend>, EngineError> {
        match config.backend {
            BackendKind::Memory => Ok(Box::new(MemoryBackend::new(
                config.max_length,
                config.max_size,
            ))),
            BackendKind::Sqlite => {
                let path = config.path.as_ref().ok_or_else(|| {
                    EngineError::ConfigError(format!(
                        "the SQLite series {} needs a database path",
                        name
                    ))
                })?;
                let database = self.database(path)?;
                database.declare_series(name, config.max_length, config.max_size)?;
                Ok(Box::new(SqliteBackend::new(database, name)))
            }
        }
    }
}

impl TimeSeriesFactory for MainSeriesFactory {
    fn manual_series(&self) -> Vec<(String, TimestampKind)> {
        let mut list: Vec<(String, TimestampKind)> = self
            .series
            .iter()
            .map(|(name, config)| (name.clone(), config.timestamp_policy))
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    fn create_manual(&self, name: &str) -> Result<Box<dyn TimeSeriesBackend>, EngineError> {
        let config = self
            .series
            .get(name)
            .ok_or_else(|| EngineError::SeriesNotFound(name.to_string()))?;
        self.build_backend(name, config)
    }

    fn create_auto(
        &self,
        name: &str,
    ) -> Result<Option<(Box<dyn TimeSeriesBackend>, TimestampKind)>, EngineError> {
        match &self.auto {
            Some(auto) => {
                let backend = self.build_backend(name, auto)?;
                Ok(Some((backend, auto.timestamp_policy)))
            }
            None => Ok(None),
        }
    }
}

fn filter_name(name: &Option<String>, type_name: &str, index: usize) -> String {
    match name {
        Some(name) => name.clone(),
        None => format!("{}-{}", type_name.to_lowercase(), index),
    }
}

/// Builds every configured filter. Unknown or unavailable types are fatal.
pub fn build_filters(
    config: &EngineConfig,
    manager: &Arc<TimeSeriesManager>,
    writers: &FileWritersPool,
) -> Result<Vec<Box<dyn Filter>>, EngineError> {
    let mut filters: Vec<Box<dyn Filter>> = Vec::with_capacity(config.filters.len());

    for (index, filter) in config.filters.iter().enumerate() {
        match filter {
            FilterConfig::Counter {
                name,
                output,
                metadata,
                start,
                stop,
                increment,
                delay_ms,
            } => {
                let name = filter_name(name, filter.type_name(), index);
                let mut counter = counter_filter(name, manager, output.as_str())?;
                counter.set_range(*start, *stop)?;
                counter.set_increment(*increment)?;
                counter.set_delay(Duration::from_millis(*delay_ms));
                if let Some(metadata) = metadata {
                    counter.set_metadata(metadata.clone());
                }
                filters.push(Box::new(counter));
            }

            FilterConfig::CsvSource {
                name,
                output,
                path,
                max_pending_messages,
            } => {
                let name = filter_name(name, filter.type_name(), index);
                let mut source = csv_source_filter(name, manager, output.as_str(), path.clone())?;
                source.set_max_pending_messages(*max_pending_messages);
                filters.push(Box::new(source));
            }

            FilterConfig::CsvSink {
                name,
                input,
                path,
                append,
                header,
                base64,
                replay_history,
                pop_input,
            } => {
                let name = filter_name(name, filter.type_name(), index);
                let mut sink =
                    csv_sink_filter(name, manager, input.as_str(), writers.clone(), path.clone())?;
                sink.set_append(*append);
                sink.set_header(*header);
                sink.set_base64(*base64);
                sink.set_replay_history(*replay_history);
                sink.set_pop_input(manager, *pop_input)?;
                filters.push(Box::new(sink));
            }

            FilterConfig::FileLines {
                name,
                output,
                path,
                metadata,
                max_pending_messages,
            } => {
                let name = filter_name(name, filter.type_name(), index);
                let mut source = file_lines_filter(name, manager, output.as_str(), path.clone())?;
                source.set_max_pending_messages(*max_pending_messages);
                if let Some(metadata) = metadata {
                    source.set_metadata(metadata.clone());
                }
                filters.push(Box::new(source));
            }

            FilterConfig::LoRaDecoder {
                name,
                input,
                output,
                nwk_skey,
                app_skey,
                replay_history,
                pop_input,
            } => {
                let name = filter_name(name, filter.type_name(), index);
                let mut decoder =
                    lora_decoder_filter(name, manager, input.as_str(), output.as_str(), nwk_skey, app_skey)?;
                decoder.set_replay_history(*replay_history);
                decoder.set_pop_input(manager, *pop_input)?;
                filters.push(Box::new(decoder));
            }

            FilterConfig::MqttSource(_)
            | FilterConfig::MqttSink(_)
            | FilterConfig::HttpPost(_)
            | FilterConfig::Lua(_)
            | FilterConfig::Imst(_) => {
                return Err(EngineError::ConfigError(format!(
                    "filter type {} requires an external collaborator that is \
                     not compiled into this build",
                    filter.type_name()
                )));
            }
        }
    }

    Ok(filters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::TimeSeriesReader;

    #[test]
    fn test_duplicate_series_is_fatal() {
        let config = EngineConfig {
            series: vec![
                NamedSeriesConfig {
                    name: "twice".to_string(),
                    series: SeriesConfig::default(),
                },
                NamedSeriesConfig {
                    name: "twice".to_string(),
                    series: SeriesConfig::default(),
                },
            ],
            auto_series: None,
            filters: Vec::new(),
        };

        assert!(matches!(
            MainSeriesFactory::new(&config),
            Err(EngineError::ConfigError(_))
        ));
    }

    #[test]
    fn test_declared_memory_series() {
        let config = EngineConfig {
            series: vec![NamedSeriesConfig {
                name: "hello".to_string(),
                series: SeriesConfig::default(),
            }],
            auto_series: None,
            filters: Vec::new(),
        };

        let factory = MainSeriesFactory::new(&config).unwrap();
        let manager = TimeSeriesManager::new(Box::new(factory)).unwrap();
        assert_eq!(manager.list().unwrap(), vec!["hello".to_string()]);
        assert!(TimeSeriesReader::new(&manager, "hello", false).is_ok());
        assert!(TimeSeriesReader::new(&manager, "other", false).is_err());
    }

    #[test]
    fn test_auto_series() {
        let config = EngineConfig {
            series: Vec::new(),
            auto_series: Some(SeriesConfig::default()),
            filters: Vec::new(),
        };

        let factory = MainSeriesFactory::new(&config).unwrap();
        let manager = TimeSeriesManager::new(Box::new(factory)).unwrap();
        assert!(TimeSeriesReader::new(&manager, "anything", false).is_ok());
    }

    #[test]
    fn test_unavailable_filter_type_is_fatal() {
        let config = EngineConfig {
            series: Vec::new(),
            auto_series: Some(SeriesConfig::default()),
            filters: vec![FilterConfig::MqttSource(serde_json::Value::Null)],
        };

        let factory = MainSeriesFactory::new(&config).unwrap();
        let manager = Arc::new(TimeSeriesManager::new(Box::new(factory)).unwrap());
        let writers = FileWritersPool::new();

        assert!(matches!(
            build_filters(&config, &manager, &writers),
            Err(EngineError::ConfigError(_))
        ));
    }

    #[test]
    fn test_sqlite_series_requires_path() {
        let config = EngineConfig {
            series: vec![NamedSeriesConfig {
                name: "durable".to_string(),
                series: SeriesConfig {
                    backend: BackendKind::Sqlite,
                    ..SeriesConfig::default()
                },
            }],
            auto_series: None,
            filters: Vec::new(),
        };

        let factory = MainSeriesFactory::new(&config).unwrap();
        assert!(matches!(
            TimeSeriesManager::new(Box::new(factory)),
            Err(EngineError::ConfigError(_))
        ));
    }
}
