//! Production daemon for the rill time-series message engine.
//!
//! Loads configuration from (in precedence order): defaults, config file,
//! environment variables (`RILL_*`), and CLI flags. Builds the configured
//! series and filters, serves the REST surface, and runs until graceful
//! shutdown (SIGINT/SIGTERM).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use config::{Config, Environment, File};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::graceful::GracefulShutdown;
use serde_json::json;

use rill::factory::{build_filters, EngineConfig, MainSeriesFactory};
use rill::filter::FilterServer;
use rill::telemetry::{EngineEvent, EngineEventListener};
use rill::types::{is_printable_ascii, Message, SeriesStatistics};
use rill::{EngineError, FileWritersPool, TimeSeriesManager, TimeSeriesReader, TimeSeriesWriter};

// ---------- CLI ----------

/// rill time-series message engine daemon.
#[derive(Parser, Debug)]
#[command(name = "rilld", version, about)]
pub struct Cli {
    /// Path to config file (TOML). If omitted, rilld.toml is loaded when it
    /// exists.
    #[arg(long, env = "RILL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Do not load any config file; use defaults + env + CLI only.
    #[arg(long, default_value_t = false)]
    pub no_config: bool,

    /// Load and validate the config, print a summary, then exit.
    #[arg(long, default_value_t = false)]
    pub validate_config: bool,

    /// HTTP listen address for the REST API (e.g. 127.0.0.1:8042).
    #[arg(long, env = "RILL_HTTP_BIND")]
    pub http_bind: Option<String>,
}

// ---------- File/env config (all optional for partial config) ----------

/// Top-level daemon config as read from file + env: HTTP options plus the
/// engine's declarative series/filter description.
#[derive(Debug, Default, serde::Deserialize)]
pub struct DaemonFileConfig {
    /// HTTP listen address for the REST API.
    pub http_bind: Option<String>,
    #[serde(flatten)]
    pub engine: EngineConfig,
}

/// Runtime options for the daemon derived from config + env + CLI.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub http_bind: SocketAddr,
}

fn parse_http_bind(s: &str) -> Result<SocketAddr, String> {
    s.parse::<SocketAddr>()
        .map_err(|e| format!("invalid http_bind {:?}: {}", s, e))
}

/// Load merged config and daemon options. CLI overrides file/env.
fn load_daemon_config(cli: &Cli) -> Result<(EngineConfig, DaemonOptions), String> {
    let mut builder = Config::builder();

    if !cli.no_config {
        if let Some(ref path) = cli.config {
            if !path.exists() {
                return Err(format!("config file not found: {}", path.display()));
            }
            builder = builder.add_source(File::from(path.as_path()).required(false));
        } else {
            let default_path = PathBuf::from("rilld.toml");
            if default_path.exists() {
                builder = builder.add_source(File::from(default_path.as_path()).required(false));
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("RILL")
            .separator("__")
            .try_parsing(true)
            .ignore_empty(true),
    );

    let merged = builder.build().map_err(|e| e.to_string())?;
    let partial: DaemonFileConfig = merged.try_deserialize().map_err(|e| e.to_string())?;

    let http_bind_str = cli
        .http_bind
        .as_deref()
        .or(partial.http_bind.as_deref())
        .unwrap_or("127.0.0.1:8042");
    let http_bind = parse_http_bind(http_bind_str)?;

    Ok((partial.engine, DaemonOptions { http_bind }))
}

// ---------- Event logging ----------

/// Forwards engine events to `tracing`.
#[derive(Debug)]
struct TracingEventListener;

impl EngineEventListener for TracingEventListener {
    fn on_event(&self, event: EngineEvent) {
        use EngineEvent::*;
        match event {
            SeriesCreated { name } => tracing::info!(series = %name, "time series created"),
            SeriesAutoCreated { name } => {
                tracing::warn!(series = %name, "auto-creation of time series")
            }
            SeriesDeleted { name } => tracing::info!(series = %name, "time series deleted"),
            AppendRejected { series, timestamp } => tracing::warn!(
                series = %series,
                timestamp,
                "append rejected: timestamp is not after the last item"
            ),
            FilterStarted { name } => tracing::info!(filter = %name, "filter has started"),
            FilterStopped { name } => tracing::info!(filter = %name, "filter has stopped"),
            FilterFinished { name } => {
                tracing::info!(filter = %name, "filter has finished its task")
            }
            FilterStartFailed { name, error } => {
                tracing::error!(filter = %name, %error, "error while starting filter")
            }
            FilterStopFailed { name, error } => {
                tracing::error!(filter = %name, %error, "error while stopping filter")
            }
            FilterStepError { name, error } => {
                tracing::info!(filter = %name, %error, "error in filter step")
            }
            FilterPanicked { name } => tracing::error!(filter = %name, "filter panicked"),
            MessageFetched {
                filter,
                value,
                metadata,
            } => tracing::debug!(%filter, %value, %metadata, "message received"),
            MessageDiscarded { filter, reason } => {
                tracing::info!(%filter, %reason, "message discarded")
            }
            SchedulerStarted { filters } => tracing::info!(filters, "scheduler started"),
            SchedulerStopping => tracing::warn!("stopping the filters"),
            CheckpointFailed { error } => {
                tracing::warn!(%error, "database checkpoint failed")
            }
            FileOpened { path } => tracing::info!(path = %path.display(), "opening file"),
            FileClosed { path } => tracing::info!(path = %path.display(), "closing file"),
        }
    }
}

// ---------- REST API ----------

struct ApiState {
    manager: Arc<TimeSeriesManager>,
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("response build")
}

fn empty_json(status: StatusCode) -> Response<Full<Bytes>> {
    json_response(status, json!({}))
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, json!({ "error": message }))
}

fn engine_error_response(error: &EngineError) -> Response<Full<Bytes>> {
    let status = match error {
        EngineError::SeriesNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::BadInput(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &error.to_string())
}

fn parse_query(query: Option<&str>) -> Vec<(String, String)> {
    query
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

/// JSON rendering of one item; binary values are base64-encoded.
fn format_item(timestamp: i64, metadata: &str, value: &[u8]) -> serde_json::Value {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    if is_printable_ascii(value) {
        json!({
            "timestamp": timestamp,
            "metadata": metadata,
            "value": String::from_utf8_lossy(value),
            "base64": false,
        })
    } else {
        json!({
            "timestamp": timestamp,
            "metadata": metadata,
            "value": BASE64.encode(value),
            "base64": true,
        })
    }
}

fn list_series(state: &ApiState) -> Response<Full<Bytes>> {
    match state.manager.list() {
        Ok(series) => json_response(StatusCode::OK, json!(series)),
        Err(e) => engine_error_response(&e),
    }
}

fn get_content(
    state: &ApiState,
    name: &str,
    query: Option<&str>,
) -> Response<Full<Bytes>> {
    let mut limit: u64 = 10;
    let mut since: Option<i64> = None;
    let mut last = false;

    for (key, value) in parse_query(query) {
        match key.as_str() {
            "limit" => match value.parse() {
                Ok(parsed) => limit = parsed,
                Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid limit"),
            },
            "since" => match value.parse() {
                Ok(parsed) => since = Some(parsed),
                Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid since"),
            },
            "last" => last = true,
            _ => {}
        }
    }

    let reader = match TimeSeriesReader::new(&state.manager, name, false) {
        Ok(reader) => reader,
        Err(e) => return engine_error_response(&e),
    };

    let mut content = Vec::new();
    let mut done;
    {
        let mut transaction = reader.transaction();

        done = if let Some(since) = since {
            !transaction.seek_nearest(since)
        } else if last {
            !transaction.seek_last()
        } else {
            !transaction.seek_first()
        };

        while !done && (limit == 0 || (content.len() as u64) < limit) {
            if let (Some(timestamp), Some((metadata, value))) =
                (transaction.timestamp(), transaction.read())
            {
                content.push(format_item(timestamp, &metadata, &value));
            }

            if !transaction.seek_next() {
                done = true;
            }
        }
    }

    json_response(
        StatusCode::OK,
        json!({ "name": name, "content": content, "done": done }),
    )
}

fn get_raw_value(state: &ApiState, name: &str, timestamp: i64) -> Response<Full<Bytes>> {
    let reader = match TimeSeriesReader::new(&state.manager, name, false) {
        Ok(reader) => reader,
        Err(e) => return engine_error_response(&e),
    };

    let mut transaction = reader.transaction();
    transaction.seek(timestamp);

    match transaction.read() {
        Some((metadata, value)) => {
            let content_type = if is_mime_type(&metadata) {
                metadata
            } else {
                "application/octet-stream".to_string()
            };
            Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, content_type)
                .body(Full::new(Bytes::from(value)))
                .expect("response build")
        }
        None => error_response(StatusCode::NOT_FOUND, "no such timestamp"),
    }
}

/// Whether a metadata string is shaped like `type/subtype`.
fn is_mime_type(metadata: &str) -> bool {
    let valid = |part: &str| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    };

    match metadata.split_once('/') {
        Some((main, sub)) => valid(main) && valid(sub),
        None => false,
    }
}

fn get_statistics(state: &ApiState, name: &str) -> Response<Full<Bytes>> {
    let reader = match TimeSeriesReader::new(&state.manager, name, false) {
        Ok(reader) => reader,
        Err(e) => return engine_error_response(&e),
    };

    let SeriesStatistics { length, size } = reader.transaction().statistics();
    let size_mb = (size as f64 / (1024.0 * 1024.0)).round() as u64;

    json_response(
        StatusCode::OK,
        json!({ "name": name, "length": length, "size": size, "sizeMB": size_mb }),
    )
}

fn delete_content(state: &ApiState, name: &str) -> Response<Full<Bytes>> {
    let writer = match TimeSeriesWriter::new(&state.manager, name) {
        Ok(writer) => writer,
        Err(e) => return engine_error_response(&e),
    };

    writer.transaction().clear_content();
    empty_json(StatusCode::OK)
}

fn delete_timestamp(state: &ApiState, name: &str, timestamp: i64) -> Response<Full<Bytes>> {
    let writer = match TimeSeriesWriter::new(&state.manager, name) {
        Ok(writer) => writer,
        Err(e) => return engine_error_response(&e),
    };

    writer
        .transaction()
        .delete_range(timestamp, timestamp.saturating_add(1));
    empty_json(StatusCode::OK)
}

fn append_message(
    state: &ApiState,
    name: &str,
    timestamp: Option<i64>,
    metadata: &str,
    value: Vec<u8>,
) -> Response<Full<Bytes>> {
    let writer = match TimeSeriesWriter::new(&state.manager, name) {
        Ok(writer) => writer,
        Err(e) => return engine_error_response(&e),
    };

    let mut message = Message::default();
    message.set_metadata(metadata);
    message.set_value(value);
    if let Some(timestamp) = timestamp {
        message.set_timestamp(timestamp);
    }

    if writer.append(&message) {
        empty_json(StatusCode::OK)
    } else {
        // Monotonicity or quota rejection.
        error_response(StatusCode::BAD_REQUEST, "cannot append the message")
    }
}

async fn api_service(
    state: Arc<ApiState>,
    request: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(|q| q.to_string());
    let content_type = request
        .headers()
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let segments: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();
    let segments: Vec<&str> = segments.iter().map(|s| s.as_str()).collect();

    let response = match (&method, segments.as_slice()) {
        (&Method::GET, ["series"]) => list_series(&state),

        (&Method::GET, ["series", name, "content"]) => {
            get_content(&state, name, query.as_deref())
        }

        (&Method::DELETE, ["series", name, "content"]) => delete_content(&state, name),

        (&Method::GET, ["series", name, "content", timestamp]) => match timestamp.parse() {
            Ok(timestamp) => get_raw_value(&state, name, timestamp),
            Err(_) => error_response(StatusCode::BAD_REQUEST, "invalid timestamp"),
        },

        (&Method::DELETE, ["series", name, "content", timestamp]) => match timestamp.parse() {
            Ok(timestamp) => delete_timestamp(&state, name, timestamp),
            Err(_) => error_response(StatusCode::BAD_REQUEST, "invalid timestamp"),
        },

        (&Method::PUT, ["series", name, "content", timestamp]) => {
            match timestamp.parse::<i64>() {
                Ok(timestamp) => {
                    let name = name.to_string();
                    let body = collect_body(request).await;
                    append_message(&state, &name, Some(timestamp), &content_type, body)
                }
                Err(_) => error_response(StatusCode::BAD_REQUEST, "invalid timestamp"),
            }
        }

        (&Method::POST, ["series", name]) => {
            let name = name.to_string();
            let body = collect_body(request).await;
            append_message(&state, &name, None, &content_type, body)
        }

        (&Method::GET, ["series", name, "statistics"]) => get_statistics(&state, name),

        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

async fn collect_body(request: Request<Incoming>) -> Vec<u8> {
    match request.into_body().collect().await {
        Ok(collected) => collected.to_bytes().to_vec(),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_mime_type() {
        assert!(is_mime_type("text/plain"));
        assert!(is_mime_type("application/octet-stream"));
        assert!(is_mime_type("application/vnd.ms-excel"));

        assert!(!is_mime_type("textplain"));
        assert!(!is_mime_type("/plain"));
        assert!(!is_mime_type("text/"));
        assert!(!is_mime_type("text/pl ain"));
        assert!(!is_mime_type("te xt/plain"));
        assert!(!is_mime_type("a/b/c"));
    }

    #[test]
    fn test_parse_query() {
        assert!(parse_query(None).is_empty());
        assert_eq!(
            parse_query(Some("limit=5&since=10")),
            vec![
                ("limit".to_string(), "5".to_string()),
                ("since".to_string(), "10".to_string())
            ]
        );
        assert_eq!(
            parse_query(Some("last")),
            vec![("last".to_string(), String::new())]
        );
    }

    #[test]
    fn test_format_item() {
        let ascii = format_item(3, "text/plain", b"hello");
        assert_eq!(ascii["timestamp"], 3);
        assert_eq!(ascii["value"], "hello");
        assert_eq!(ascii["base64"], false);

        let binary = format_item(4, "", &[0x00, 0xff]);
        assert_eq!(binary["base64"], true);
        assert_eq!(binary["value"], "AP8=");
    }

    #[test]
    fn test_parse_http_bind() {
        assert!(parse_http_bind("127.0.0.1:8042").is_ok());
        assert!(parse_http_bind("0.0.0.0:80").is_ok());
        assert!(parse_http_bind("not an address").is_err());
    }
}

// ---------- Server lifecycle ----------

/// Returns a future that completes when SIGINT (Ctrl+C) or SIGTERM is
/// received.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("ctrl_c handler");
    };
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

async fn run_http_server(
    manager: Arc<TimeSeriesManager>,
    options: DaemonOptions,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(options.http_bind)
        .await
        .map_err(|e| format!("failed to bind {}: {}", options.http_bind, e))?;
    tracing::info!(
        http = %options.http_bind,
        "rilld running. Press Ctrl+C or send SIGTERM to stop."
    );

    let state = Arc::new(ApiState { manager });
    let server = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
    let graceful = GracefulShutdown::new();
    let mut shutdown = std::pin::pin!(shutdown_signal());

    loop {
        tokio::select! {
            Ok((stream, _addr)) = listener.accept() => {
                let io = TokioIo::new(Box::pin(stream));
                let state = Arc::clone(&state);
                let conn = server.serve_connection_with_upgrades(io, service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move { api_service(state, req).await }
                }));
                let fut = graceful.watch(conn.into_owned());
                tokio::spawn(async move {
                    if let Err(e) = fut.await {
                        tracing::warn!("connection error: {:?}", e);
                    }
                });
            }
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    drop(listener);
    const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
    tokio::select! {
        _ = graceful.shutdown() => {
            tracing::info!("all connections closed");
        }
        _ = tokio::time::sleep(SHUTDOWN_TIMEOUT) => {
            tracing::warn!("shutdown timeout waiting for connections");
        }
    }

    Ok(())
}

// ---------- Main ----------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let (engine_config, options) = load_daemon_config(&cli).map_err(|e| {
        tracing::error!("config error: {}", e);
        e
    })?;

    if cli.validate_config {
        println!("http_bind={}", options.http_bind);
        println!("series={}", engine_config.series.len());
        println!("auto_series={}", engine_config.auto_series.is_some());
        println!("filters={}", engine_config.filters.len());
        return Ok(());
    }

    let events: Arc<dyn EngineEventListener> = Arc::new(TracingEventListener);

    let factory = MainSeriesFactory::with_events(&engine_config, Arc::clone(&events))
        .map_err(|e| {
            tracing::error!("configuration failed: {}", e);
            e
        })?;
    let manager = Arc::new(
        TimeSeriesManager::with_events(Box::new(factory), Arc::clone(&events)).map_err(|e| {
            tracing::error!("cannot create the time series: {}", e);
            e
        })?,
    );

    let writers = FileWritersPool::with_events(Arc::clone(&events));
    let filters = build_filters(&engine_config, &manager, &writers).map_err(|e| {
        tracing::error!("cannot create the filters: {}", e);
        e
    })?;

    let mut server = FilterServer::with_events(Arc::clone(&events));
    for filter in filters {
        server.add_filter(filter)?;
    }
    server.start().map_err(|e| {
        tracing::error!("cannot start the filters: {}", e);
        e
    })?;

    let result = run_http_server(Arc::clone(&manager), options).await;

    server.stop();
    tracing::info!("shutdown complete");
    result
}
