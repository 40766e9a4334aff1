//! Structured logging for the cluster metadata server
//!
//! This module sets up `tracing` with console output in the configured
//! format and optional daily-rotated file output.

use crate::config::{LogFormat, LogLevel, LoggingConfig, MetaServerConfig};
use std::path::Path;
use std::sync::{Once, OnceLock};
use std::time::Duration;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{filter::LevelFilter, Layer};

static INIT: Once = Once::new();
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) {
    INIT.call_once(|| {
        init_logging_inner(config);
    });
}

fn init_logging_inner(config: &LoggingConfig) {
    let level = LevelFilter::from_level(convert_log_level(&config.level));
    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.console {
        let layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_timer(UtcTime::rfc_3339());
        layers.push(match config.format {
            LogFormat::Json => layer.json().with_filter(level).boxed(),
            LogFormat::Pretty => layer.pretty().with_filter(level).boxed(),
            LogFormat::Simple => layer.with_filter(level).boxed(),
        });
    }

    if let Some(file) = config.file_path.as_deref().and_then(|path| create_file_layer(path, level)) {
        layers.push(file);
    }

    match tracing_subscriber::registry().with(layers).try_init() {
        Ok(()) => tracing::info!("Logging system initialized with level: {:?}", config.level),
        Err(e) => eprintln!("logging already initialized: {}", e),
    }
}

type BoxedLayer = Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>;

/// Daily-rotated, non-blocking JSON file output.
fn create_file_layer(file_path: &str, level: LevelFilter) -> Option<BoxedLayer> {
    let path = Path::new(file_path);
    let directory = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let file_name = path.file_name()?;

    let appender = tracing_appender::rolling::daily(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = FILE_GUARD.set(guard);

    Some(
        tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .json()
            .with_filter(level)
            .boxed(),
    )
}

/// Convert our log level to tracing level
fn convert_log_level(level: &LogLevel) -> Level {
    match level {
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    }
}

/// Log a metadata operation with structured fields
pub fn log_meta_operation(
    operation: &str,
    instance: &str,
    success: bool,
    duration: Duration,
    version: u32,
) {
    let span = tracing::info_span!(
        "meta_operation",
        operation = operation,
        instance = instance,
        success = success,
        duration_ms = duration.as_millis() as u64,
        version = version,
    );
    let _enter = span.enter();

    if success {
        tracing::info!("Metadata operation completed");
    } else {
        tracing::error!("Metadata operation failed");
    }
}

/// Log system startup
pub fn log_startup(config: &MetaServerConfig) {
    tracing::info!("Starting cluster metadata server");
    tracing::info!("HTTP endpoint: {}:{}", config.server.bind_address, config.server.port);
    tracing::info!("Sentinels: {:?}", config.sentinel.addresses);
    tracing::info!(
        "Snapshot: instance={} key={}",
        config.meta_store.instance_name,
        config.meta_store.hash_key
    );
    match config.reconcile_interval() {
        Some(interval) => tracing::info!("Periodic reconciliation every {:?}", interval),
        None => tracing::info!("Periodic reconciliation disabled"),
    }
}

/// Log system shutdown
pub fn log_shutdown(reason: &str) {
    tracing::info!("Shutting down cluster metadata server: {}", reason);
}
