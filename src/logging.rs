//! # Structured Logging Module
//!
//! Environment-aware structured logging to the console and to a JSON log file, for
//! debugging superstep interleavings across partitions.

use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration.
///
/// Safe to call more than once; only the first call installs the subscriber. `RUST_LOG`
/// takes precedence over the environment's default level.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| get_log_level(&environment));

        let log_dir = PathBuf::from("log");
        let file_layer = if fs::create_dir_all(&log_dir).is_ok() {
            let pid = process::id();
            let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
            let file_appender = tracing_appender::rolling::never(
                &log_dir,
                format!("{environment}.{pid}.{timestamp}.log"),
            );
            let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
            // The guard flushes on drop; logging lives for the whole process.
            std::mem::forget(guard);
            Some(
                fmt::layer()
                    .with_writer(file_writer)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_level(true)
                    .with_ansi(false)
                    .json()
                    .with_filter(EnvFilter::new(log_level.clone())),
            )
        } else {
            None
        };

        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_level(true)
                    .with_ansi(true)
                    .with_filter(EnvFilter::new(log_level)),
            )
            .with(file_layer);

        if subscriber.try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("ITERFLOW_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "test" => "debug".to_string(),
        "development" => "debug".to_string(),
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log structured data for superstep lifecycle events
pub fn log_superstep_operation(
    operation: &str,
    iteration_id: u32,
    superstep: u32,
    partition: Option<usize>,
    role: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        iteration_id = iteration_id,
        superstep = superstep,
        partition = partition,
        role = %role,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🔁 SUPERSTEP_OPERATION"
    );
}

/// Log structured data for solution-set store operations
pub fn log_store_operation(
    operation: &str,
    partition: usize,
    entries: usize,
    resident_bytes: usize,
    spilled_buckets: usize,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        partition = partition,
        entries = entries,
        resident_bytes = resident_bytes,
        spilled_buckets = spilled_buckets,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "💾 STORE_OPERATION"
    );
}

/// Log structured data for back-channel handoffs
pub fn log_back_channel_operation(
    operation: &str,
    iteration_id: u32,
    partition: usize,
    superstep: u32,
    records: usize,
    spilled: bool,
) {
    tracing::debug!(
        operation = %operation,
        iteration_id = iteration_id,
        partition = partition,
        superstep = superstep,
        records = records,
        spilled = spilled,
        "📬 BACK_CHANNEL_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}
