//! # Structured Logging Module
//!
//! Environment-aware structured logging for the RPC transport and the
//! progress streams. Output is human-readable by default; set
//! `MEDIAFLOW_LOG_FORMAT=json` for one JSON object per line.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration.
/// Safe to call more than once; only the first call has an effect.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(get_log_level(&environment)));

        let layer = if json_output() {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_filter(filter)
                .boxed()
        };

        // Another subscriber (a test harness, an embedding host) may already be installed
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized");
        }

        tracing::info!(
            environment = %environment,
            pid = std::process::id(),
            "Structured logging initialized"
        );
    });
}

/// MEDIAFLOW_ENV || APP_ENV || 'development'
fn get_environment() -> String {
    std::env::var("MEDIAFLOW_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info,lapin=warn",
        "test" => "debug,lapin=warn",
        _ => "debug,lapin=info",
    }
}

fn json_output() -> bool {
    std::env::var("MEDIAFLOW_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Log one step of a correlated RPC exchange
pub fn log_rpc_operation(
    operation: &str,
    method: &str,
    correlation_id: &str,
    duration_ms: Option<u64>,
) {
    tracing::info!(
        operation = %operation,
        method = %method,
        correlation_id = %correlation_id,
        duration_ms = duration_ms,
        "RPC_OPERATION"
    );
}

/// Log one event written to a push-event stream
pub fn log_stream_event(connection_id: &str, status: &str, stage: &str, progress: i32) {
    tracing::debug!(
        connection_id = %connection_id,
        status = %status,
        stage = %stage,
        progress = progress,
        "STREAM_EVENT"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_levels_per_environment() {
        assert!(get_log_level("production").starts_with("info"));
        assert!(get_log_level("development").starts_with("debug"));
        assert!(get_log_level("staging").starts_with("debug"));
    }

    #[test]
    fn test_init_is_idempotent() {
        init_structured_logging();
        init_structured_logging();
        log_rpc_operation("request_sent", "echo.execute", "cid", None);
        log_stream_event("conn", "processing", "initializing", 0);
    }
}
