//! Connection metrics for push-event streams.
//!
//! A [`StreamMetrics`] instance is created by whoever serves event streams
//! and passed to the sinks explicitly. [`StreamMetrics::track`] returns a
//! guard that counts the connection as active until it is dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

/// Number of recent connection durations kept for the average
const DURATION_WINDOW: usize = 1000;
const ACTIVE_CONNECTION_WARNING: u64 = 100;
const ERROR_RATE_UNHEALTHY: f64 = 0.1;

#[derive(Debug, Default)]
struct MetricsState {
    active_connections: u64,
    total_connections: u64,
    total_errors: u64,
    durations: VecDeque<Duration>,
    errors_by_code: HashMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamMetricsSnapshot {
    pub active_connections: u64,
    pub total_connections: u64,
    pub total_errors: u64,
    pub average_connection_duration_secs: f64,
    pub errors_by_code: HashMap<String, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Warning,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamHealth {
    pub status: HealthState,
    pub issues: Vec<String>,
    pub metrics: StreamMetricsSnapshot,
}

#[derive(Debug, Default)]
pub struct StreamMetrics {
    state: Mutex<MetricsState>,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        let mut state = self.state.lock();
        state.active_connections += 1;
        state.total_connections += 1;
    }

    pub fn connection_closed(&self, duration: Duration) {
        let mut state = self.state.lock();
        state.active_connections = state.active_connections.saturating_sub(1);
        if state.durations.len() == DURATION_WINDOW {
            state.durations.pop_front();
        }
        state.durations.push_back(duration);
    }

    pub fn record_error(&self, code: &str) {
        let mut state = self.state.lock();
        state.total_errors += 1;
        *state.errors_by_code.entry(code.to_string()).or_insert(0) += 1;
    }

    /// Count a connection as active until the returned guard is dropped
    pub fn track(self: &Arc<Self>, connection_id: impl Into<String>) -> ConnectionGuard {
        let connection_id = connection_id.into();
        self.connection_opened();
        debug!(connection_id = %connection_id, "Stream connection opened");
        ConnectionGuard {
            metrics: Arc::clone(self),
            connection_id,
            started: Instant::now(),
            events_sent: 0,
        }
    }

    pub fn snapshot(&self) -> StreamMetricsSnapshot {
        let state = self.state.lock();
        let average = if state.durations.is_empty() {
            0.0
        } else {
            let total: Duration = state.durations.iter().sum();
            total.as_secs_f64() / state.durations.len() as f64
        };
        StreamMetricsSnapshot {
            active_connections: state.active_connections,
            total_connections: state.total_connections,
            total_errors: state.total_errors,
            average_connection_duration_secs: average,
            errors_by_code: state.errors_by_code.clone(),
        }
    }

    pub fn health(&self) -> StreamHealth {
        let metrics = self.snapshot();
        let mut status = HealthState::Healthy;
        let mut issues = Vec::new();

        if metrics.active_connections > ACTIVE_CONNECTION_WARNING {
            status = HealthState::Warning;
            issues.push("High number of active connections".to_string());
        }
        if metrics.total_connections > 0 {
            let error_rate = metrics.total_errors as f64 / metrics.total_connections as f64;
            if error_rate > ERROR_RATE_UNHEALTHY {
                status = HealthState::Unhealthy;
                issues.push("High error rate".to_string());
            }
        }

        StreamHealth {
            status,
            issues,
            metrics,
        }
    }

    pub fn reset(&self) {
        *self.state.lock() = MetricsState::default();
        info!("Stream metrics reset");
    }
}

/// Active-connection marker returned by [`StreamMetrics::track`]
#[derive(Debug)]
pub struct ConnectionGuard {
    metrics: Arc<StreamMetrics>,
    connection_id: String,
    started: Instant,
    events_sent: u64,
}

impl ConnectionGuard {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn event_sent(&mut self) {
        self.events_sent += 1;
    }

    pub fn events_sent(&self) -> u64 {
        self.events_sent
    }

    pub fn record_error(&self, code: &str) {
        self.metrics.record_error(code);
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let duration = self.started.elapsed();
        self.metrics.connection_closed(duration);
        debug!(
            connection_id = %self.connection_id,
            events_sent = self.events_sent,
            duration_ms = duration.as_millis() as u64,
            "Stream connection closed"
        );
    }
}
