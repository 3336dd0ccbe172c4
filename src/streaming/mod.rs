//! # Push-Event Streaming
//!
//! Local streaming execution of capabilities, the `event:`/`data:` wire
//! format, heartbeat-aware sinks and connection metrics.

pub mod executor;
pub mod formatter;
pub mod metrics;
pub mod sink;

pub use executor::StreamExecutor;
pub use formatter::{EventFormatter, FormatError, WireEvent, WireEventKind};
pub use metrics::{
    ConnectionGuard, HealthState, StreamHealth, StreamMetrics, StreamMetricsSnapshot,
};
pub use sink::{call_error_event, EventSink, EventTextStream};
