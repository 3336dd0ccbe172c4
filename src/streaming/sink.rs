//! Event sink: turns one invocation's events into encoded push events.
//!
//! A sink serves exactly one subscriber. It forwards events as they arrive,
//! sends a `ping` whenever the stream has been idle for the heartbeat
//! interval, and ends after the terminal event. If the producing side goes
//! away without a terminal event, the sink closes the stream with a
//! synthesized `STREAM_ERROR` event so the client always sees an ending.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, warn};

use super::formatter::EventFormatter;
use super::metrics::{ConnectionGuard, StreamMetrics};
use crate::config::StreamingConfig;
use crate::constants::error_codes::{
    CONNECTION_ERROR, SERVICE_EXECUTION_ERROR, STREAM_ERROR, TIMEOUT_ERROR,
};
use crate::constants::stages::UNKNOWN_STAGE;
use crate::logging::log_stream_event;
use crate::messaging::RpcCallError;
use crate::progress::{ErrorInfo, ProgressEvent};

/// Encoded push events (`event: ...\ndata: ...\n\n`)
pub type EventTextStream = BoxStream<'static, String>;

#[derive(Debug, Clone)]
pub struct EventSink {
    heartbeat_interval: Duration,
    include_timestamps: bool,
    metrics: Option<Arc<StreamMetrics>>,
}

impl EventSink {
    pub fn new(heartbeat_interval: Duration) -> Self {
        Self {
            heartbeat_interval,
            include_timestamps: false,
            metrics: None,
        }
    }

    pub fn from_config(config: &StreamingConfig) -> Self {
        Self::new(config.heartbeat_interval()).with_timestamps(config.include_timestamps)
    }

    /// Stamp the events this sink creates itself (`STREAM_ERROR` and relayed
    /// call outcomes)
    pub fn with_timestamps(mut self, include: bool) -> Self {
        self.include_timestamps = include;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<StreamMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    fn ticker(&self) -> Interval {
        let period = self.heartbeat_interval.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    fn guard(&self, connection_id: &str) -> Option<ConnectionGuard> {
        self.metrics
            .as_ref()
            .map(|metrics| metrics.track(connection_id))
    }

    /// Drain `events` into encoded push events
    pub fn stream(
        &self,
        connection_id: impl Into<String>,
        events: mpsc::Receiver<ProgressEvent>,
    ) -> EventTextStream {
        let connection_id = connection_id.into();
        let state = DrainState {
            guard: self.guard(&connection_id),
            connection_id,
            events,
            ticker: self.ticker(),
            finished: false,
            include_timestamps: self.include_timestamps,
        };
        stream::unfold(state, DrainState::next).boxed()
    }

    /// Ping while `call` is outstanding, then emit its outcome as the
    /// terminal event
    pub fn relay_call<F>(&self, connection_id: impl Into<String>, call: F) -> EventTextStream
    where
        F: Future<Output = Result<Value, RpcCallError>> + Send + 'static,
    {
        let connection_id = connection_id.into();
        let state = RelayState {
            guard: self.guard(&connection_id),
            connection_id,
            call: Some(call.boxed()),
            ticker: self.ticker(),
            include_timestamps: self.include_timestamps,
        };
        stream::unfold(state, RelayState::next).boxed()
    }
}

struct DrainState {
    connection_id: String,
    events: mpsc::Receiver<ProgressEvent>,
    ticker: Interval,
    finished: bool,
    include_timestamps: bool,
    guard: Option<ConnectionGuard>,
}

impl DrainState {
    async fn next(mut self) -> Option<(String, Self)> {
        if self.finished {
            return None;
        }

        tokio::select! {
            biased;
            event = self.events.recv() => {
                let event = match event {
                    Some(event) => event,
                    None => {
                        warn!(
                            connection_id = %self.connection_id,
                            "Event source ended without a terminal event"
                        );
                        stamped(
                            ProgressEvent::error(ErrorInfo::new(
                                STREAM_ERROR,
                                "Event stream ended unexpectedly",
                                UNKNOWN_STAGE,
                            )),
                            self.include_timestamps,
                        )
                    }
                };
                self.ticker.reset();
                let text = emit(&self.connection_id, self.guard.as_mut(), &event);
                self.finished = event.is_terminal();
                Some((text, self))
            }
            _ = self.ticker.tick() => {
                Some((EventFormatter::ping(), self))
            }
        }
    }
}

struct RelayState {
    connection_id: String,
    call: Option<BoxFuture<'static, Result<Value, RpcCallError>>>,
    ticker: Interval,
    include_timestamps: bool,
    guard: Option<ConnectionGuard>,
}

impl RelayState {
    async fn next(mut self) -> Option<(String, Self)> {
        let mut call = self.call.take()?;

        tokio::select! {
            biased;
            outcome = &mut call => {
                let event = match outcome {
                    Ok(result) => ProgressEvent::success(Some(result)),
                    Err(e) => call_error_event(&e),
                };
                let event = stamped(event, self.include_timestamps);
                let text = emit(&self.connection_id, self.guard.as_mut(), &event);
                Some((text, self))
            }
            _ = self.ticker.tick() => {
                self.call = Some(call);
                Some((EventFormatter::ping(), self))
            }
        }
    }
}

pub(crate) fn stamped(event: ProgressEvent, include_timestamps: bool) -> ProgressEvent {
    if include_timestamps {
        event.with_timestamp(Utc::now())
    } else {
        event
    }
}

fn emit(
    connection_id: &str,
    guard: Option<&mut ConnectionGuard>,
    event: &ProgressEvent,
) -> String {
    if let Some(guard) = guard {
        guard.event_sent();
        if let Some(error) = event.error_info() {
            guard.record_error(&error.code);
        }
    }
    log_stream_event(connection_id, event.status(), event.stage(), event.progress_value());
    if event.is_terminal() {
        debug!(connection_id = connection_id, "Stream reached terminal event");
    }
    EventFormatter::render(event)
}

/// Terminal error event for a failed RPC call. A remote capability error
/// keeps its own code, stage and recoverability.
pub fn call_error_event(error: &RpcCallError) -> ProgressEvent {
    let info = match error {
        RpcCallError::Remote { message, data, .. } => {
            let data = data.as_ref();
            let field = |name: &str| data.and_then(|d| d.get(name)).and_then(Value::as_str);
            let mut info = ErrorInfo::new(
                field("code").unwrap_or(SERVICE_EXECUTION_ERROR),
                message.clone(),
                field("stage_failed").unwrap_or(UNKNOWN_STAGE),
            );
            info.details = field("details").map(str::to_string);
            info.recoverable = data
                .and_then(|d| d.get("recoverable"))
                .and_then(Value::as_bool)
                .unwrap_or(true);
            info
        }
        RpcCallError::Timeout { .. } => {
            ErrorInfo::new(TIMEOUT_ERROR, error.to_string(), UNKNOWN_STAGE)
        }
        other => ErrorInfo::new(CONNECTION_ERROR, other.to_string(), UNKNOWN_STAGE),
    };
    ProgressEvent::error(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::formatter::WireEventKind;
    use serde_json::json;

    fn kinds(texts: &[String]) -> Vec<WireEventKind> {
        texts
            .iter()
            .map(|t| EventFormatter::parse(t).unwrap().kind)
            .collect()
    }

    #[tokio::test]
    async fn test_forwards_until_terminal_event() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(ProgressEvent::progress(0, "initializing")).await.unwrap();
        tx.send(ProgressEvent::progress(50, "processing")).await.unwrap();
        tx.send(ProgressEvent::success(None)).await.unwrap();
        // anything after the terminal event is never read
        tx.send(ProgressEvent::progress(60, "processing")).await.unwrap();

        let texts: Vec<String> = EventSink::new(Duration::from_secs(60))
            .stream("c1", rx)
            .collect()
            .await;
        assert_eq!(
            kinds(&texts),
            vec![
                WireEventKind::Progress,
                WireEventKind::Progress,
                WireEventKind::Complete
            ]
        );
    }

    #[tokio::test]
    async fn test_synthesizes_stream_error_when_source_vanishes() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(ProgressEvent::progress(10, "loading")).await.unwrap();
        drop(tx);

        let texts: Vec<String> = EventSink::new(Duration::from_secs(60))
            .stream("c2", rx)
            .collect()
            .await;
        assert_eq!(texts.len(), 2);
        let last = EventFormatter::parse(&texts[1]).unwrap();
        assert_eq!(last.kind, WireEventKind::Error);
        assert_eq!(last.data["error"]["code"], "STREAM_ERROR");
    }

    #[tokio::test]
    async fn test_pings_while_idle() {
        let (tx, rx) = mpsc::channel(4);
        let producer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            tx.send(ProgressEvent::success(None)).await.unwrap();
        });

        let texts: Vec<String> = EventSink::new(Duration::from_millis(20))
            .stream("c3", rx)
            .collect()
            .await;
        producer.await.unwrap();

        let kinds = kinds(&texts);
        assert!(kinds.iter().filter(|k| **k == WireEventKind::Ping).count() >= 2);
        assert_eq!(kinds.last(), Some(&WireEventKind::Complete));
    }

    #[tokio::test]
    async fn test_metrics_track_connection() {
        let metrics = Arc::new(StreamMetrics::new());
        let sink = EventSink::new(Duration::from_secs(60)).with_metrics(Arc::clone(&metrics));
        let (tx, rx) = mpsc::channel(1);
        drop(tx);

        let stream = sink.stream("c4", rx);
        assert_eq!(metrics.snapshot().active_connections, 1);
        let _: Vec<String> = stream.collect().await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_connections, 0);
        assert_eq!(snapshot.errors_by_code.get("STREAM_ERROR"), Some(&1));
    }

    #[tokio::test]
    async fn test_relay_call_success() {
        let call = async {
            tokio::time::sleep(Duration::from_millis(60)).await;
            Ok::<_, RpcCallError>(json!({"text": "hola"}))
        };
        let texts: Vec<String> = EventSink::new(Duration::from_millis(15))
            .relay_call("c5", call)
            .collect()
            .await;
        let last = EventFormatter::parse(texts.last().unwrap()).unwrap();
        assert_eq!(last.kind, WireEventKind::Complete);
        assert_eq!(last.data["result"], json!({"text": "hola"}));
        assert!(texts.len() >= 2);
    }

    #[tokio::test]
    async fn test_relay_call_remote_error_keeps_code() {
        let call = async {
            Err::<Value, _>(RpcCallError::Remote {
                code: -32000,
                message: "missing 'text'".to_string(),
                data: Some(json!({"code": "INVALID_INPUT", "recoverable": false})),
            })
        };
        let texts: Vec<String> = EventSink::new(Duration::from_secs(60))
            .relay_call("c6", call)
            .collect()
            .await;
        assert_eq!(texts.len(), 1);
        let event = EventFormatter::parse(&texts[0]).unwrap();
        assert_eq!(event.kind, WireEventKind::Error);
        assert_eq!(event.data["error"]["code"], "INVALID_INPUT");
        assert_eq!(event.data["error"]["recoverable"], false);
    }

    #[test]
    fn test_call_error_event_mapping() {
        let timeout = call_error_event(&RpcCallError::Timeout {
            method: "echo.execute".into(),
            correlation_id: "x".into(),
            timeout_ms: 10,
        });
        assert_eq!(timeout.error_info().unwrap().code, "TIMEOUT_ERROR");

        let closed = call_error_event(&RpcCallError::NotConnected);
        assert_eq!(closed.error_info().unwrap().code, "CONNECTION_ERROR");
    }

    #[tokio::test]
    async fn test_sink_created_events_carry_timestamps() {
        let config = StreamingConfig {
            include_timestamps: true,
            ..StreamingConfig::default()
        };
        let sink = EventSink::from_config(&config);

        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        let texts: Vec<String> = sink.stream("c7", rx).collect().await;
        let vanished = EventFormatter::parse(&texts[0]).unwrap();
        assert_eq!(vanished.data["error"]["code"], "STREAM_ERROR");
        assert!(vanished.data["timestamp"].is_string());

        let texts: Vec<String> = sink
            .relay_call("c8", async { Ok::<_, RpcCallError>(json!(1)) })
            .collect()
            .await;
        let relayed = EventFormatter::parse(&texts[0]).unwrap();
        assert_eq!(relayed.kind, WireEventKind::Complete);
        assert!(relayed.data["timestamp"].is_string());

        let texts: Vec<String> = EventSink::new(Duration::from_secs(60))
            .relay_call("c9", async { Ok::<_, RpcCallError>(json!(1)) })
            .collect()
            .await;
        assert!(EventFormatter::parse(&texts[0]).unwrap().data.get("timestamp").is_none());
    }
}
