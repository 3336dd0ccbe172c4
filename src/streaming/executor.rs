//! Local streaming execution of registered capabilities.
//!
//! [`StreamExecutor`] runs a capability's `execute_stream` on its own task and
//! hands back the receiving end of a bounded event channel. Whatever the
//! capability does, the channel carries exactly one terminal event:
//!
//! - a returned value becomes the `success` event,
//! - a returned [`CapabilityError`] becomes an `error` event naming the stage
//!   that was active,
//! - a panic becomes a `SERVICE_EXECUTION_ERROR` event,
//!
//! unless the capability already emitted its own terminal event. Dropping the
//! receiver makes every later emit fail with `StreamClosed`, which stops the
//! capability at its next emit.
//!
//! ```rust
//! use std::sync::Arc;
//! use mediaflow_core::capabilities::EchoService;
//! use mediaflow_core::config::StreamingConfig;
//! use mediaflow_core::registry::{Capability, CapabilityRegistry};
//! use mediaflow_core::streaming::StreamExecutor;
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let registry = CapabilityRegistry::build(vec![Arc::new(EchoService) as Arc<dyn Capability>]).unwrap();
//! let executor = StreamExecutor::new(Arc::new(registry), &StreamingConfig::default());
//!
//! let mut events = executor.execute_by_name("echo", json!({"message": "hello"}));
//! while let Some(event) = events.recv().await {
//!     println!("{} {}", event.status(), event.progress_value());
//! }
//! # });
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::sink::{stamped, EventSink, EventTextStream};
use crate::config::StreamingConfig;
use crate::constants::error_codes::SERVICE_EXECUTION_ERROR;
use crate::constants::stages::UNKNOWN_STAGE;
use crate::progress::{ErrorInfo, ProgressEmitter, ProgressError, ProgressEvent, ProgressTracker};
use crate::registry::{
    capability_name_for, CapabilityError, CapabilityRegistry, RegisteredCapability,
};

#[derive(Debug, Clone)]
pub struct StreamExecutor {
    registry: Arc<CapabilityRegistry>,
    channel_capacity: usize,
    include_timestamps: bool,
}

impl StreamExecutor {
    pub fn new(registry: Arc<CapabilityRegistry>, config: &StreamingConfig) -> Self {
        Self {
            registry,
            channel_capacity: config.channel_capacity,
            include_timestamps: config.include_timestamps,
        }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Start `entry` on its own task
    pub fn spawn(
        &self,
        entry: &RegisteredCapability,
        input: Value,
    ) -> (mpsc::Receiver<ProgressEvent>, JoinHandle<()>) {
        let capability = Arc::clone(entry.capability());
        let tracker = ProgressTracker::new(entry.stages().clone(), capability.advance_mode())
            .with_timestamps(self.include_timestamps);
        let (mut emitter, receiver) = ProgressEmitter::channel(tracker, self.channel_capacity);
        let method = entry.method_name().to_string();

        let task = tokio::spawn(async move {
            info!(method = %method, "Starting streaming execution");
            let outcome = AssertUnwindSafe(capability.execute_stream(input, &mut emitter))
                .catch_unwind()
                .await;

            let closing = match outcome {
                Ok(Ok(result)) => {
                    if emitter.is_terminated() {
                        Ok(())
                    } else {
                        emitter.complete(Some(result)).await
                    }
                }
                Ok(Err(capability_error)) if emitter.is_closed() => {
                    debug!(method = %method, code = %capability_error.code, "Stream receiver dropped, execution stopped");
                    Ok(())
                }
                Ok(Err(capability_error)) => {
                    warn!(
                        method = %method,
                        code = %capability_error.code,
                        stage = emitter.tracker().current_stage_id(),
                        "Streaming execution failed"
                    );
                    fail(&mut emitter, &capability_error).await
                }
                Err(_) => {
                    error!(method = %method, "Capability panicked during streaming execution");
                    let panicked = CapabilityError::new(
                        SERVICE_EXECUTION_ERROR,
                        format!("Service execution error: {method}"),
                    )
                    .with_details("capability panicked");
                    fail(&mut emitter, &panicked).await
                }
            };

            match closing {
                Ok(()) => info!(
                    method = %method,
                    events = emitter.emitted_count(),
                    "Streaming execution finished"
                ),
                Err(ProgressError::StreamClosed) => {
                    debug!(method = %method, "Stream receiver dropped before the terminal event")
                }
                Err(e) => warn!(method = %method, error = %e, "Could not emit terminal event"),
            }
        });

        (receiver, task)
    }

    /// Resolve `name` (method, short name or type name) and start it. An
    /// unknown name yields a single non-recoverable `SERVICE_NOT_FOUND` event.
    pub fn execute_by_name(&self, name: &str, input: Value) -> mpsc::Receiver<ProgressEvent> {
        let entry = self
            .registry
            .resolve(name)
            .or_else(|| self.registry.get_by_name(&capability_name_for(name)));

        match entry {
            Some(entry) => self.spawn(entry, input).0,
            None => {
                warn!(service = name, "Streaming execution requested for unknown service");
                let (tx, rx) = mpsc::channel(1);
                let info = CapabilityError::not_found(name).to_error_info(UNKNOWN_STAGE);
                let event = stamped(ProgressEvent::error(info), self.include_timestamps);
                // capacity 1 and a fresh channel: the send cannot fail
                let _ = tx.try_send(event);
                rx
            }
        }
    }

    /// [`execute_by_name`](Self::execute_by_name) rendered through `sink`
    pub fn render_by_name(
        &self,
        sink: &EventSink,
        connection_id: impl Into<String>,
        name: &str,
        input: Value,
    ) -> EventTextStream {
        sink.stream(connection_id, self.execute_by_name(name, input))
    }
}

async fn fail(emitter: &mut ProgressEmitter, err: &CapabilityError) -> Result<(), ProgressError> {
    if emitter.is_terminated() || emitter.is_closed() {
        return Ok(());
    }
    let stage = emitter.tracker().current_stage_id().to_string();
    let info: ErrorInfo = err.to_error_info(&stage);
    let event = emitter
        .tracker()
        .error_event(&info.code, &info.message, info.details, info.recoverable);
    emitter.emit(event).await
}
