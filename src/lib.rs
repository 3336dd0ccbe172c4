#![allow(clippy::doc_markdown)] // Allow technical terms like RabbitMQ, JSON-RPC in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Mediaflow Core
//!
//! Broker-backed RPC, capability dispatch and staged progress streaming for
//! media-processing workers.
//!
//! ## Overview
//!
//! A gateway publishes JSON-RPC 2.0 requests to a durable broker queue and
//! waits for correlated replies; workers consume that queue and dispatch each
//! request to a registered capability (`translate.execute`,
//! `transcribe.execute`, ...). Long-running capabilities report progress
//! through named stages, and that progress is pushed to clients as a stream
//! of `event:`/`data:` text events ending in exactly one terminal event.
//!
//! ## Module Organization
//!
//! - [`messaging`] - Broker abstraction, correlated producer, consumer and dispatcher
//! - [`registry`] - Capability contract, discovery and the method registry
//! - [`stages`] - Stage definitions and stage files
//! - [`progress`] - Progress events, tracker and emitter
//! - [`streaming`] - Local streaming execution, wire format, sinks and metrics
//! - [`capabilities`] - Built-in capabilities
//! - [`config`] - Layered configuration
//! - [`error`] - Crate-level error type
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use mediaflow_core::messaging::{BackoffPolicy, ConnectionManager, InMemoryBroker, RpcProducer};
//! use serde_json::{json, Map};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = InMemoryBroker::new();
//! let connection = Arc::new(ConnectionManager::new(Arc::new(broker), BackoffPolicy::default()));
//! let producer = RpcProducer::new(connection, "rpc_requests_queue");
//! producer.connect().await?;
//!
//! let mut params = Map::new();
//! params.insert("message".to_string(), json!("hi"));
//! let result = producer
//!     .call("echo.execute", params, Duration::from_secs(5))
//!     .await?;
//! println!("{result}");
//! # Ok(())
//! # }
//! ```

pub mod capabilities;
pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod progress;
pub mod registry;
pub mod stages;
pub mod streaming;

pub use config::{ConfigManager, MediaflowConfig};
pub use error::{MediaflowError, Result};
pub use messaging::{JsonRpcDispatcher, RpcConsumer, RpcProducer};
pub use progress::{ProgressEmitter, ProgressEvent};
pub use registry::{Capability, CapabilityError, CapabilityRegistry};
pub use streaming::{EventFormatter, EventSink, StreamExecutor};
