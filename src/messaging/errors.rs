//! # Messaging Error Types
//!
//! Structured transport and correlation errors built on thiserror.
//!
//! - [`MessagingError`] covers the broker itself: connections, channels,
//!   queue declaration, publish/consume and (de)serialization. These are
//!   recoverable by reconnecting and only reach a caller once retries are
//!   exhausted.
//! - [`RpcCallError`] is what a single `RpcProducer::call` resolves to when
//!   it does not get a `result` back.

use serde_json::Value;
use thiserror::Error;

/// Transport-level messaging errors
#[derive(Error, Debug, Clone)]
pub enum MessagingError {
    #[error("Broker connection error: {message}")]
    Connection { message: String },

    #[error("Broker channel error: {message}")]
    Channel { message: String },

    #[error("Queue declaration failed: {queue_name}: {message}")]
    QueueDeclaration { queue_name: String, message: String },

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Publish failed: routing key {routing_key}: {message}")]
    Publish {
        routing_key: String,
        message: String,
    },

    #[error("Consume failed: {queue_name}: {message}")]
    Consume { queue_name: String, message: String },

    #[error("Acknowledgement failed: delivery {delivery_tag}: {message}")]
    Acknowledgement { delivery_tag: u64, message: String },

    #[error("Message serialization error: {message}")]
    MessageSerialization { message: String },

    #[error("Message deserialization error: {message}")]
    MessageDeserialization { message: String },

    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Reconnection failed after {attempts} attempts: {message}")]
    ReconnectExhausted { attempts: u32, message: String },

    #[error("Broker connection is closed")]
    Closed,
}

impl MessagingError {
    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a channel error
    pub fn channel(message: impl Into<String>) -> Self {
        Self::Channel {
            message: message.into(),
        }
    }

    /// Create a queue declaration error
    pub fn queue_declaration(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QueueDeclaration {
            queue_name: queue_name.into(),
            message: message.into(),
        }
    }

    /// Create a queue not found error
    pub fn queue_not_found(queue_name: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue_name: queue_name.into(),
        }
    }

    /// Create a publish error
    pub fn publish(routing_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            routing_key: routing_key.into(),
            message: message.into(),
        }
    }

    /// Create a consume error
    pub fn consume(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Consume {
            queue_name: queue_name.into(),
            message: message.into(),
        }
    }

    /// Create an acknowledgement error
    pub fn acknowledgement(delivery_tag: u64, message: impl Into<String>) -> Self {
        Self::Acknowledgement {
            delivery_tag,
            message: message.into(),
        }
    }

    /// Create a message serialization error
    pub fn message_serialization(message: impl Into<String>) -> Self {
        Self::MessageSerialization {
            message: message.into(),
        }
    }

    /// Create a message deserialization error
    pub fn message_deserialization(message: impl Into<String>) -> Self {
        Self::MessageDeserialization {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create a reconnect-exhausted error
    pub fn reconnect_exhausted(attempts: u32, message: impl Into<String>) -> Self {
        Self::ReconnectExhausted {
            attempts,
            message: message.into(),
        }
    }

    /// Whether reconnecting may clear this error
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::Channel { .. }
                | Self::Publish { .. }
                | Self::Consume { .. }
                | Self::Closed
        )
    }
}

/// Conversion from serde_json::Error to MessagingError
impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_eof() || err.is_data() {
            MessagingError::message_deserialization(err.to_string())
        } else {
            MessagingError::message_serialization(err.to_string())
        }
    }
}

/// Conversion from lapin errors (anything not mapped at the call site)
impl From<lapin::Error> for MessagingError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::InvalidChannelState(_) | lapin::Error::ChannelsLimitReached => {
                MessagingError::channel(err.to_string())
            }
            _ => MessagingError::connection(err.to_string()),
        }
    }
}

/// Result type alias for messaging operations
pub type MessagingResult<T> = Result<T, MessagingError>;

/// Outcome of a correlated call that did not produce a `result`
#[derive(Error, Debug, Clone)]
pub enum RpcCallError {
    #[error("RPC call {method} timed out after {timeout_ms}ms (correlation_id={correlation_id})")]
    Timeout {
        method: String,
        correlation_id: String,
        timeout_ms: u64,
    },

    #[error("RPC connection closed before reply (correlation_id={correlation_id})")]
    ConnectionClosed { correlation_id: String },

    #[error("RPC producer is not connected; call connect() first")]
    NotConnected,

    #[error("RPC error [{code}]: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("Malformed RPC reply (correlation_id={correlation_id}): {message}")]
    MalformedReply {
        correlation_id: String,
        message: String,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] MessagingError),
}

impl RpcCallError {
    /// Whether the caller may resubmit the same request
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::ConnectionClosed { .. } | Self::NotConnected => true,
            Self::Transport(inner) => inner.is_transient(),
            Self::Remote { data, .. } => data
                .as_ref()
                .and_then(|d| d.get("recoverable"))
                .and_then(Value::as_bool)
                .unwrap_or(false),
            Self::MalformedReply { .. } => false,
        }
    }
}
