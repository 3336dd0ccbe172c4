//! # Broker Abstraction
//!
//! Provider-agnostic AMQP-style primitives used by the RPC producer and
//! consumer. Two providers implement them:
//!
//! - [`RabbitMqConnector`]: `lapin` over AMQP 0.9.1
//! - [`InMemoryBroker`]: tokio/futures channels inside one process, with the
//!   same queue semantics (durable shared queues with round-robin consumers,
//!   exclusive auto-delete server-named queues, manual ack, requeue on nack or
//!   channel loss)
//!
//! Everything is routed through the default exchange: the routing key of a
//! publish is the destination queue name.

pub mod in_memory;
pub mod rabbitmq;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::errors::MessagingResult;
use crate::constants::broker::{JSON_CONTENT_TYPE, PERSISTENT_DELIVERY_MODE};

pub use in_memory::{BrokerStats, InMemoryBroker};
pub use rabbitmq::RabbitMqConnector;

/// Queue declaration flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Shared work queue that survives broker restarts
    pub fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Private reply queue, removed together with its owning channel
    pub fn exclusive_reply() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Message properties the RPC layer relies on
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
    pub delivery_mode: Option<u8>,
}

impl MessageProperties {
    /// JSON content type with the given correlation id
    pub fn json(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            reply_to: None,
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            delivery_mode: None,
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn persistent(mut self) -> Self {
        self.delivery_mode = Some(PERSISTENT_DELIVERY_MODE);
        self
    }
}

/// A message ready to be published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

impl OutgoingMessage {
    pub fn new(properties: MessageProperties, body: Vec<u8>) -> Self {
        Self { properties, body }
    }
}

/// Consumer registration flags
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    /// Deliveries are considered acknowledged as soon as they are sent
    pub no_ack: bool,
    /// Explicit consumer tag; a unique one is generated when absent
    pub consumer_tag: Option<String>,
}

impl ConsumeOptions {
    pub fn manual_ack() -> Self {
        Self::default()
    }

    pub fn auto_ack() -> Self {
        Self {
            no_ack: true,
            consumer_tag: None,
        }
    }
}

/// Settles a single delivery
#[async_trait]
pub trait Acknowledger: Send + Sync + Debug {
    async fn ack(&self) -> MessagingResult<()>;

    async fn nack(&self, requeue: bool) -> MessagingResult<()>;
}

/// A message handed to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
    pub redelivered: bool,
    /// `None` for no-ack consumers
    pub acker: Option<Arc<dyn Acknowledger>>,
}

impl Delivery {
    /// Acknowledge the delivery (no-op for no-ack consumers)
    pub async fn ack(&self) -> MessagingResult<()> {
        match &self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    /// Reject the delivery, optionally returning it to its queue
    pub async fn nack(&self, requeue: bool) -> MessagingResult<()> {
        match &self.acker {
            Some(acker) => acker.nack(requeue).await,
            None => Ok(()),
        }
    }
}

/// Stream of deliveries; an `Err` item means the underlying transport failed
pub type DeliveryStream = BoxStream<'static, MessagingResult<Delivery>>;

/// An active consumer registration
pub struct Subscription {
    pub consumer_tag: String,
    pub deliveries: DeliveryStream,
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("consumer_tag", &self.consumer_tag)
            .finish_non_exhaustive()
    }
}

/// One open channel on a broker connection
#[async_trait]
pub trait BrokerChannel: Send + Sync + Debug {
    /// Declare a queue (idempotent). An empty name asks the broker to
    /// generate one; the actual name is returned.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> MessagingResult<String>;

    /// Limit unacknowledged deliveries per consumer on this channel
    async fn set_prefetch(&self, count: u16) -> MessagingResult<()>;

    /// Publish to the default exchange using `routing_key` as queue name
    async fn publish(&self, routing_key: &str, message: OutgoingMessage) -> MessagingResult<()>;

    async fn consume(&self, queue: &str, options: ConsumeOptions)
        -> MessagingResult<Subscription>;

    async fn cancel(&self, consumer_tag: &str) -> MessagingResult<()>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> MessagingResult<()>;
}

/// Opens channels on a broker
#[async_trait]
pub trait BrokerConnector: Send + Sync + Debug {
    async fn connect(&self) -> MessagingResult<Arc<dyn BrokerChannel>>;

    fn provider_name(&self) -> &'static str;
}
