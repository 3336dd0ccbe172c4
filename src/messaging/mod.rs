//! # Messaging Module
//!
//! JSON-RPC 2.0 over a message broker. Callers publish requests to a durable
//! work queue and receive replies on a private, exclusive reply queue matched
//! by correlation id; workers consume the work queue and dispatch requests to
//! registered capabilities.
//!
//! The broker itself sits behind [`BrokerConnector`]/[`BrokerChannel`]:
//! [`RabbitMqConnector`] for AMQP, [`InMemoryBroker`] for tests and local runs.

pub mod broker;
pub mod connection;
pub mod consumer;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod producer;

pub use broker::{
    Acknowledger, BrokerChannel, BrokerConnector, BrokerStats, ConsumeOptions, Delivery,
    DeliveryStream, InMemoryBroker, MessageProperties, OutgoingMessage, QueueOptions,
    RabbitMqConnector, Subscription,
};
pub use connection::{BackoffPolicy, ConnectionManager};
pub use consumer::{ConsumerHandle, ConsumerSettings, ConsumerStats, RpcConsumer};
pub use dispatcher::{DispatchOutcome, JsonRpcDispatcher};
pub use envelope::{CorrelationId, RequestEnvelope, RpcErrorObject, RpcRequest, RpcResponse};
pub use errors::{MessagingError, MessagingResult, RpcCallError};
pub use producer::{ProducerStats, RpcProducer};
