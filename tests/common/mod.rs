//! Shared fixtures for the integration tests: an in-memory broker with a
//! running consumer and a connected producer, plus a few test capabilities.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use mediaflow_core::capabilities::EchoService;
use mediaflow_core::messaging::{
    BackoffPolicy, ConnectionManager, ConsumerHandle, ConsumerSettings, InMemoryBroker,
    JsonRpcDispatcher, RpcConsumer, RpcProducer,
};
use mediaflow_core::progress::ProgressEmitter;
use mediaflow_core::registry::{Capability, CapabilityError, CapabilityRegistry};
use mediaflow_core::stages::{Stage, StageDefinition};

pub const RPC_QUEUE: &str = "rpc_requests_queue";

pub fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        multiplier: 2.0,
        max_attempts: 5,
    }
}

/// JSON object literal to call params
pub fn params(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("params must be an object, got {other}"),
    }
}

pub async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}

/// Always fails with a non-recoverable `INVALID_INPUT`
#[derive(Debug, Default)]
pub struct RejectingService;

#[async_trait]
impl Capability for RejectingService {
    fn type_name(&self) -> &str {
        "RejectingService"
    }

    async fn execute(&self, _input: Value) -> Result<Value, CapabilityError> {
        Err(CapabilityError::invalid_input("input rejected").with_details("always rejects"))
    }
}

/// Streams `a@10` and `b@50`, four substeps in `a`
#[derive(Debug, Default)]
pub struct StagedService;

#[async_trait]
impl Capability for StagedService {
    fn type_name(&self) -> &str {
        "StagedService"
    }

    fn stages(&self) -> StageDefinition {
        StageDefinition::new(vec![
            Stage::new("a", 10).expect("valid stage").with_substeps(),
            Stage::new("b", 50).expect("valid stage"),
        ])
    }

    async fn execute(&self, _input: Value) -> Result<Value, CapabilityError> {
        Ok(Value::Bool(true))
    }

    async fn execute_stream(
        &self,
        _input: Value,
        emitter: &mut ProgressEmitter,
    ) -> Result<Value, CapabilityError> {
        emitter.start().await?;
        emitter.advance(4).await?;
        for _ in 0..4 {
            emitter.substep().await?;
        }
        emitter.advance(0).await?;
        Ok(Value::Bool(true))
    }
}

pub fn default_capabilities() -> Vec<Arc<dyn Capability>> {
    vec![
        Arc::new(EchoService),
        Arc::new(RejectingService),
        Arc::new(StagedService),
    ]
}

/// Worker and caller wired to one in-memory broker
pub struct RpcHarness {
    pub broker: InMemoryBroker,
    pub producer: Arc<RpcProducer>,
    pub producer_connection: Arc<ConnectionManager>,
    pub consumer: Option<ConsumerHandle>,
}

impl RpcHarness {
    pub async fn start() -> Self {
        Self::start_with(default_capabilities()).await
    }

    pub async fn start_with(capabilities: Vec<Arc<dyn Capability>>) -> Self {
        let broker = InMemoryBroker::new();
        let registry = Arc::new(CapabilityRegistry::build(capabilities).expect("registry builds"));

        let consumer_connection = Arc::new(ConnectionManager::new(
            Arc::new(broker.clone()),
            fast_backoff(),
        ));
        let consumer = RpcConsumer::new(
            consumer_connection,
            JsonRpcDispatcher::new(registry),
            ConsumerSettings {
                queue: RPC_QUEUE.to_string(),
                prefetch_count: 8,
                max_in_flight: 4,
            },
        )
        .start_consuming()
        .await
        .expect("consumer starts");

        let producer_connection = Arc::new(ConnectionManager::new(
            Arc::new(broker.clone()),
            fast_backoff(),
        ));
        let producer = Arc::new(RpcProducer::new(Arc::clone(&producer_connection), RPC_QUEUE));
        producer.connect().await.expect("producer connects");

        Self {
            broker,
            producer,
            producer_connection,
            consumer: Some(consumer),
        }
    }

    pub async fn shutdown(mut self) {
        if let Some(consumer) = self.consumer.take() {
            consumer.shutdown();
            consumer.join().await.expect("consumer drains");
        }
        self.producer.close().await.expect("producer closes");
    }
}
