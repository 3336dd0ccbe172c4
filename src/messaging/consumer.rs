//! # RPC Consumer
//!
//! Serves the durable work queue. Every delivery is decoded, dispatched,
//! answered with exactly one reply on its `reply_to` queue and only then
//! acknowledged. Up to `max_in_flight` deliveries are processed at once.
//!
//! When the delivery stream fails the consumer reconnects through its
//! [`ConnectionManager`] and subscribes again; the loop only ends with an
//! error once reconnection gives up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{future, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::broker::{
    BrokerChannel, ConsumeOptions, Delivery, DeliveryStream, MessageProperties, OutgoingMessage,
    QueueOptions,
};
use super::connection::ConnectionManager;
use super::dispatcher::{DispatchOutcome, JsonRpcDispatcher};
use super::errors::{MessagingError, MessagingResult};
use crate::config::MediaflowConfig;
use crate::constants::broker::JSON_CONTENT_TYPE;
use crate::logging::log_rpc_operation;

/// Time allowed for in-flight deliveries to finish after shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub queue: String,
    pub prefetch_count: u16,
    pub max_in_flight: usize,
}

impl ConsumerSettings {
    pub fn from_config(config: &MediaflowConfig) -> Self {
        Self {
            queue: config.broker.rpc_queue.clone(),
            prefetch_count: config.broker.prefetch_count,
            max_in_flight: config.rpc.max_in_flight,
        }
    }
}

#[derive(Debug, Default)]
struct ConsumerCounters {
    received: AtomicU64,
    replied: AtomicU64,
    error_replies: AtomicU64,
    reply_failures: AtomicU64,
    missing_reply_to: AtomicU64,
    resubscriptions: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumerStats {
    pub received: u64,
    pub replied: u64,
    pub error_replies: u64,
    pub reply_failures: u64,
    pub missing_reply_to: u64,
    pub resubscriptions: u64,
}

impl ConsumerCounters {
    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            received: self.received.load(Ordering::Relaxed),
            replied: self.replied.load(Ordering::Relaxed),
            error_replies: self.error_replies.load(Ordering::Relaxed),
            reply_failures: self.reply_failures.load(Ordering::Relaxed),
            missing_reply_to: self.missing_reply_to.load(Ordering::Relaxed),
            resubscriptions: self.resubscriptions.load(Ordering::Relaxed),
        }
    }
}

/// Control handle for a running consumer loop
#[derive(Debug)]
pub struct ConsumerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<MessagingResult<()>>,
    counters: Arc<ConsumerCounters>,
}

impl ConsumerHandle {
    /// Stop taking new deliveries; in-flight ones still finish
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn stats(&self) -> ConsumerStats {
        self.counters.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to end; returns the final counters
    pub async fn join(self) -> MessagingResult<ConsumerStats> {
        self.task
            .await
            .map_err(|e| MessagingError::consume("rpc consumer", e.to_string()))??;
        Ok(self.counters.snapshot())
    }
}

#[derive(Debug)]
pub struct RpcConsumer {
    connection: Arc<ConnectionManager>,
    dispatcher: JsonRpcDispatcher,
    settings: ConsumerSettings,
}

impl RpcConsumer {
    pub fn new(
        connection: Arc<ConnectionManager>,
        dispatcher: JsonRpcDispatcher,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            connection,
            dispatcher,
            settings,
        }
    }

    /// Subscribe to the work queue and spawn the processing loop. The first
    /// subscription happens before this returns, so setup errors surface here.
    ///
    /// Only [`ConsumerHandle::shutdown`] stops the loop. Dropping the handle
    /// detaches it and it keeps consuming.
    pub async fn start_consuming(self) -> MessagingResult<ConsumerHandle> {
        let channel = self.connection.channel().await?;
        let subscription = subscribe(channel.as_ref(), &self.settings).await?;

        info!(
            queue = %self.settings.queue,
            prefetch = self.settings.prefetch_count,
            max_in_flight = self.settings.max_in_flight,
            methods = ?self.dispatcher.registry().list_methods(),
            "RpcConsumer started"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(ConsumerCounters::default());
        let consumer_loop = ConsumerLoop {
            connection: self.connection,
            dispatcher: self.dispatcher,
            settings: self.settings,
            counters: Arc::clone(&counters),
        };
        let task = tokio::spawn(consumer_loop.run(
            channel,
            subscription.consumer_tag,
            subscription.deliveries,
            shutdown_rx,
        ));

        Ok(ConsumerHandle {
            shutdown: shutdown_tx,
            task,
            counters,
        })
    }
}

async fn subscribe(
    channel: &dyn BrokerChannel,
    settings: &ConsumerSettings,
) -> MessagingResult<super::broker::Subscription> {
    channel
        .declare_queue(&settings.queue, QueueOptions::durable())
        .await?;
    channel.set_prefetch(settings.prefetch_count).await?;
    channel
        .consume(&settings.queue, ConsumeOptions::manual_ack())
        .await
}

/// Why a delivery stream stopped
enum StreamEnd {
    Failed(MessagingError),
    Closed,
}

struct ConsumerLoop {
    connection: Arc<ConnectionManager>,
    dispatcher: JsonRpcDispatcher,
    settings: ConsumerSettings,
    counters: Arc<ConsumerCounters>,
}

impl ConsumerLoop {
    async fn run(
        self,
        mut channel: Arc<dyn BrokerChannel>,
        mut consumer_tag: String,
        mut deliveries: DeliveryStream,
        mut shutdown: watch::Receiver<bool>,
    ) -> MessagingResult<()> {
        loop {
            let processing = self.process(Arc::clone(&channel), deliveries);
            tokio::pin!(processing);

            let end = tokio::select! {
                end = &mut processing => end,
                Ok(()) = shutdown.changed() => {
                    info!(queue = %self.settings.queue, "RpcConsumer shutting down");
                    if let Err(e) = channel.cancel(&consumer_tag).await {
                        debug!(error = %e, "Consumer cancel failed during shutdown");
                    }
                    if tokio::time::timeout(DRAIN_TIMEOUT, processing).await.is_err() {
                        warn!("In-flight deliveries did not finish before the drain timeout");
                    }
                    return Ok(());
                }
            };

            if *shutdown.borrow() {
                return Ok(());
            }

            match end {
                StreamEnd::Failed(e) => {
                    warn!(
                        queue = %self.settings.queue,
                        error = %e,
                        "Delivery stream failed, reconnecting"
                    );
                }
                StreamEnd::Closed => {
                    warn!(queue = %self.settings.queue, "Delivery stream closed, reconnecting");
                }
            }

            channel = self.connection.reconnect().await?;
            let subscription = subscribe(channel.as_ref(), &self.settings).await?;
            consumer_tag = subscription.consumer_tag;
            deliveries = subscription.deliveries;
            self.counters.resubscriptions.fetch_add(1, Ordering::Relaxed);
            info!(queue = %self.settings.queue, "RpcConsumer resubscribed");
        }
    }

    /// Handle deliveries until the stream ends or yields a transport error
    async fn process(
        &self,
        channel: Arc<dyn BrokerChannel>,
        deliveries: DeliveryStream,
    ) -> StreamEnd {
        let failure = parking_lot::Mutex::new(None);

        deliveries
            .take_while(|item| {
                if let Err(e) = item {
                    *failure.lock() = Some(e.clone());
                }
                future::ready(item.is_ok())
            })
            .filter_map(|item| future::ready(item.ok()))
            .for_each_concurrent(self.settings.max_in_flight.max(1), |delivery| {
                self.handle_delivery(Arc::clone(&channel), delivery)
            })
            .await;

        match failure.into_inner() {
            Some(e) => StreamEnd::Failed(e),
            None => StreamEnd::Closed,
        }
    }

    async fn handle_delivery(&self, channel: Arc<dyn BrokerChannel>, delivery: Delivery) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let correlation_id = delivery.properties.correlation_id.clone();
        let cid_for_log = correlation_id.as_deref().unwrap_or("-");

        let DispatchOutcome { method, response } =
            self.dispatcher.dispatch_raw(&delivery.body).await;
        let method = method.as_deref().unwrap_or("-");
        if response.is_error() {
            self.counters.error_replies.fetch_add(1, Ordering::Relaxed);
        }

        match delivery.properties.reply_to.as_deref().filter(|r| !r.is_empty()) {
            Some(reply_to) => match response.to_bytes() {
                Ok(body) => {
                    let properties = MessageProperties {
                        correlation_id: correlation_id.clone(),
                        content_type: Some(JSON_CONTENT_TYPE.to_string()),
                        ..MessageProperties::default()
                    };
                    match channel
                        .publish(reply_to, OutgoingMessage::new(properties, body))
                        .await
                    {
                        Ok(()) => {
                            self.counters.replied.fetch_add(1, Ordering::Relaxed);
                            log_rpc_operation(
                                "reply_sent",
                                method,
                                cid_for_log,
                                Some(started.elapsed().as_millis() as u64),
                            );
                            debug!(correlation_id = cid_for_log, reply_to = reply_to, "Reply published");
                        }
                        Err(e) => {
                            self.counters.reply_failures.fetch_add(1, Ordering::Relaxed);
                            error!(
                                correlation_id = cid_for_log,
                                reply_to = reply_to,
                                error = %e,
                                "Failed to publish RPC reply"
                            );
                        }
                    }
                }
                Err(e) => {
                    self.counters.reply_failures.fetch_add(1, Ordering::Relaxed);
                    error!(correlation_id = cid_for_log, error = %e, "Failed to encode RPC reply");
                }
            },
            None => {
                self.counters.missing_reply_to.fetch_add(1, Ordering::Relaxed);
                warn!(
                    correlation_id = cid_for_log,
                    method = method,
                    is_error = response.is_error(),
                    "Request has no reply_to, reply discarded"
                );
            }
        }

        if let Err(e) = delivery.ack().await {
            warn!(
                delivery_tag = delivery.delivery_tag,
                error = %e,
                "Failed to acknowledge delivery"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::broker::{BrokerConnector, InMemoryBroker};
    use crate::messaging::connection::BackoffPolicy;
    use crate::registry::{Capability, CapabilityError, CapabilityRegistry};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    #[derive(Debug)]
    struct Echo;

    #[async_trait]
    impl Capability for Echo {
        fn type_name(&self) -> &str {
            "EchoService"
        }

        async fn execute(&self, input: Value) -> Result<Value, CapabilityError> {
            Ok(input)
        }
    }

    fn settings() -> ConsumerSettings {
        ConsumerSettings {
            queue: "rpc_requests_queue".to_string(),
            prefetch_count: 4,
            max_in_flight: 2,
        }
    }

    fn consumer(broker: &InMemoryBroker) -> RpcConsumer {
        let registry =
            CapabilityRegistry::build(vec![Arc::new(Echo) as Arc<dyn Capability>]).unwrap();
        let connection = Arc::new(ConnectionManager::new(
            Arc::new(broker.clone()),
            BackoffPolicy {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                multiplier: 2.0,
                max_attempts: 5,
            },
        ));
        RpcConsumer::new(connection, JsonRpcDispatcher::new(Arc::new(registry)), settings())
    }

    async fn publish_request(broker: &InMemoryBroker, reply_to: Option<&str>, body: &[u8]) {
        let channel = broker.connect().await.unwrap();
        let mut properties = MessageProperties::json("11111111-1111-4111-8111-111111111111");
        properties.reply_to = reply_to.map(str::to_string);
        channel
            .publish("rpc_requests_queue", OutgoingMessage::new(properties, body.to_vec()))
            .await
            .unwrap();
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_replies_and_acks() {
        let broker = InMemoryBroker::new();
        let channel = broker.connect().await.unwrap();
        channel.declare_queue("replies", QueueOptions::durable()).await.unwrap();

        let handle = consumer(&broker).start_consuming().await.unwrap();
        publish_request(
            &broker,
            Some("replies"),
            br#"{"jsonrpc":"2.0","method":"echo.execute","params":{"a":1},"id":"x"}"#,
        )
        .await;

        wait_for(|| broker.queue_depth("replies") == Some(1)).await;
        wait_for(|| broker.unacked_count() == 0).await;
        assert_eq!(handle.stats().replied, 1);

        let mut sub = channel.consume("replies", ConsumeOptions::auto_ack()).await.unwrap();
        let reply = sub.deliveries.next().await.unwrap().unwrap();
        assert_eq!(
            reply.properties.correlation_id.as_deref(),
            Some("11111111-1111-4111-8111-111111111111")
        );
        let body: Value = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(body["result"], json!({"a": 1}));

        handle.shutdown();
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_reply_to_is_acked() {
        let broker = InMemoryBroker::new();
        let handle = consumer(&broker).start_consuming().await.unwrap();
        publish_request(
            &broker,
            None,
            br#"{"jsonrpc":"2.0","method":"echo.execute","params":{},"id":1}"#,
        )
        .await;

        wait_for(|| handle.stats().missing_reply_to == 1).await;
        wait_for(|| broker.unacked_count() == 0).await;
        assert_eq!(broker.queue_depth("rpc_requests_queue"), Some(0));

        handle.shutdown();
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_resubscribes_after_connection_loss() {
        let broker = InMemoryBroker::new();
        let handle = consumer(&broker).start_consuming().await.unwrap();
        assert_eq!(broker.consumer_count("rpc_requests_queue"), Some(1));

        broker.sever_connections();
        wait_for(|| handle.stats().resubscriptions == 1).await;
        assert_eq!(broker.consumer_count("rpc_requests_queue"), Some(1));

        handle.shutdown();
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_handle_keeps_consuming() {
        let broker = InMemoryBroker::new();
        let channel = broker.connect().await.unwrap();
        channel.declare_queue("replies", QueueOptions::durable()).await.unwrap();

        let handle = consumer(&broker).start_consuming().await.unwrap();
        drop(handle);
        tokio::time::sleep(Duration::from_millis(10)).await;

        publish_request(
            &broker,
            Some("replies"),
            br#"{"jsonrpc":"2.0","method":"echo.execute","params":{},"id":2}"#,
        )
        .await;
        wait_for(|| broker.queue_depth("replies") == Some(1)).await;
        assert_eq!(broker.consumer_count("rpc_requests_queue"), Some(1));
    }
}
