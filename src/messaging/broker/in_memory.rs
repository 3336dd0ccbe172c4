//! # In-Memory Broker
//!
//! Process-local broker for tests and development. Mirrors the subset of
//! AMQP semantics the RPC layer depends on:
//!
//! - **Default exchange routing**: a publish goes to the queue named by its
//!   routing key; unroutable messages are dropped, as with a non-mandatory
//!   AMQP publish
//! - **Round-robin consumers** on shared queues, honoring channel prefetch
//! - **Manual ack**: unacked deliveries are requeued (flagged `redelivered`)
//!   on nack or when their channel closes
//! - **Exclusive queues** belong to the declaring channel and disappear with it
//!
//! [`InMemoryBroker::sever_connections`] simulates a connection loss: every
//! open channel closes and each active consumer stream yields an error.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{
    Acknowledger, BrokerChannel, BrokerConnector, ConsumeOptions, Delivery, MessageProperties,
    OutgoingMessage, QueueOptions, Subscription,
};
use crate::messaging::errors::{MessagingError, MessagingResult};

type DeliverySender = mpsc::UnboundedSender<MessagingResult<Delivery>>;

#[derive(Debug, Clone)]
struct StoredMessage {
    properties: MessageProperties,
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct ConsumerSlot {
    tag: String,
    channel_id: u64,
    no_ack: bool,
    prefetch: u16,
    in_flight: usize,
    sender: DeliverySender,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.no_ack || self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

#[derive(Debug)]
struct QueueState {
    options: QueueOptions,
    owner: Option<u64>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    consumer_tag: String,
    channel_id: u64,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct ChannelState {
    prefetch: u16,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, Unacked>,
    channels: HashMap<u64, ChannelState>,
    next_delivery_tag: u64,
    next_channel_id: u64,
}

/// Internal counters
#[derive(Debug, Default)]
struct BrokerCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    requeued: AtomicU64,
    unroutable: AtomicU64,
}

/// Point-in-time snapshot of broker counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BrokerStats {
    pub published: u64,
    pub delivered: u64,
    pub acked: u64,
    pub nacked: u64,
    pub requeued: u64,
    pub unroutable: u64,
}

#[derive(Debug, Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    counters: BrokerCounters,
    refuse_connections: AtomicBool,
}

/// In-process broker; clones share the same queues
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> BrokerStats {
        let c = &self.inner.counters;
        BrokerStats {
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            acked: c.acked.load(Ordering::Relaxed),
            nacked: c.nacked.load(Ordering::Relaxed),
            requeued: c.requeued.load(Ordering::Relaxed),
            unroutable: c.unroutable.load(Ordering::Relaxed),
        }
    }

    /// Ready (undelivered) message count, `None` if the queue does not exist
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.inner.state.lock().queues.get(queue).map(|q| q.ready.len())
    }

    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.inner.state.lock().queues.contains_key(queue)
    }

    pub fn unacked_count(&self) -> usize {
        self.inner.state.lock().unacked.len()
    }

    pub fn open_channel_count(&self) -> usize {
        self.inner.state.lock().channels.len()
    }

    /// Make subsequent `connect` calls fail until re-enabled
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner
            .refuse_connections
            .store(refuse, Ordering::SeqCst);
    }

    /// Close every open channel as if the connection dropped
    pub fn sever_connections(&self) {
        let mut state = self.inner.state.lock();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            close_channel(
                &self.inner,
                &mut state,
                id,
                Some(MessagingError::connection("connection reset by broker")),
            );
        }
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self) -> MessagingResult<Arc<dyn BrokerChannel>> {
        if self.inner.refuse_connections.load(Ordering::SeqCst) {
            return Err(MessagingError::connection(
                "in-memory broker is refusing connections",
            ));
        }

        let mut state = self.inner.state.lock();
        state.next_channel_id += 1;
        let id = state.next_channel_id;
        state.channels.insert(id, ChannelState::default());
        debug!(channel_id = id, "Opened in-memory broker channel");

        Ok(Arc::new(InMemoryChannel {
            id,
            inner: Arc::clone(&self.inner),
        }))
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}

/// Channel handle on an [`InMemoryBroker`]
#[derive(Debug)]
pub struct InMemoryChannel {
    id: u64,
    inner: Arc<BrokerInner>,
}

impl InMemoryChannel {
    fn ensure_open(&self, state: &BrokerState) -> MessagingResult<()> {
        if state.channels.contains_key(&self.id) {
            Ok(())
        } else {
            Err(MessagingError::Closed)
        }
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> MessagingResult<String> {
        let mut state = self.inner.state.lock();
        self.ensure_open(&state)?;

        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        if let Some(existing) = state.queues.get(&name) {
            return match existing.owner {
                Some(owner) if owner != self.id => Err(MessagingError::queue_declaration(
                    &name,
                    "RESOURCE_LOCKED: queue is exclusive to another channel",
                )),
                _ => Ok(name),
            };
        }

        state.queues.insert(
            name.clone(),
            QueueState {
                options,
                owner: options.exclusive.then_some(self.id),
                ready: VecDeque::new(),
                consumers: Vec::new(),
                cursor: 0,
            },
        );
        debug!(queue = %name, ?options, "Declared in-memory queue");
        Ok(name)
    }

    async fn set_prefetch(&self, count: u16) -> MessagingResult<()> {
        let mut state = self.inner.state.lock();
        match state.channels.get_mut(&self.id) {
            Some(channel) => {
                channel.prefetch = count;
                Ok(())
            }
            None => Err(MessagingError::Closed),
        }
    }

    async fn publish(&self, routing_key: &str, message: OutgoingMessage) -> MessagingResult<()> {
        let mut state = self.inner.state.lock();
        self.ensure_open(&state)
            .map_err(|_| MessagingError::publish(routing_key, "channel is closed"))?;
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);

        match state.queues.get_mut(routing_key) {
            Some(queue) => {
                queue.ready.push_back(StoredMessage {
                    properties: message.properties,
                    body: message.body,
                    redelivered: false,
                });
                pump(&self.inner, &mut state, routing_key);
            }
            None => {
                self.inner.counters.unroutable.fetch_add(1, Ordering::Relaxed);
                debug!(routing_key, "Dropping unroutable message");
            }
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> MessagingResult<Subscription> {
        let mut state = self.inner.state.lock();
        self.ensure_open(&state)
            .map_err(|_| MessagingError::consume(queue, "channel is closed"))?;

        let prefetch = state
            .channels
            .get(&self.id)
            .map(|c| c.prefetch)
            .unwrap_or_default();

        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| MessagingError::queue_not_found(queue))?;
        if matches!(queue_state.owner, Some(owner) if owner != self.id) {
            return Err(MessagingError::consume(
                queue,
                "RESOURCE_LOCKED: queue is exclusive to another channel",
            ));
        }

        let consumer_tag = options
            .consumer_tag
            .unwrap_or_else(|| format!("ctag-{}", Uuid::new_v4().simple()));
        let (sender, receiver) = mpsc::unbounded();
        queue_state.consumers.push(ConsumerSlot {
            tag: consumer_tag.clone(),
            channel_id: self.id,
            no_ack: options.no_ack,
            prefetch,
            in_flight: 0,
            sender,
        });
        pump(&self.inner, &mut state, queue);

        Ok(Subscription {
            consumer_tag,
            deliveries: receiver.boxed(),
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> MessagingResult<()> {
        let mut state = self.inner.state.lock();
        let mut emptied_auto_delete = None;
        for (name, queue) in state.queues.iter_mut() {
            let before = queue.consumers.len();
            queue
                .consumers
                .retain(|c| !(c.tag == consumer_tag && c.channel_id == self.id));
            if queue.consumers.len() != before {
                if queue.cursor >= queue.consumers.len() {
                    queue.cursor = 0;
                }
                if queue.options.auto_delete && queue.consumers.is_empty() {
                    emptied_auto_delete = Some(name.clone());
                }
                break;
            }
        }
        if let Some(name) = emptied_auto_delete {
            state.queues.remove(&name);
            debug!(queue = %name, "Deleted auto-delete queue after last consumer left");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.state.lock().channels.contains_key(&self.id)
    }

    async fn close(&self) -> MessagingResult<()> {
        let mut state = self.inner.state.lock();
        close_channel(&self.inner, &mut state, self.id, None);
        Ok(())
    }
}

#[derive(Debug)]
struct InMemoryAcker {
    broker: Weak<BrokerInner>,
    delivery_tag: u64,
}

impl InMemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> MessagingResult<()> {
        let inner = self.broker.upgrade().ok_or(MessagingError::Closed)?;
        let mut state = inner.state.lock();
        let entry = state.unacked.remove(&self.delivery_tag).ok_or_else(|| {
            MessagingError::acknowledgement(self.delivery_tag, "unknown delivery tag")
        })?;

        match requeue {
            None => inner.counters.acked.fetch_add(1, Ordering::Relaxed),
            Some(_) => inner.counters.nacked.fetch_add(1, Ordering::Relaxed),
        };

        let queue_name = entry.queue.clone();
        if let Some(queue) = state.queues.get_mut(&queue_name) {
            if let Some(consumer) = queue
                .consumers
                .iter_mut()
                .find(|c| c.tag == entry.consumer_tag)
            {
                consumer.in_flight = consumer.in_flight.saturating_sub(1);
            }
            if requeue == Some(true) {
                let mut message = entry.message;
                message.redelivered = true;
                queue.ready.push_front(message);
                inner.counters.requeued.fetch_add(1, Ordering::Relaxed);
            }
        }
        pump(&inner, &mut state, &queue_name);
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self) -> MessagingResult<()> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> MessagingResult<()> {
        self.settle(Some(requeue))
    }
}

/// Hand ready messages to consumers with spare capacity
fn pump(inner: &Arc<BrokerInner>, state: &mut BrokerState, queue_name: &str) {
    let BrokerState {
        queues,
        unacked,
        next_delivery_tag,
        ..
    } = state;

    let Some(queue) = queues.get_mut(queue_name) else {
        return;
    };

    while !queue.ready.is_empty() && !queue.consumers.is_empty() {
        let count = queue.consumers.len();
        let Some(index) = (0..count)
            .map(|offset| (queue.cursor + offset) % count)
            .find(|&i| queue.consumers[i].has_capacity())
        else {
            return;
        };
        queue.cursor = (index + 1) % count;

        let Some(message) = queue.ready.pop_front() else {
            return;
        };
        *next_delivery_tag += 1;
        let delivery_tag = *next_delivery_tag;

        let consumer = &mut queue.consumers[index];
        let acker: Option<Arc<dyn Acknowledger>> = if consumer.no_ack {
            None
        } else {
            Some(Arc::new(InMemoryAcker {
                broker: Arc::downgrade(inner),
                delivery_tag,
            }))
        };
        let delivery = Delivery {
            delivery_tag,
            properties: message.properties.clone(),
            body: message.body.clone(),
            redelivered: message.redelivered,
            acker,
        };

        if consumer.sender.unbounded_send(Ok(delivery)).is_err() {
            // Receiver dropped without cancel; forget the consumer, keep the message
            queue.consumers.remove(index);
            queue.cursor = 0;
            queue.ready.push_front(message);
            continue;
        }

        inner.counters.delivered.fetch_add(1, Ordering::Relaxed);
        if !consumer.no_ack {
            consumer.in_flight += 1;
            unacked.insert(
                delivery_tag,
                Unacked {
                    queue: queue_name.to_string(),
                    consumer_tag: consumer.tag.clone(),
                    channel_id: consumer.channel_id,
                    message,
                },
            );
        }
    }
}

fn close_channel(
    inner: &Arc<BrokerInner>,
    state: &mut BrokerState,
    channel_id: u64,
    error: Option<MessagingError>,
) {
    if state.channels.remove(&channel_id).is_none() {
        return;
    }

    for queue in state.queues.values_mut() {
        queue.consumers.retain(|consumer| {
            if consumer.channel_id != channel_id {
                return true;
            }
            if let Some(err) = &error {
                let _ = consumer.sender.unbounded_send(Err(err.clone()));
            }
            false
        });
        queue.cursor = 0;
    }

    let orphaned: Vec<u64> = state
        .unacked
        .iter()
        .filter(|(_, entry)| entry.channel_id == channel_id)
        .map(|(tag, _)| *tag)
        .collect();
    let mut touched = Vec::new();
    for tag in orphaned {
        if let Some(entry) = state.unacked.remove(&tag) {
            if let Some(queue) = state.queues.get_mut(&entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                queue.ready.push_front(message);
                inner.counters.requeued.fetch_add(1, Ordering::Relaxed);
                touched.push(entry.queue);
            }
        }
    }

    state.queues.retain(|name, queue| {
        let owned = queue.owner == Some(channel_id);
        let abandoned = queue.options.auto_delete && queue.consumers.is_empty();
        if owned || abandoned {
            debug!(queue = %name, "Deleted queue with its channel");
            false
        } else {
            true
        }
    });

    touched.sort();
    touched.dedup();
    for queue in touched {
        pump(inner, state, &queue);
    }
    debug!(channel_id, "Closed in-memory broker channel");
}
