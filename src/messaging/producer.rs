//! # Correlated RPC Producer
//!
//! Sends JSON-RPC requests to the shared work queue and resolves each call
//! from a single exclusive, server-named reply queue owned by this producer.
//!
//! ## Correlation
//!
//! Every call registers a [`PendingCall`] keyed by a fresh UUID v4
//! correlation id. A background listener consumes the reply queue (no-ack)
//! and resolves the matching slot. A reply that arrives after its call timed
//! out, or that carries an unknown or missing correlation id, is an orphan:
//! it is logged, counted and dropped.
//!
//! The publish guard is held only while a request is being published, so any
//! number of calls may await replies at the same time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::StreamExt;
use serde_json::{Map, Value};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::broker::{BrokerChannel, ConsumeOptions, Delivery, DeliveryStream, QueueOptions};
use super::connection::ConnectionManager;
use super::envelope::{CorrelationId, RequestEnvelope, RpcResponse};
use super::errors::{MessagingResult, RpcCallError};
use crate::logging::log_rpc_operation;

type CallOutcome = Result<Value, RpcCallError>;

/// Single-assignment result slot: only the first `try_set` has an effect
#[derive(Debug)]
pub struct ResultSlot {
    sender: parking_lot::Mutex<Option<oneshot::Sender<CallOutcome>>>,
}

impl ResultSlot {
    pub fn channel() -> (Self, oneshot::Receiver<CallOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                sender: parking_lot::Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Fill the slot; returns `false` if it was already resolved
    pub fn try_set(&self, outcome: CallOutcome) -> bool {
        match self.sender.lock().take() {
            Some(tx) => {
                // The waiting caller may have gone away already; the slot is still consumed
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.sender.lock().is_none()
    }
}

/// A call awaiting its reply
#[derive(Debug)]
pub struct PendingCall {
    pub correlation_id: CorrelationId,
    pub method: String,
    /// Reply queue the request named in `reply_to`
    pub reply_queue: String,
    pub sent_at: Instant,
    /// `None` when the timeout does not fit in an `Instant`
    pub deadline: Option<Instant>,
    slot: ResultSlot,
}

/// Producer counters
#[derive(Debug, Default)]
struct ProducerCounters {
    calls_sent: AtomicU64,
    replies_matched: AtomicU64,
    orphaned_replies: AtomicU64,
    timeouts: AtomicU64,
}

/// Point-in-time producer statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProducerStats {
    pub calls_sent: u64,
    pub replies_matched: u64,
    pub orphaned_replies: u64,
    pub timeouts: u64,
    pub pending: usize,
}

#[derive(Debug, Clone)]
struct ReplySession {
    channel: Arc<dyn BrokerChannel>,
    reply_queue: String,
    consumer_tag: String,
}

type PendingTable = Arc<DashMap<CorrelationId, PendingCall>>;

/// Correlated RPC client
#[derive(Debug)]
pub struct RpcProducer {
    connection: Arc<ConnectionManager>,
    rpc_queue: String,
    pending: PendingTable,
    counters: Arc<ProducerCounters>,
    session: parking_lot::RwLock<Option<ReplySession>>,
    listener: parking_lot::Mutex<Option<JoinHandle<()>>>,
    publish_guard: Mutex<()>,
}

impl RpcProducer {
    pub fn new(connection: Arc<ConnectionManager>, rpc_queue: impl Into<String>) -> Self {
        Self {
            connection,
            rpc_queue: rpc_queue.into(),
            pending: Arc::new(DashMap::new()),
            counters: Arc::new(ProducerCounters::default()),
            session: parking_lot::RwLock::new(None),
            listener: parking_lot::Mutex::new(None),
            publish_guard: Mutex::new(()),
        }
    }

    /// Declare the reply queue and start the reply listener. Idempotent.
    pub async fn connect(&self) -> MessagingResult<()> {
        let _guard = self.publish_guard.lock().await;
        if self.session.read().is_some() {
            return Ok(());
        }

        let channel = self.connection.channel().await?;
        self.open_session(channel).await?;
        Ok(())
    }

    /// Declare the queues on `channel`, subscribe to a fresh reply queue and
    /// replace any previous session. Callers hold the publish guard.
    async fn open_session(&self, channel: Arc<dyn BrokerChannel>) -> MessagingResult<ReplySession> {
        channel
            .declare_queue(&self.rpc_queue, QueueOptions::durable())
            .await?;
        let reply_queue = channel
            .declare_queue("", QueueOptions::exclusive_reply())
            .await?;
        let subscription = channel
            .consume(&reply_queue, ConsumeOptions::auto_ack())
            .await?;

        let listener = tokio::spawn(listen_for_replies(
            subscription.deliveries,
            reply_queue.clone(),
            Arc::clone(&self.pending),
            Arc::clone(&self.counters),
        ));

        if let Some(previous) = self.listener.lock().replace(listener) {
            previous.abort();
        }
        let session = ReplySession {
            channel,
            reply_queue: reply_queue.clone(),
            consumer_tag: subscription.consumer_tag,
        };
        *self.session.write() = Some(session.clone());

        info!(
            reply_queue = %reply_queue,
            rpc_queue = %self.rpc_queue,
            provider = self.connection.provider_name(),
            "RpcProducer connected"
        );
        Ok(session)
    }

    /// The live session, re-established through
    /// [`ConnectionManager::reconnect`] when the channel or the reply
    /// listener is gone. Callers hold the publish guard.
    async fn live_session(&self, force_reconnect: bool) -> Result<ReplySession, RpcCallError> {
        let session = self
            .session
            .read()
            .clone()
            .ok_or(RpcCallError::NotConnected)?;
        if !force_reconnect && session.channel.is_open() && self.listener_running() {
            return Ok(session);
        }

        warn!(
            reply_queue = %session.reply_queue,
            provider = self.connection.provider_name(),
            "Reply session lost, reconnecting"
        );
        let channel = self.connection.reconnect().await?;
        Ok(self.open_session(channel).await?)
    }

    fn listener_running(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .is_some_and(|listener| !listener.is_finished())
    }

    /// Whether the reply session is up: the channel is open and the reply
    /// listener is running
    pub fn is_connected(&self) -> bool {
        self.session
            .read()
            .as_ref()
            .is_some_and(|session| session.channel.is_open())
            && self.listener_running()
    }

    /// Name of the reply queue, once connected
    pub fn reply_queue(&self) -> Option<String> {
        self.session.read().as_ref().map(|s| s.reply_queue.clone())
    }

    /// Invoke `method` remotely and wait up to `timeout` for its result
    pub async fn call(
        &self,
        method: &str,
        params: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, RpcCallError> {
        let (envelope, mut receiver) = {
            let _guard = self.publish_guard.lock().await;
            let mut force_reconnect = false;
            loop {
                let session = self.live_session(force_reconnect).await?;

                let envelope =
                    RequestEnvelope::new(method, params.clone(), session.reply_queue.clone());
                let outgoing = envelope.to_outgoing()?;

                let (slot, receiver) = ResultSlot::channel();
                let sent_at = Instant::now();
                self.pending.insert(
                    envelope.correlation_id,
                    PendingCall {
                        correlation_id: envelope.correlation_id,
                        method: method.to_string(),
                        reply_queue: session.reply_queue.clone(),
                        sent_at,
                        deadline: sent_at.checked_add(timeout),
                        slot,
                    },
                );

                if let Err(e) = session.channel.publish(&self.rpc_queue, outgoing).await {
                    self.pending.remove(&envelope.correlation_id);
                    if e.is_transient() && !force_reconnect {
                        warn!(
                            correlation_id = %envelope.correlation_id,
                            method = method,
                            error = %e,
                            "Publish failed, reconnecting before retry"
                        );
                        force_reconnect = true;
                        continue;
                    }
                    error!(
                        correlation_id = %envelope.correlation_id,
                        method = method,
                        error = %e,
                        "Failed to publish RPC request"
                    );
                    return Err(RpcCallError::Transport(e));
                }

                self.counters.calls_sent.fetch_add(1, Ordering::Relaxed);
                log_rpc_operation(
                    "request_sent",
                    method,
                    &envelope.correlation_id.to_string(),
                    None,
                );
                break (envelope, receiver);
            }
        };

        let correlation_id = envelope.correlation_id;
        match tokio::time::timeout(timeout, &mut receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcCallError::ConnectionClosed {
                correlation_id: correlation_id.to_string(),
            }),
            Err(_) => {
                let timeout_error = RpcCallError::Timeout {
                    method: method.to_string(),
                    correlation_id: correlation_id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                };
                match self.pending.remove(&correlation_id) {
                    Some((_, pending)) => {
                        pending.slot.try_set(Err(timeout_error.clone()));
                    }
                    None => {
                        // The listener claimed the slot while the timer fired
                        if let Ok(outcome) = receiver.try_recv() {
                            return outcome;
                        }
                    }
                }
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    correlation_id = %correlation_id,
                    method = method,
                    timeout_ms = timeout.as_millis() as u64,
                    "RPC call timed out"
                );
                Err(timeout_error)
            }
        }
    }

    pub fn stats(&self) -> ProducerStats {
        ProducerStats {
            calls_sent: self.counters.calls_sent.load(Ordering::Relaxed),
            replies_matched: self.counters.replies_matched.load(Ordering::Relaxed),
            orphaned_replies: self.counters.orphaned_replies.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            pending: self.pending.len(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Stop listening, release the reply queue and fail every pending call
    /// with `ConnectionClosed`
    pub async fn close(&self) -> MessagingResult<()> {
        let _guard = self.publish_guard.lock().await;
        let session = self.session.write().take();
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }

        let keys: Vec<CorrelationId> = self.pending.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            if let Some((_, pending)) = self.pending.remove(&key) {
                pending.slot.try_set(Err(RpcCallError::ConnectionClosed {
                    correlation_id: key.to_string(),
                }));
            }
        }

        if let Some(session) = session {
            if let Err(e) = session.channel.cancel(&session.consumer_tag).await {
                debug!(error = %e, "Reply consumer cancel failed during close");
            }
            info!(reply_queue = %session.reply_queue, "RpcProducer closed");
        }
        Ok(())
    }
}

async fn listen_for_replies(
    mut deliveries: DeliveryStream,
    reply_queue: String,
    pending: PendingTable,
    counters: Arc<ProducerCounters>,
) {
    while let Some(item) = deliveries.next().await {
        match item {
            Ok(delivery) => handle_reply(delivery, &pending, &counters),
            Err(e) => {
                error!(error = %e, "Reply queue consumer failed, listener stopping");
                break;
            }
        }
    }

    // Nothing can resolve this queue's remaining calls any more; calls sent
    // through a newer session are left alone
    let keys: Vec<CorrelationId> = pending
        .iter()
        .filter(|entry| entry.value().reply_queue == reply_queue)
        .map(|entry| *entry.key())
        .collect();
    for key in keys {
        if let Some((_, call)) = pending.remove(&key) {
            call.slot.try_set(Err(RpcCallError::ConnectionClosed {
                correlation_id: key.to_string(),
            }));
        }
    }
    debug!(reply_queue = %reply_queue, "Reply listener exited");
}

fn handle_reply(delivery: Delivery, pending: &PendingTable, counters: &ProducerCounters) {
    let Some(raw_id) = delivery.properties.correlation_id.as_deref() else {
        counters.orphaned_replies.fetch_add(1, Ordering::Relaxed);
        warn!("Dropping reply without correlation_id");
        return;
    };

    let Some((correlation_id, call)) = raw_id
        .parse::<CorrelationId>()
        .ok()
        .and_then(|id| pending.remove(&id))
    else {
        counters.orphaned_replies.fetch_add(1, Ordering::Relaxed);
        warn!(correlation_id = raw_id, "Dropping orphaned reply (no pending call)");
        return;
    };

    let outcome = match RpcResponse::from_bytes(&delivery.body) {
        Ok(response) => match (response.error, response.result) {
            (Some(err), _) => {
                warn!(
                    correlation_id = %correlation_id,
                    method = %call.method,
                    code = err.code,
                    message = %err.message,
                    "RPC call returned an error"
                );
                Err(RpcCallError::Remote {
                    code: err.code,
                    message: err.message,
                    data: err.data,
                })
            }
            (None, result) => Ok(result.unwrap_or(Value::Null)),
        },
        Err(e) => {
            error!(
                correlation_id = %correlation_id,
                error = %e,
                "Malformed RPC reply body"
            );
            Err(RpcCallError::MalformedReply {
                correlation_id: correlation_id.to_string(),
                message: e.to_string(),
            })
        }
    };

    if call.slot.try_set(outcome) {
        counters.replies_matched.fetch_add(1, Ordering::Relaxed);
        log_rpc_operation(
            "reply_matched",
            &call.method,
            &correlation_id.to_string(),
            Some(call.sent_at.elapsed().as_millis() as u64),
        );
    }
}
