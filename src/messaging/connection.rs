//! # Broker Connection Manager
//!
//! Owns one logical broker connection: the channel is opened lazily on first
//! use, reused while it stays open, and replaced by [`ConnectionManager::reconnect`]
//! using exponential backoff.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::broker::{BrokerChannel, BrokerConnector};
use super::errors::{MessagingError, MessagingResult};
use crate::config::ReconnectConfig;

/// Delay schedule between reconnection attempts
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// 0 retries forever
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            max_attempts: config.max_attempts,
        }
    }

    /// Delay after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.powi(exponent);
        if !factor.is_finite() {
            return self.max_delay;
        }
        self.initial_delay.mul_f64(factor).min(self.max_delay)
    }

    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt <= self.max_attempts
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

/// Lazily connected, reconnectable broker session
#[derive(Debug)]
pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    backoff: BackoffPolicy,
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
    closed: AtomicBool,
    reconnects: AtomicU64,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn BrokerConnector>, backoff: BackoffPolicy) -> Self {
        Self {
            connector,
            backoff,
            channel: Mutex::new(None),
            closed: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.connector.provider_name()
    }

    /// The current channel, opening one if none is open
    pub async fn channel(&self) -> MessagingResult<Arc<dyn BrokerChannel>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::Closed);
        }

        let mut current = self.channel.lock().await;
        if let Some(channel) = current.as_ref() {
            if channel.is_open() {
                return Ok(Arc::clone(channel));
            }
            debug!(provider = self.provider_name(), "Cached broker channel is closed, reopening");
        }

        let channel = self.connector.connect().await?;
        *current = Some(Arc::clone(&channel));
        Ok(channel)
    }

    /// Drop the current channel and connect again, backing off between
    /// failed attempts. Fails with `ReconnectExhausted` once the policy's
    /// attempt budget is spent.
    pub async fn reconnect(&self) -> MessagingResult<Arc<dyn BrokerChannel>> {
        let mut current = self.channel.lock().await;
        if let Some(stale) = current.take() {
            if let Err(e) = stale.close().await {
                debug!(error = %e, "Ignoring error while closing stale channel");
            }
        }

        let mut attempt: u32 = 0;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(MessagingError::Closed);
            }
            attempt += 1;

            match self.connector.connect().await {
                Ok(channel) => {
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                    info!(
                        provider = self.provider_name(),
                        attempt, "Reconnected to broker"
                    );
                    *current = Some(Arc::clone(&channel));
                    return Ok(channel);
                }
                Err(e) => {
                    if !self.backoff.allows_attempt(attempt + 1) {
                        error!(
                            provider = self.provider_name(),
                            attempts = attempt,
                            error = %e,
                            "Giving up on broker reconnection"
                        );
                        return Err(MessagingError::reconnect_exhausted(attempt, e.to_string()));
                    }
                    let delay = self.backoff.delay_for(attempt);
                    warn!(
                        provider = self.provider_name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Broker reconnection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Number of successful reconnections so far
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub async fn is_connected(&self) -> bool {
        self.channel
            .lock()
            .await
            .as_ref()
            .is_some_and(|channel| channel.is_open())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the channel; later `channel()` calls fail with `Closed`
    pub async fn close(&self) -> MessagingResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        let channel = self.channel.lock().await.take();
        match channel {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }
}
