//! Queue manager
//!
//! Producers put messages on a bounded in-process buffer; a sender loop drains
//! it and publishes each message with bounded retries, re-dialing the broker
//! between attempts. A receiver loop consumes the same queue and hands every
//! body to a handler whose errors and panics are contained.

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use services_common::constants::{
    CONSUMER_TAG, DEFAULT_QUEUE_NAME, ENQUEUE_TIMEOUT_MS, MAX_PUBLISH_ATTEMPTS, PUBLISH_TIMEOUT_MS,
    QUEUE_BUFFER_CAPACITY, RECONNECT_DELAY_MS,
};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerConnector, BrokerSession, DeliveryStream};
use crate::error::{DispatchError, DispatchResult};

/// Longest body prefix echoed into handler failure logs
const BODY_PREVIEW_CHARS: usize = 256;

/// Queue manager tuning
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue to publish to and consume from
    pub queue_name: String,
    /// Capacity of the publish buffer
    pub buffer_capacity: usize,
    /// How long `enqueue` waits for buffer space
    pub enqueue_timeout: Duration,
    /// Deadline of one publish attempt, connect included
    pub publish_timeout: Duration,
    /// Attempts per message before it is dropped
    pub max_publish_attempts: u32,
    /// Pause before the receiver re-subscribes
    pub reconnect_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            buffer_capacity: QUEUE_BUFFER_CAPACITY,
            enqueue_timeout: Duration::from_millis(ENQUEUE_TIMEOUT_MS),
            publish_timeout: Duration::from_millis(PUBLISH_TIMEOUT_MS),
            max_publish_attempts: MAX_PUBLISH_ATTEMPTS,
            reconnect_delay: Duration::from_millis(RECONNECT_DELAY_MS),
        }
    }
}

/// Broker connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never dialed
    Uninitialized,
    /// Session open
    Connected,
    /// Last operation failed; the next one re-dials
    Error,
    /// Loops stopped; terminal
    Closed,
}

/// Accepts messages for asynchronous delivery
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Buffer one JSON message for publishing
    async fn enqueue(&self, message: serde_json::Value) -> DispatchResult<()>;
}

/// Owns one broker session, the publish buffer and both loops
pub struct QueueManager {
    config: QueueConfig,
    connector: Arc<dyn BrokerConnector>,
    buffer_tx: mpsc::Sender<serde_json::Value>,
    buffer_rx: Mutex<Option<mpsc::Receiver<serde_json::Value>>>,
    session: tokio::sync::Mutex<Option<Box<dyn BrokerSession>>>,
    state: RwLock<ConnectionState>,
}

impl QueueManager {
    /// Create a manager; nothing is dialed until the first publish or subscribe
    pub fn new(config: QueueConfig, connector: Arc<dyn BrokerConnector>) -> Self {
        let (buffer_tx, buffer_rx) = mpsc::channel(config.buffer_capacity.max(1));

        Self {
            config,
            connector,
            buffer_tx,
            buffer_rx: Mutex::new(Some(buffer_rx)),
            session: tokio::sync::Mutex::new(None),
            state: RwLock::new(ConnectionState::Uninitialized),
        }
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write();
        if *state != ConnectionState::Closed {
            *state = next;
        }
    }

    /// Serialize `message` and buffer it
    pub async fn enqueue_json<T: Serialize + ?Sized>(&self, message: &T) -> DispatchResult<()> {
        let value = serde_json::to_value(message)?;
        self.push(value).await
    }

    async fn push(&self, message: serde_json::Value) -> DispatchResult<()> {
        if self.state() == ConnectionState::Closed {
            return Err(DispatchError::QueueClosed);
        }

        match timeout(self.config.enqueue_timeout, self.buffer_tx.send(message)).await {
            Ok(Ok(())) => {
                debug!(queue = %self.config.queue_name, "Message buffered");
                Ok(())
            }
            Ok(Err(_)) => Err(DispatchError::QueueClosed),
            Err(_) => {
                let waited_ms = u64::try_from(self.config.enqueue_timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(queue = %self.config.queue_name, waited_ms, "Publish buffer full");
                Err(DispatchError::QueueBusy { waited_ms })
            }
        }
    }

    /// Drain the buffer and publish until `cancel` fires.
    ///
    /// Only one sender loop may run per manager. Messages still buffered at
    /// cancellation are dropped.
    pub async fn run_sender(&self, cancel: CancellationToken) -> DispatchResult<()> {
        let mut buffer = self
            .buffer_rx
            .lock()
            .take()
            .ok_or_else(|| DispatchError::Configuration {
                message: "queue sender loop is already running".to_string(),
            })?;

        info!(queue = %self.config.queue_name, "Queue sender started");

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                message = buffer.recv() => match message {
                    Some(message) => {
                        if let Err(e) = self.send_message(&message).await {
                            error!(queue = %self.config.queue_name, "Message dropped: {}", e);
                        }
                    }
                    None => break,
                },
            }
        }

        drop(buffer);
        self.close().await;
        info!(queue = %self.config.queue_name, "Queue sender stopped");
        Ok(())
    }

    async fn send_message(&self, message: &serde_json::Value) -> DispatchResult<()> {
        let body = serde_json::to_vec(message)?;
        let attempts = self.config.max_publish_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let outcome = match timeout(self.config.publish_timeout, self.publish_once(&body)).await {
                Ok(result) => result,
                Err(_) => Err(DispatchError::Broker(format!(
                    "publish timed out after {}ms",
                    self.config.publish_timeout.as_millis()
                ))),
            };

            match outcome {
                Ok(()) => {
                    debug!(queue = %self.config.queue_name, attempt, "Message published");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        queue = %self.config.queue_name,
                        attempt,
                        max_attempts = attempts,
                        "Publish failed: {}",
                        e
                    );
                    last_error = e.to_string();
                    self.set_state(ConnectionState::Error);
                    self.reset().await;
                }
            }
        }

        Err(DispatchError::QueuePublishFailed {
            attempts,
            reason: last_error,
        })
    }

    async fn publish_once(&self, body: &[u8]) -> DispatchResult<()> {
        let mut session = self.session.lock().await;
        if session.is_none() {
            *session = Some(self.connector.connect(&self.config.queue_name).await?);
            self.set_state(ConnectionState::Connected);
        }

        let Some(session) = session.as_ref() else {
            return Err(DispatchError::Broker("no broker session".to_string()));
        };
        session.publish(&self.config.queue_name, body).await
    }

    async fn subscribe(&self) -> DispatchResult<DeliveryStream> {
        let mut session = self.session.lock().await;
        if session.is_none() {
            *session = Some(self.connector.connect(&self.config.queue_name).await?);
        }

        let Some(session) = session.as_ref() else {
            return Err(DispatchError::Broker("no broker session".to_string()));
        };
        let deliveries = session.consume(&self.config.queue_name, CONSUMER_TAG).await?;
        self.set_state(ConnectionState::Connected);
        Ok(deliveries)
    }

    /// Consume the queue until `cancel` fires, calling `handler` per message.
    ///
    /// Handler errors and panics are logged and the loop keeps going. A broken
    /// delivery stream triggers a reset and a re-subscribe after the
    /// reconnect delay.
    pub async fn run_receiver<F, Fut>(&self, cancel: CancellationToken, handler: F) -> DispatchResult<()>
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync,
        Fut: Future<Output = DispatchResult<()>> + Send,
    {
        info!(queue = %self.config.queue_name, "Queue receiver started");

        'session: while !cancel.is_cancelled() {
            let mut deliveries = match self.subscribe().await {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    error!(queue = %self.config.queue_name, "Subscribe failed: {}", e);
                    self.set_state(ConnectionState::Error);
                    self.reset().await;
                    if !self.wait_reconnect(&cancel).await {
                        break;
                    }
                    continue;
                }
            };

            info!(queue = %self.config.queue_name, consumer = CONSUMER_TAG, "Subscribed");

            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break 'session,
                    delivery = deliveries.next() => match delivery {
                        Some(Ok(body)) => self.handle_delivery(&handler, body).await,
                        Some(Err(e)) => {
                            warn!(queue = %self.config.queue_name, "Delivery failed: {}", e);
                            break;
                        }
                        None => {
                            warn!(queue = %self.config.queue_name, "Delivery stream ended");
                            break;
                        }
                    },
                }
            }

            self.set_state(ConnectionState::Error);
            self.reset().await;
            if !self.wait_reconnect(&cancel).await {
                break;
            }
        }

        self.close().await;
        info!(queue = %self.config.queue_name, "Queue receiver stopped");
        Ok(())
    }

    async fn handle_delivery<F, Fut>(&self, handler: &F, body: Vec<u8>)
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync,
        Fut: Future<Output = DispatchResult<()>> + Send,
    {
        let preview: String = String::from_utf8_lossy(&body)
            .chars()
            .take(BODY_PREVIEW_CHARS)
            .collect();

        let outcome = AssertUnwindSafe(async { handler(body).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(DispatchError::from_panic("queue handler", payload.as_ref())));

        if let Err(e) = outcome {
            error!(queue = %self.config.queue_name, body = %preview, "Message handler failed: {}", e);
        }
    }

    /// Returns false when cancelled during the wait
    async fn wait_reconnect(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(self.config.reconnect_delay) => true,
        }
    }

    /// Close the session if open; the next operation re-dials
    pub async fn reset(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.close().await;
            debug!(queue = %self.config.queue_name, "Broker session closed");
        }
    }

    async fn close(&self) {
        self.reset().await;
        *self.state.write() = ConnectionState::Closed;
    }
}

#[async_trait]
impl MessageSink for QueueManager {
    async fn enqueue(&self, message: serde_json::Value) -> DispatchResult<()> {
        self.push(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;

    fn manager(broker: &InMemoryBroker) -> QueueManager {
        QueueManager::new(QueueConfig::default(), Arc::new(broker.clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_busy_when_buffer_full() {
        let queue = manager(&InMemoryBroker::new());

        for i in 0..QUEUE_BUFFER_CAPACITY {
            queue.enqueue(serde_json::json!({ "n": i })).await.unwrap();
        }

        let err = queue.enqueue(serde_json::json!({ "n": 5 })).await.unwrap_err();
        assert!(matches!(err, DispatchError::QueueBusy { waited_ms: 1000 }));
    }

    #[tokio::test]
    async fn test_second_sender_rejected() {
        let broker = InMemoryBroker::new();
        let queue = Arc::new(manager(&broker));
        let cancel = CancellationToken::new();

        let first = tokio::spawn({
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            async move { queue.run_sender(cancel).await }
        });
        tokio::task::yield_now().await;

        let second = queue.run_sender(cancel.clone()).await;
        assert!(matches!(second, Err(DispatchError::Configuration { .. })));

        cancel.cancel();
        first.await.unwrap().unwrap();
        assert_eq!(queue.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let broker = InMemoryBroker::new();
        let queue = manager(&broker);
        assert_eq!(queue.state(), ConnectionState::Uninitialized);

        queue.send_message(&serde_json::json!({ "id": "o1" })).await.unwrap();
        assert_eq!(queue.state(), ConnectionState::Connected);

        queue.reset().await;
        queue.reset().await;
        assert_eq!(broker.close_count(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_after_close_rejected() {
        let queue = manager(&InMemoryBroker::new());
        queue.close().await;

        let err = queue.enqueue_json(&serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, DispatchError::QueueClosed));
    }
}
