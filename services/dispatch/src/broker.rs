//! Message broker connections
//!
//! The queue manager talks to the broker through [`BrokerConnector`], which
//! dials, opens a channel and declares the queue in one step, and the
//! [`BrokerSession`] it returns. [`AmqpConnector`] is the RabbitMQ
//! implementation; [`InMemoryBroker`] keeps queues in process and can inject
//! connect and publish failures.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::error::{DispatchError, DispatchResult};

/// Stream of message bodies delivered to a consumer
pub type DeliveryStream = BoxStream<'static, DispatchResult<Vec<u8>>>;

/// Opens broker sessions
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Dial the broker, open a channel and declare `queue`.
    ///
    /// The declare is idempotent; the queue is non-durable, non-exclusive and
    /// not auto-deleted.
    async fn connect(&self, queue: &str) -> DispatchResult<Box<dyn BrokerSession>>;
}

/// An open connection plus channel
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Publish one message body to `queue` through the default exchange
    async fn publish(&self, queue: &str, body: &[u8]) -> DispatchResult<()>;

    /// Subscribe to `queue` without explicit acknowledgement
    async fn consume(&self, queue: &str, consumer_tag: &str) -> DispatchResult<DeliveryStream>;

    /// Close channel then connection; errors are logged and swallowed
    async fn close(&self);
}

/// RabbitMQ connector
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    uri: String,
}

impl AmqpConnector {
    /// Connector for the given `amqp://` uri
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self, queue: &str) -> DispatchResult<Box<dyn BrokerSession>> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| DispatchError::Broker(format!("dial broker: {e}")))?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                close_connection(&connection).await;
                return Err(DispatchError::Broker(format!("create channel: {e}")));
            }
        };

        let session = AmqpSession {
            connection,
            channel,
        };

        if let Err(e) = session
            .channel
            .queue_declare(queue, QueueDeclareOptions::default(), FieldTable::default())
            .await
        {
            session.close().await;
            return Err(DispatchError::Broker(format!("declare queue {queue}: {e}")));
        }

        debug!(queue = %queue, "Broker session opened");
        Ok(Box::new(session))
    }
}

struct AmqpSession {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn publish(&self, queue: &str, body: &[u8]) -> DispatchResult<()> {
        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default().with_content_type("text/json".into()),
            )
            .await
            .map_err(|e| DispatchError::Broker(format!("publish to {queue}: {e}")))?;

        confirm
            .await
            .map_err(|e| DispatchError::Broker(format!("confirm publish to {queue}: {e}")))?;

        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> DispatchResult<DeliveryStream> {
        let options = BasicConsumeOptions {
            no_ack: true,
            ..BasicConsumeOptions::default()
        };

        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await
            .map_err(|e| DispatchError::Broker(format!("consume {queue}: {e}")))?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(|delivery| delivery.data)
                    .map_err(|e| DispatchError::Broker(format!("delivery: {e}")))
            })
            .boxed())
    }

    async fn close(&self) {
        if let Err(e) = self.channel.close(200, "closing").await {
            debug!("Channel close: {}", e);
        }
        close_connection(&self.connection).await;
    }
}

async fn close_connection(connection: &Connection) {
    if let Err(e) = connection.close(200, "closing").await {
        debug!("Connection close: {}", e);
    }
}

struct QueueSlot {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    published: Vec<Vec<u8>>,
}

impl QueueSlot {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Some(rx),
            published: Vec::new(),
        }
    }
}

#[derive(Default)]
struct BrokerState {
    queues: Mutex<FxHashMap<String, QueueSlot>>,
    connect_failures: AtomicU32,
    publish_failures: AtomicU32,
    publish_delay: Mutex<Option<Duration>>,
    connects: AtomicU32,
    closes: AtomicU32,
}

impl BrokerState {
    fn with_queue<T>(&self, queue: &str, f: impl FnOnce(&mut QueueSlot) -> T) -> T {
        let mut queues = self.queues.lock();
        let slot = queues.entry(queue.to_string()).or_insert_with(QueueSlot::new);
        f(slot)
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// In-process broker with failure injection.
///
/// Clones share the same queues. Each queue has a single logical consumer.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    /// Create an empty broker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` connect attempts
    pub fn fail_next_connects(&self, n: u32) {
        self.state.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` publish attempts
    pub fn fail_next_publishes(&self, n: u32) {
        self.state.publish_failures.store(n, Ordering::SeqCst);
    }

    /// Make every publish wait before completing
    pub fn set_publish_delay(&self, delay: Option<Duration>) {
        *self.state.publish_delay.lock() = delay;
    }

    /// Successful connects so far
    #[must_use]
    pub fn connect_count(&self) -> u32 {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Sessions closed so far
    #[must_use]
    pub fn close_count(&self) -> u32 {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Bodies accepted on `queue`, in publish order
    #[must_use]
    pub fn published(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state.with_queue(queue, |slot| slot.published.clone())
    }

    /// Deliver a body to `queue` as if another producer had published it
    pub fn push(&self, queue: &str, body: impl Into<Vec<u8>>) {
        let body = body.into();
        self.state.with_queue(queue, |slot| {
            slot.published.push(body.clone());
            if slot.tx.send(body).is_err() {
                warn!(queue = %queue, "In-memory queue has no consumer, message dropped");
            }
        });
    }

    /// End the current consumer stream of `queue`; a new subscription is possible afterwards
    pub fn drop_consumers(&self, queue: &str) {
        self.state.with_queue(queue, |slot| {
            let published = std::mem::take(&mut slot.published);
            *slot = QueueSlot::new();
            slot.published = published;
        });
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self, queue: &str) -> DispatchResult<Box<dyn BrokerSession>> {
        if take_failure(&self.state.connect_failures) {
            return Err(DispatchError::Broker("dial broker: connection refused".to_string()));
        }

        self.state.with_queue(queue, |_| ());
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(InMemorySession {
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }
}

struct InMemorySession {
    state: Arc<BrokerState>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerSession for InMemorySession {
    async fn publish(&self, queue: &str, body: &[u8]) -> DispatchResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::Broker("channel closed".to_string()));
        }

        let delay = *self.state.publish_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if take_failure(&self.state.publish_failures) {
            return Err(DispatchError::Broker(format!("publish to {queue}: channel error")));
        }

        self.state.with_queue(queue, |slot| {
            slot.published.push(body.to_vec());
            // A queue without consumer keeps the body in `published` only.
            let _ = slot.tx.send(body.to_vec());
        });
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> DispatchResult<DeliveryStream> {
        let rx = self
            .state
            .with_queue(queue, |slot| slot.rx.take())
            .ok_or_else(|| DispatchError::Broker(format!("queue {queue} already has a consumer")))?;

        Ok(UnboundedReceiverStream::new(rx).map(Ok).boxed())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}
