//! Native transport primitives driven by the connectors
//!
//! A transport only performs native calls. Which topics, queues or channels
//! should be live at any moment is decided by the connector that owns it.

mod inmemory_bus;
mod inmemory_log;
mod inmemory_queue;
mod jetstream_log;
mod jetstream_queue;
mod nats;
mod nats_bus;

pub use inmemory_bus::InMemoryBus;
pub use inmemory_log::InMemoryLog;
pub use inmemory_queue::InMemoryQueue;
pub use jetstream_log::JetStreamLog;
pub use jetstream_queue::JetStreamQueue;
pub use nats::NatsEndpoint;
pub use nats_bus::NatsBus;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::{BusMessage, BusResult, PublishMode};

/// Header carrying the publishing application's id
pub(crate) const APP_ID_HEADER: &str = "App-Id";

/// One record read from a partitioned log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
}

/// Partitioned append log with consumer groups
///
/// Offsets are tracked per (group, topic) and committed as records are
/// polled, except for records handed back with [`LogTransport::rewind`]. A
/// group subscribing to a topic for the first time starts at its current end.
#[async_trait]
pub trait LogTransport: Send + Sync {
    /// Open the producer/consumer pair for `group_id`
    async fn connect(&self, group_id: &str) -> BusResult<()>;

    fn is_connected(&self) -> bool;

    async fn produce(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
        mode: PublishMode,
    ) -> BusResult<()>;

    /// Replace the whole subscription list
    async fn subscribe(&self, topics: &[String]) -> BusResult<()>;

    async fn unsubscribe(&self) -> BusResult<()>;

    /// Topics currently subscribed
    fn subscription(&self) -> Vec<String>;

    /// Read pending records, waiting up to `timeout` when there are none
    async fn poll(&self, timeout: Duration) -> BusResult<Vec<LogRecord>>;

    /// Settle the last poll: its first `delivered` records stay committed and
    /// the rest go back to the group, so the next poll of any member returns
    /// them again
    async fn rewind(&self, delivered: usize) -> BusResult<()>;

    async fn close(&self);
}

/// Routing broker with direct exchanges and durable queues
#[async_trait]
pub trait QueueTransport: Send + Sync {
    async fn connect(&self, app_id: &str) -> BusResult<()>;

    fn is_connected(&self) -> bool;

    /// Declare a direct exchange (idempotent)
    async fn declare_exchange(&self, exchange: &str) -> BusResult<()>;

    /// Declare a durable, lazy queue (idempotent)
    async fn declare_queue(&self, queue: &str) -> BusResult<()>;

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()>;

    async fn unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()>;

    /// Publish a persistent message stamped with the connected application id
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        mode: PublishMode,
    ) -> BusResult<()>;

    /// Start a consumer on `queue`, returning its tag and its deliveries
    async fn consume(&self, queue: &str)
        -> BusResult<(String, BoxStream<'static, QueueDelivery>)>;

    /// Stop a consumer; its unacknowledged deliveries go back to the queue
    async fn cancel(&self, consumer_tag: &str) -> BusResult<()>;

    async fn close(&self);
}

/// Channel-based publish/subscribe store
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    async fn connect(&self, app_id: &str) -> BusResult<()>;

    fn is_connected(&self) -> bool;

    async fn publish(&self, channel: &str, payload: Vec<u8>, mode: PublishMode) -> BusResult<()>;

    /// Subscribe to a channel; dropping the stream unsubscribes
    async fn subscribe(&self, channel: &str) -> BusResult<BoxStream<'static, BusMessage>>;

    async fn close(&self);
}

/// Acknowledges one queue delivery
pub struct DeliveryAcker(Box<dyn FnOnce() -> BoxFuture<'static, BusResult<()>> + Send>);

impl DeliveryAcker {
    pub fn new<F, Fut>(ack: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = BusResult<()>> + Send + 'static,
    {
        Self(Box::new(move || Box::pin(ack())))
    }

    async fn ack(self) -> BusResult<()> {
        (self.0)().await
    }
}

/// A message handed to a queue consumer
///
/// Dropping a delivery without calling [`QueueDelivery::ack`] leaves it
/// unacknowledged on the broker.
pub struct QueueDelivery {
    pub queue: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub redelivered: bool,
    acker: DeliveryAcker,
}

impl QueueDelivery {
    pub fn new(
        queue: impl Into<String>,
        routing_key: impl Into<String>,
        payload: Vec<u8>,
        redelivered: bool,
        acker: DeliveryAcker,
    ) -> Self {
        Self {
            queue: queue.into(),
            routing_key: routing_key.into(),
            payload,
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> BusResult<()> {
        self.acker.ack().await
    }
}

impl fmt::Debug for QueueDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueDelivery")
            .field("queue", &self.queue)
            .field("routing_key", &self.routing_key)
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}
