//! In-memory pub/sub channels for tests and local development

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;

use super::{PubSubTransport, APP_ID_HEADER};
use crate::{BusError, BusMessage, BusResult, PublishMode};

struct Broker {
    sender: broadcast::Sender<BusMessage>,
    reachable: AtomicBool,
}

/// Pub/sub transport over a tokio broadcast channel
///
/// Every handle created with [`InMemoryBus::attach`] talks to the same broker,
/// so two clients in one process can exchange messages. Like a real channel
/// store, nothing is buffered for channels nobody subscribes to.
///
/// # Example
/// ```rust
/// use event_bus_client::{InMemoryBus, PubSubTransport, PublishMode};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
/// bus.connect("billing").await?;
///
/// let mut stream = bus.subscribe("orders.data.orderplaced").await?;
/// bus.publish("orders.data.orderplaced", b"hello".to_vec(), PublishMode::Confirmed).await?;
///
/// let msg = stream.next().await.unwrap();
/// assert_eq!(msg.payload, b"hello");
/// # Ok(())
/// # }
/// ```
pub struct InMemoryBus {
    broker: Arc<Broker>,
    app_id: RwLock<Option<String>>,
}

impl InMemoryBus {
    /// Create a new broker with a buffer of 1000 messages per subscriber
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    /// Create a new broker with a custom per-subscriber buffer
    pub fn with_capacity(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self {
            broker: Arc::new(Broker {
                sender,
                reachable: AtomicBool::new(true),
            }),
            app_id: RwLock::new(None),
        }
    }

    /// Open another, not yet connected, handle onto the same broker
    pub fn attach(&self) -> Self {
        Self {
            broker: self.broker.clone(),
            app_id: RwLock::new(None),
        }
    }

    /// Simulate the broker going away; new connections fail while unreachable
    pub fn set_reachable(&self, reachable: bool) {
        self.broker.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Number of live channel subscriptions across all handles
    pub fn subscriber_count(&self) -> usize {
        self.broker.sender.receiver_count()
    }

    /// Check if a channel matches a subscription pattern
    ///
    /// Supports NATS-style wildcards so the in-memory bus accepts the same
    /// patterns as [`NatsBus`](super::NatsBus):
    /// - `*` matches exactly one token
    /// - `>` matches one or more tokens
    fn matches_pattern(subject: &str, pattern: &str) -> bool {
        let subject_tokens: Vec<&str> = subject.split('.').collect();
        let pattern_tokens: Vec<&str> = pattern.split('.').collect();

        let mut s_idx = 0;
        let mut p_idx = 0;

        while s_idx < subject_tokens.len() && p_idx < pattern_tokens.len() {
            let pattern_token = pattern_tokens[p_idx];

            if pattern_token == ">" {
                return true;
            } else if pattern_token == "*" || subject_tokens[s_idx] == pattern_token {
                s_idx += 1;
                p_idx += 1;
            } else {
                return false;
            }
        }

        s_idx == subject_tokens.len() && p_idx == pattern_tokens.len()
    }

    fn app_id(&self) -> Option<String> {
        self.app_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSubTransport for InMemoryBus {
    async fn connect(&self, app_id: &str) -> BusResult<()> {
        if !self.broker.reachable.load(Ordering::SeqCst) {
            return Err(BusError::ConnectionError(
                "in-memory broker is unreachable".to_string(),
            ));
        }
        *self.app_id.write().unwrap_or_else(PoisonError::into_inner) = Some(app_id.to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.app_id().is_some() && self.broker.reachable.load(Ordering::SeqCst)
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>, _mode: PublishMode) -> BusResult<()> {
        let app_id = self
            .app_id()
            .ok_or_else(|| BusError::PublishError("not connected".to_string()))?;

        let mut headers = HashMap::new();
        headers.insert(APP_ID_HEADER.to_string(), app_id);
        let msg = BusMessage::new(channel.to_string(), payload).with_headers(headers);

        // No receivers just means nobody is subscribed
        let _ = self.broker.sender.send(msg);

        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        if self.app_id().is_none() {
            return Err(BusError::SubscribeError("not connected".to_string()));
        }

        let mut receiver = self.broker.sender.subscribe();
        let pattern = pattern.to_string();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(msg) => {
                        if Self::matches_pattern(&msg.subject, &pattern) {
                            yield msg;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(channel = %pattern, skipped, "in-memory subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        };

        Ok(stream.boxed())
    }

    async fn close(&self) {
        *self.app_id.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
