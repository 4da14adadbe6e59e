//! In-memory routing broker with direct exchanges and acknowledged queues

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc;

use super::{DeliveryAcker, QueueDelivery, QueueTransport};
use crate::{BusError, BusResult, PublishMode};

struct StoredMessage {
    routing_key: String,
    payload: Vec<u8>,
    redelivered: bool,
}

struct Consumer {
    tag: String,
    sender: mpsc::UnboundedSender<QueueDelivery>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    /// Delivered but not yet acked, keyed by delivery tag
    unacked: HashMap<u64, (String, StoredMessage)>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

impl QueueState {
    /// Put unacked deliveries back at the head of the queue, oldest first
    fn requeue(&mut self, owned_by: Option<&str>) {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, (consumer, _))| owned_by.map_or(true, |owner| consumer == owner))
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        for tag in tags.into_iter().rev() {
            if let Some((_, mut message)) = self.unacked.remove(&tag) {
                message.redelivered = true;
                self.ready.push_front(message);
            }
        }
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
    /// (exchange, routing key, queue)
    bindings: HashSet<(String, String, String)>,
    next_delivery_tag: u64,
    next_consumer_tag: u64,
}

struct Broker {
    state: Mutex<BrokerState>,
    reachable: AtomicBool,
    reject_bindings: AtomicBool,
}

impl Broker {
    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct Session {
    app_id: Option<String>,
    consumer_tags: Vec<String>,
}

/// Queue transport backed by an in-process broker
///
/// Consumers on one queue compete: deliveries are handed out round-robin and
/// stay outstanding until acked. Cancelling a consumer, or calling
/// [`InMemoryQueue::recover`], puts its outstanding deliveries back on the
/// queue flagged as redelivered.
pub struct InMemoryQueue {
    broker: Arc<Broker>,
    session: Mutex<Session>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            broker: Arc::new(Broker {
                state: Mutex::new(BrokerState::default()),
                reachable: AtomicBool::new(true),
                reject_bindings: AtomicBool::new(false),
            }),
            session: Mutex::new(Session::default()),
        }
    }

    /// Open another, not yet connected, handle onto the same broker
    pub fn attach(&self) -> Self {
        Self {
            broker: self.broker.clone(),
            session: Mutex::new(Session::default()),
        }
    }

    /// Simulate the broker going away; new connections fail while unreachable
    pub fn set_reachable(&self, reachable: bool) {
        self.broker.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make every subsequent `bind` fail
    pub fn reject_bindings(&self, reject: bool) {
        self.broker.reject_bindings.store(reject, Ordering::SeqCst);
    }

    /// Requeue every outstanding delivery on every queue
    pub fn recover(&self) {
        let mut state = self.broker.lock();
        let names: Vec<String> = state.queues.keys().cloned().collect();
        for name in names {
            if let Some(queue) = state.queues.get_mut(&name) {
                queue.requeue(None);
            }
            deliver_ready(&self.broker, &mut state, &name);
        }
    }

    /// Messages waiting on `queue` for a consumer
    pub fn ready_count(&self, queue: &str) -> usize {
        self.broker.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered from `queue` and not yet acked
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.broker.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.broker.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    /// Routing keys bound to `queue` on `exchange`
    pub fn bindings(&self, queue: &str, exchange: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .broker
            .lock()
            .bindings
            .iter()
            .filter(|(e, _, q)| e == exchange && q == queue)
            .map(|(_, key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    fn app_id(&self) -> Option<String> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .app_id
            .clone()
    }

    fn require_session(&self) -> BusResult<String> {
        self.app_id()
            .ok_or_else(|| BusError::SubscribeError("not connected".to_string()))
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn ack_delivery(broker: &Weak<Broker>, queue: &str, delivery_tag: u64) -> BusResult<()> {
    let broker = broker
        .upgrade()
        .ok_or_else(|| BusError::SubscribeError("broker is gone".to_string()))?;
    let removed = broker
        .lock()
        .queues
        .get_mut(queue)
        .and_then(|q| q.unacked.remove(&delivery_tag));

    match removed {
        Some(_) => Ok(()),
        None => Err(BusError::SubscribeError(format!(
            "delivery {} on queue '{}' is not outstanding",
            delivery_tag, queue
        ))),
    }
}

/// Hand ready messages of `queue` to its consumers
fn deliver_ready(broker: &Arc<Broker>, state: &mut BrokerState, queue: &str) {
    let BrokerState {
        queues,
        next_delivery_tag,
        ..
    } = state;
    let Some(q) = queues.get_mut(queue) else {
        return;
    };

    while !q.consumers.is_empty() {
        let Some(message) = q.ready.pop_front() else {
            break;
        };
        let idx = q.next_consumer % q.consumers.len();
        q.next_consumer = idx + 1;

        *next_delivery_tag += 1;
        let delivery_tag = *next_delivery_tag;
        let acker = {
            let broker = Arc::downgrade(broker);
            let queue = queue.to_string();
            DeliveryAcker::new(move || {
                futures::future::ready(ack_delivery(&broker, &queue, delivery_tag))
            })
        };
        let delivery = QueueDelivery::new(
            queue,
            message.routing_key.clone(),
            message.payload.clone(),
            message.redelivered,
            acker,
        );

        if q.consumers[idx].sender.send(delivery).is_ok() {
            let consumer_tag = q.consumers[idx].tag.clone();
            q.unacked.insert(delivery_tag, (consumer_tag, message));
        } else {
            q.consumers.remove(idx);
            q.ready.push_front(message);
        }
    }
}

#[async_trait]
impl QueueTransport for InMemoryQueue {
    async fn connect(&self, app_id: &str) -> BusResult<()> {
        if !self.broker.reachable.load(Ordering::SeqCst) {
            return Err(BusError::ConnectionError(
                "in-memory queue broker is unreachable".to_string(),
            ));
        }
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .app_id = Some(app_id.to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.app_id().is_some() && self.broker.reachable.load(Ordering::SeqCst)
    }

    async fn declare_exchange(&self, exchange: &str) -> BusResult<()> {
        self.require_session()?;
        self.broker.lock().exchanges.insert(exchange.to_string());
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> BusResult<()> {
        self.require_session()?;
        self.broker
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()> {
        self.require_session()?;
        if self.broker.reject_bindings.load(Ordering::SeqCst) {
            return Err(BusError::SubscribeError(format!(
                "broker refused to bind '{}' to {}/{}",
                queue, exchange, routing_key
            )));
        }

        let mut state = self.broker.lock();
        if !state.exchanges.contains(exchange) {
            return Err(BusError::SubscribeError(format!("no exchange '{}'", exchange)));
        }
        if !state.queues.contains_key(queue) {
            return Err(BusError::SubscribeError(format!("no queue '{}'", queue)));
        }
        state.bindings.insert((
            exchange.to_string(),
            routing_key.to_string(),
            queue.to_string(),
        ));
        Ok(())
    }

    async fn unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()> {
        self.require_session()?;
        self.broker.lock().bindings.remove(&(
            exchange.to_string(),
            routing_key.to_string(),
            queue.to_string(),
        ));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        _mode: PublishMode,
    ) -> BusResult<()> {
        if self.app_id().is_none() {
            return Err(BusError::PublishError("not connected".to_string()));
        }

        let mut state = self.broker.lock();
        if !state.exchanges.contains(exchange) {
            return Err(BusError::PublishError(format!("no exchange '{}'", exchange)));
        }

        let targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|(e, key, _)| e == exchange && key == routing_key)
            .map(|(_, _, queue)| queue.clone())
            .collect();

        for queue in targets {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_back(StoredMessage {
                    routing_key: routing_key.to_string(),
                    payload: payload.clone(),
                    redelivered: false,
                });
            }
            deliver_ready(&self.broker, &mut state, &queue);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> BusResult<(String, BoxStream<'static, QueueDelivery>)> {
        let app_id = self.require_session()?;
        let (sender, mut receiver) = mpsc::unbounded_channel();

        let consumer_tag = {
            let mut state = self.broker.lock();
            if !state.queues.contains_key(queue) {
                return Err(BusError::SubscribeError(format!("no queue '{}'", queue)));
            }
            state.next_consumer_tag += 1;
            let consumer_tag = format!("{}-ctag-{}", app_id, state.next_consumer_tag);
            if let Some(q) = state.queues.get_mut(queue) {
                q.consumers.push(Consumer {
                    tag: consumer_tag.clone(),
                    sender,
                });
            }
            deliver_ready(&self.broker, &mut state, queue);
            consumer_tag
        };

        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .consumer_tags
            .push(consumer_tag.clone());

        let deliveries = async_stream::stream! {
            while let Some(delivery) = receiver.recv().await {
                yield delivery;
            }
        };
        Ok((consumer_tag, deliveries.boxed()))
    }

    async fn cancel(&self, consumer_tag: &str) -> BusResult<()> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .consumer_tags
            .retain(|tag| tag != consumer_tag);

        let mut state = self.broker.lock();
        let owner = state
            .queues
            .iter()
            .find(|(_, q)| q.consumers.iter().any(|c| c.tag == consumer_tag))
            .map(|(name, _)| name.clone());

        // A consumer whose stream was dropped is already gone from the list
        let queue = owner.or_else(|| {
            state
                .queues
                .iter()
                .find(|(_, q)| q.unacked.values().any(|(c, _)| c == consumer_tag))
                .map(|(name, _)| name.clone())
        });

        let Some(queue) = queue else {
            return Err(BusError::SubscribeError(format!(
                "unknown consumer '{}'",
                consumer_tag
            )));
        };

        if let Some(q) = state.queues.get_mut(&queue) {
            q.consumers.retain(|c| c.tag != consumer_tag);
            q.requeue(Some(consumer_tag));
        }
        deliver_ready(&self.broker, &mut state, &queue);
        Ok(())
    }

    async fn close(&self) {
        let tags = {
            let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut session.consumer_tags)
        };
        for tag in tags {
            if let Err(e) = self.cancel(&tag).await {
                tracing::debug!(consumer_tag = %tag, error = %e, "cancel on close failed");
            }
        }
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .app_id = None;
    }
}
