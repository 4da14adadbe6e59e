//! Common utilities for event bus client integration tests
//!
//! ## Fixture scope
//! A [`BusFixture`] owns one client and counts its users. Each test calls
//! [`BusFixture::setup`] to borrow the client and [`BusFixture::teardown`]
//! when done; the last teardown pauses and disposes the client.
//!
//! ```rust,ignore
//! let fixture = BusFixture::new(Backend::Queue.client("orders", "billing"));
//! let client = fixture.setup();
//! // use client...
//! fixture.teardown().await;
//! ```

#![allow(dead_code)]

use event_bus_client::{
    ClientOptions, EventBusClient, EventEnvelope, InMemoryBus, InMemoryLog, InMemoryQueue,
    JsonSerializer, MessageHandler, MessageKind, MessageTag,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// How long tests wait for an asynchronous delivery
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Time that must pass without a delivery for a test to treat it as absent
pub const QUIET_PERIOD: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: String,
    pub amount_cents: i64,
}

impl MessageKind for OrderPlaced {
    const TAG: MessageTag = MessageTag::Data;
}

pub fn order(order_id: &str, amount_cents: i64) -> EventEnvelope<OrderPlaced> {
    EventEnvelope::new(OrderPlaced {
        order_id: order_id.to_string(),
        amount_cents,
    })
}

/// In-memory backends, each driving a different connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Log,
    Queue,
    PubSub,
}

impl Backend {
    pub const ALL: [Backend; 3] = [Backend::Log, Backend::Queue, Backend::PubSub];

    /// Client over a fresh, private in-memory broker
    pub fn client(self, bus_id: &str, app_id: &str) -> EventBusClient {
        self.broker().client(bus_id, app_id)
    }

    pub fn broker(self) -> Broker {
        match self {
            Backend::Log => Broker::Log(InMemoryLog::new()),
            Backend::Queue => Broker::Queue(InMemoryQueue::new()),
            Backend::PubSub => Broker::PubSub(InMemoryBus::new()),
        }
    }
}

/// Handle on an in-memory broker that several clients can attach to
pub enum Broker {
    Log(InMemoryLog),
    Queue(InMemoryQueue),
    PubSub(InMemoryBus),
}

impl Broker {
    pub fn client(&self, bus_id: &str, app_id: &str) -> EventBusClient {
        let options = ClientOptions {
            poll_interval: Duration::from_millis(10),
            ..ClientOptions::default()
        };
        let client = match self {
            Broker::Log(log) => EventBusClient::partitioned_log(
                bus_id,
                app_id,
                JsonSerializer,
                Arc::new(log.attach()),
            ),
            Broker::Queue(queue) => {
                EventBusClient::queue(bus_id, app_id, JsonSerializer, Arc::new(queue.attach()))
            }
            Broker::PubSub(bus) => {
                EventBusClient::pubsub(bus_id, app_id, JsonSerializer, Arc::new(bus.attach()))
            }
        };
        client.with_options(options)
    }

    pub fn set_reachable(&self, reachable: bool) {
        match self {
            Broker::Log(log) => log.set_reachable(reachable),
            Broker::Queue(queue) => queue.set_reachable(reachable),
            Broker::PubSub(bus) => bus.set_reachable(reachable),
        }
    }
}

/// Reference-counted owner of a client shared between test steps
pub struct BusFixture {
    client: Arc<EventBusClient>,
    users: AtomicUsize,
}

impl BusFixture {
    pub fn new(client: EventBusClient) -> Arc<Self> {
        Arc::new(Self {
            client: Arc::new(client),
            users: AtomicUsize::new(0),
        })
    }

    pub fn setup(&self) -> Arc<EventBusClient> {
        self.users.fetch_add(1, Ordering::SeqCst);
        self.client.clone()
    }

    pub fn users(&self) -> usize {
        self.users.load(Ordering::SeqCst)
    }

    /// Release one user; the last one pauses and disposes the client
    pub async fn teardown(&self) {
        if self.users.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _ = self.client.pause().await;
            self.client.dispose().await;
        }
    }
}

/// Collects the payloads a handler receives
#[derive(Clone, Default)]
pub struct Recorder {
    received: Arc<Mutex<Vec<OrderPlaced>>>,
    notify: Arc<Notify>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handler for `creator` that records every payload
    pub fn handler(&self, creator: &str) -> MessageHandler<OrderPlaced> {
        let recorder = self.clone();
        MessageHandler::new(creator, move |envelope: EventEnvelope<OrderPlaced>| {
            let recorder = recorder.clone();
            async move {
                recorder.record(envelope.into_payload());
                Ok(())
            }
        })
    }

    pub fn record(&self, payload: OrderPlaced) {
        self.received.lock().unwrap().push(payload);
        self.notify.notify_waiters();
    }

    pub fn received(&self) -> Vec<OrderPlaced> {
        self.received.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    /// Wait until at least `count` payloads arrived; returns whether they did
    pub async fn wait_for(&self, count: usize) -> bool {
        let deadline = tokio::time::Instant::now() + DELIVERY_TIMEOUT;
        loop {
            let notified = self.notify.notified();
            if self.count() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.count() >= count;
            }
        }
    }

    /// Wait until `order_id` arrived; returns whether it did
    pub async fn wait_for_order(&self, order_id: &str) -> bool {
        let deadline = tokio::time::Instant::now() + DELIVERY_TIMEOUT;
        loop {
            let notified = self.notify.notified();
            if self.received().iter().any(|o| o.order_id == order_id) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.received().iter().any(|o| o.order_id == order_id);
            }
        }
    }
}
