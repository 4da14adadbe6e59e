//! Delivery guarantees specific to each connector family

mod common;

use async_trait::async_trait;
use common::{order, OrderPlaced, Recorder, QUIET_PERIOD};
use event_bus_client::{
    BusError, BusResult, ClientOptions, EventBusClient, HandlerFailure, InMemoryLog,
    InMemoryQueue, JsonSerializer, LogRecord, LogTransport, MessageHandler, MessageTag,
    PublishMode, QueueDelivery, QueueTransport,
};
use futures::stream::BoxStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn queue_client(broker: &InMemoryQueue, app_id: &str) -> EventBusClient {
    EventBusClient::queue("orders", app_id, JsonSerializer, Arc::new(broker.attach()))
}

fn log_client(broker: &InMemoryLog, app_id: &str) -> EventBusClient {
    EventBusClient::partitioned_log("orders", app_id, JsonSerializer, Arc::new(broker.attach()))
        .with_options(ClientOptions {
            poll_interval: Duration::from_millis(10),
            ..ClientOptions::default()
        })
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_queue_redelivers_after_handler_failure() {
    let broker = InMemoryQueue::new();
    let client = queue_client(&broker, "billing");
    let attempts = Arc::new(AtomicUsize::new(0));

    let seen = attempts.clone();
    client
        .add_handler(MessageHandler::<OrderPlaced>::new("flaky", move |_| {
            let attempt = seen.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt == 1 {
                    return Err::<(), HandlerFailure>("first attempt fails".into());
                }
                Ok(())
            }
        }))
        .await
        .unwrap();

    client.publish_message(&order("o-1", 100)).await.unwrap();

    assert!(eventually(|| attempts.load(Ordering::SeqCst) == 1).await);
    assert!(eventually(|| broker.unacked_count("data") == 1).await);

    broker.recover();

    assert!(eventually(|| attempts.load(Ordering::SeqCst) == 2).await);
    assert!(eventually(|| broker.unacked_count("data") == 0 && broker.ready_count("data") == 0).await);

    client.dispose().await;
}

#[tokio::test]
async fn test_queue_holds_messages_published_while_paused() {
    let broker = InMemoryQueue::new();
    let client = queue_client(&broker, "billing");
    let recorder = Recorder::new();
    client.add_handler(recorder.handler("svc-a")).await.unwrap();

    client.pause().await.unwrap();
    client.publish_message(&order("held", 1)).await.unwrap();
    tokio::time::sleep(QUIET_PERIOD).await;
    assert_eq!(recorder.count(), 0);
    assert_eq!(broker.ready_count("data"), 1);

    client.resume().await.unwrap();
    assert!(recorder.wait_for_order("held").await);

    client.dispose().await;
}

#[tokio::test]
async fn test_queue_instances_of_one_application_compete() {
    let broker = InMemoryQueue::new();
    let first = queue_client(&broker, "billing");
    let second = queue_client(&broker, "billing");
    let first_seen = Recorder::new();
    let second_seen = Recorder::new();
    first.add_handler(first_seen.handler("billing")).await.unwrap();
    second.add_handler(second_seen.handler("billing")).await.unwrap();
    assert_eq!(broker.consumer_count("data"), 2);

    for i in 0..4 {
        first.publish_message(&order(&format!("o-{i}"), i)).await.unwrap();
    }

    assert!(eventually(|| first_seen.count() + second_seen.count() == 4).await);
    tokio::time::sleep(QUIET_PERIOD).await;
    assert_eq!(first_seen.count() + second_seen.count(), 4);
    assert_eq!(first_seen.count(), 2);

    first.dispose().await;
    second.dispose().await;
}

#[tokio::test]
async fn test_queue_bind_failure_rolls_back_registration() {
    let broker = InMemoryQueue::new();
    let client = queue_client(&broker, "billing");
    broker.reject_bindings(true);

    let err = client
        .add_handler(Recorder::new().handler("svc-a"))
        .await
        .unwrap_err();

    assert!(err.is_transport(), "{err}");
    assert_eq!(client.handler_count(), 0);
    assert!(client.native_subscriptions().await.is_empty());
    assert_eq!(broker.consumer_count("data"), 0);

    broker.reject_bindings(false);
    client.add_handler(Recorder::new().handler("svc-a")).await.unwrap();
    assert_eq!(broker.bindings("data", "orders"), vec!["orderplaced"]);

    client.dispose().await;
}

#[tokio::test]
async fn test_queue_removal_failure_restores_handlers() {
    let broker = InMemoryQueue::new();
    let client = queue_client(&broker, "billing");
    client.add_handler(Recorder::new().handler("svc-a")).await.unwrap();

    broker.set_reachable(false);
    let err = client
        .remove_handlers("orderplaced", MessageTag::Data, None)
        .await
        .unwrap_err();

    assert!(matches!(err, BusError::ConnectionError(_)), "{err}");
    assert_eq!(client.handler_count(), 1);

    broker.set_reachable(true);
    client.dispose().await;
}

/// Log whose connection drops on demand; reconnecting stalls, then fails
struct FlakyLog {
    inner: InMemoryLog,
    down: AtomicBool,
}

impl FlakyLog {
    fn new(broker: &InMemoryLog) -> Self {
        Self {
            inner: broker.attach(),
            down: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl LogTransport for FlakyLog {
    async fn connect(&self, group_id: &str) -> BusResult<()> {
        if self.down.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Err(BusError::ConnectionError("log broker is down".to_string()));
        }
        self.inner.connect(group_id).await
    }

    fn is_connected(&self) -> bool {
        !self.down.load(Ordering::SeqCst) && self.inner.is_connected()
    }

    async fn produce(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
        mode: PublishMode,
    ) -> BusResult<()> {
        self.inner.produce(topic, key, payload, mode).await
    }

    async fn subscribe(&self, topics: &[String]) -> BusResult<()> {
        self.inner.subscribe(topics).await
    }

    async fn unsubscribe(&self) -> BusResult<()> {
        self.inner.unsubscribe().await
    }

    fn subscription(&self) -> Vec<String> {
        self.inner.subscription()
    }

    async fn poll(&self, timeout: Duration) -> BusResult<Vec<LogRecord>> {
        self.inner.poll(timeout).await
    }

    async fn rewind(&self, delivered: usize) -> BusResult<()> {
        self.inner.rewind(delivered).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

/// Queue broker that binds fine but refuses consumers and unbinds
struct NoConsumerQueue {
    inner: InMemoryQueue,
}

#[async_trait]
impl QueueTransport for NoConsumerQueue {
    async fn connect(&self, app_id: &str) -> BusResult<()> {
        self.inner.connect(app_id).await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn declare_exchange(&self, exchange: &str) -> BusResult<()> {
        self.inner.declare_exchange(exchange).await
    }

    async fn declare_queue(&self, queue: &str) -> BusResult<()> {
        self.inner.declare_queue(queue).await
    }

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()> {
        self.inner.bind(queue, exchange, routing_key).await
    }

    async fn unbind(&self, _queue: &str, _exchange: &str, _routing_key: &str) -> BusResult<()> {
        Err(BusError::SubscribeError("unbind refused".to_string()))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        mode: PublishMode,
    ) -> BusResult<()> {
        self.inner.publish(exchange, routing_key, payload, mode).await
    }

    async fn consume(&self, _queue: &str) -> BusResult<(String, BoxStream<'static, QueueDelivery>)> {
        Err(BusError::SubscribeError("consumer limit reached".to_string()))
    }

    async fn cancel(&self, consumer_tag: &str) -> BusResult<()> {
        self.inner.cancel(consumer_tag).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

#[tokio::test]
async fn test_queue_consumer_failure_reports_consume_error_when_unbind_fails() {
    let broker = InMemoryQueue::new();
    let client = EventBusClient::queue(
        "orders",
        "billing",
        JsonSerializer,
        Arc::new(NoConsumerQueue {
            inner: broker.attach(),
        }),
    );

    let err = client
        .add_handler(Recorder::new().handler("svc-a"))
        .await
        .unwrap_err();

    assert!(
        matches!(&err, BusError::SubscribeError(m) if m.contains("consumer limit")),
        "{err}"
    );
    assert_eq!(client.handler_count(), 0);
    assert!(client.native_subscriptions().await.is_empty());

    client.dispose().await;
}

#[tokio::test]
async fn test_log_keeps_delivering_after_failed_removal_is_rolled_back() {
    let broker = InMemoryLog::new();
    let transport = Arc::new(FlakyLog::new(&broker));
    let client =
        EventBusClient::partitioned_log("orders", "billing", JsonSerializer, transport.clone())
            .with_options(ClientOptions {
                poll_interval: Duration::from_millis(10),
                ..ClientOptions::default()
            });
    let recorder = Recorder::new();
    client.add_handler(recorder.handler("svc-a")).await.unwrap();

    transport.down.store(true, Ordering::SeqCst);
    let err = client
        .remove_handlers("orderplaced", MessageTag::Data, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::ConnectionError(_)), "{err}");
    assert_eq!(client.handler_count(), 1);
    assert_eq!(client.native_subscriptions().await, vec!["data"]);

    transport.down.store(false, Ordering::SeqCst);
    client.publish_message(&order("after-rollback", 7)).await.unwrap();
    assert!(recorder.wait_for_order("after-rollback").await);

    client.dispose().await;
}

#[tokio::test]
async fn test_log_delivers_records_from_paused_period_after_resume() {
    let broker = InMemoryLog::new();
    let client = log_client(&broker, "billing");
    let recorder = Recorder::new();
    client.add_handler(recorder.handler("svc-a")).await.unwrap();

    client.pause().await.unwrap();
    client.publish_message(&order("while-paused", 1)).await.unwrap();
    tokio::time::sleep(QUIET_PERIOD).await;
    assert_eq!(recorder.count(), 0);
    assert_eq!(broker.topic_len("data"), 1);

    client.resume().await.unwrap();
    client.publish_message(&order("after-resume", 2)).await.unwrap();

    assert!(recorder.wait_for_order("after-resume").await);
    assert!(recorder.wait_for_order("while-paused").await);

    client.dispose().await;
}

#[tokio::test]
async fn test_log_instances_of_one_application_share_records() {
    let broker = InMemoryLog::new();
    let first = log_client(&broker, "billing");
    let second = log_client(&broker, "billing");
    let first_seen = Recorder::new();
    let second_seen = Recorder::new();
    first.add_handler(first_seen.handler("billing")).await.unwrap();
    second.add_handler(second_seen.handler("billing")).await.unwrap();

    first.publish_message(&order("o-1", 1)).await.unwrap();

    assert!(eventually(|| first_seen.count() + second_seen.count() == 1).await);
    tokio::time::sleep(QUIET_PERIOD).await;
    assert_eq!(first_seen.count() + second_seen.count(), 1);

    first.dispose().await;
    second.dispose().await;
}

#[tokio::test]
async fn test_log_ignores_records_before_first_subscription() {
    let broker = InMemoryLog::new();
    let publisher = log_client(&broker, "publisher");
    publisher.publish_message(&order("early", 1)).await.unwrap();

    let client = log_client(&broker, "billing");
    let recorder = Recorder::new();
    client.add_handler(recorder.handler("svc-a")).await.unwrap();
    publisher.publish_message(&order("late", 2)).await.unwrap();

    assert!(recorder.wait_for_order("late").await);
    assert!(recorder.received().iter().all(|o| o.order_id != "early"));

    publisher.dispose().await;
    client.dispose().await;
}
