//! Queue connector: one durable queue per tag, bound by event id

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{stop_task, Connector};
use crate::config::ConnectorKind;
use crate::dispatch::BusContext;
use crate::envelope::RoutingKey;
use crate::transport::{QueueDelivery, QueueTransport};
use crate::{BusResult, PublishMode};

struct ActiveConsumer {
    consumer_tag: String,
    pump: JoinHandle<()>,
}

/// Connector for routing-broker transports
///
/// The exchange is the bus id, the queue is the tag and the binding key is
/// the event id. A delivery is acknowledged only after every matched handler
/// has completed without error; otherwise it stays unacked and the broker
/// redelivers it.
pub struct QueueConnector {
    transport: Arc<dyn QueueTransport>,
    /// Queue name to its consumer; `None` while paused
    queues: Mutex<BTreeMap<String, Option<ActiveConsumer>>>,
}

impl QueueConnector {
    pub fn new(transport: Arc<dyn QueueTransport>) -> Self {
        Self {
            transport,
            queues: Mutex::new(BTreeMap::new()),
        }
    }

    async fn declare_and_bind(&self, ctx: &BusContext, route: &RoutingKey) -> BusResult<()> {
        let queue = route.tag().as_str();
        self.transport.declare_exchange(ctx.bus_id()).await?;
        self.transport.declare_queue(queue).await?;
        self.transport
            .bind(queue, ctx.bus_id(), route.event_id().as_str())
            .await
    }

    async fn start_consumer(&self, ctx: &BusContext, queue: &str) -> BusResult<ActiveConsumer> {
        let (consumer_tag, deliveries) = self.transport.consume(queue).await?;
        let pump = tokio::spawn(pump(deliveries, ctx.clone()));
        tracing::debug!(queue = %queue, consumer_tag = %consumer_tag, "queue consumer started");
        Ok(ActiveConsumer { consumer_tag, pump })
    }

    async fn stop_consumer(&self, queue: &str, consumer: ActiveConsumer) {
        stop_task(consumer.pump).await;
        if let Err(e) = self.transport.cancel(&consumer.consumer_tag).await {
            tracing::warn!(queue = %queue, consumer_tag = %consumer.consumer_tag, error = %e, "failed to cancel queue consumer");
        } else {
            tracing::debug!(queue = %queue, consumer_tag = %consumer.consumer_tag, "queue consumer cancelled");
        }
    }
}

/// Deliver each queue message and ack it once its handlers have all succeeded
async fn pump(mut deliveries: BoxStream<'static, QueueDelivery>, ctx: BusContext) {
    while let Some(delivery) = deliveries.next().await {
        let Some(route) = RoutingKey::parse(&delivery.queue, &delivery.routing_key) else {
            tracing::warn!(queue = %delivery.queue, routing_key = %delivery.routing_key, "acking unroutable queue message");
            if let Err(e) = delivery.ack().await {
                tracing::warn!(error = %e, "failed to ack unroutable message");
            }
            continue;
        };

        let outcome = ctx.dispatch(&route, delivery.payload.as_slice().into()).await;
        if outcome.should_ack() {
            if let Err(e) = delivery.ack().await {
                tracing::error!(route = %route, error = %e, "failed to ack queue message");
            }
        } else {
            tracing::debug!(route = %route, redelivered = delivery.redelivered, outcome = ?outcome, "withholding ack");
        }
    }
}

#[async_trait]
impl Connector for QueueConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Queue
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    async fn connect(&self, ctx: &BusContext) -> BusResult<()> {
        if self.transport.is_connected() {
            return Ok(());
        }
        self.transport.connect(ctx.application_id()).await
    }

    async fn publish(
        &self,
        ctx: &BusContext,
        route: &RoutingKey,
        payload: Vec<u8>,
        mode: PublishMode,
    ) -> BusResult<()> {
        self.declare_and_bind(ctx, route).await?;
        self.transport
            .publish(ctx.bus_id(), route.event_id().as_str(), payload, mode)
            .await
    }

    async fn on_handler_add(&self, ctx: &BusContext, route: &RoutingKey) -> BusResult<()> {
        let mut queues = self.queues.lock().await;
        let queue = route.tag().as_str();
        let shared_route = ctx.registry().matching(route).len() > 1;

        self.declare_and_bind(ctx, route).await?;

        let entry = queues.entry(queue.to_string()).or_insert(None);
        if entry.is_none() && !ctx.is_paused() {
            match self.start_consumer(ctx, queue).await {
                Ok(consumer) => *entry = Some(consumer),
                Err(e) => {
                    queues.remove(queue);
                    if !shared_route {
                        let routing_key = route.event_id().as_str();
                        let undone = self.transport.unbind(queue, ctx.bus_id(), routing_key).await;
                        if let Err(undo) = undone {
                            tracing::warn!(
                                bus_id = %ctx.bus_id(),
                                queue = %queue,
                                routing_key = %routing_key,
                                error = %undo,
                                "failed to undo binding after consumer start failed"
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn on_handlers_remove(&self, ctx: &BusContext, route: &RoutingKey) -> BusResult<()> {
        let mut queues = self.queues.lock().await;
        let queue = route.tag().as_str();

        self.transport
            .unbind(queue, ctx.bus_id(), route.event_id().as_str())
            .await?;
        tracing::debug!(queue = %queue, route = %route, "unbound routing key");

        if ctx.registry().contains_tag(route.tag()) {
            return Ok(());
        }
        if let Some(Some(consumer)) = queues.remove(queue) {
            self.stop_consumer(queue, consumer).await;
        }
        Ok(())
    }

    async fn on_pause(&self, _ctx: &BusContext) -> BusResult<()> {
        let mut queues = self.queues.lock().await;
        for (queue, slot) in queues.iter_mut() {
            if let Some(consumer) = slot.take() {
                self.stop_consumer(queue, consumer).await;
            }
        }
        Ok(())
    }

    async fn on_resume(&self, ctx: &BusContext) -> BusResult<()> {
        let mut queues = self.queues.lock().await;
        for tag in ctx.registry().tags() {
            queues.entry(tag.as_str().to_string()).or_insert(None);
        }

        for (queue, slot) in queues.iter_mut() {
            if slot.is_none() {
                *slot = Some(self.start_consumer(ctx, queue).await?);
            }
        }
        Ok(())
    }

    async fn native_subscriptions(&self) -> Vec<String> {
        self.queues
            .lock()
            .await
            .iter()
            .filter_map(|(queue, slot)| slot.as_ref().map(|_| queue.clone()))
            .collect()
    }

    async fn close(&self) {
        let drained: Vec<_> = std::mem::take(&mut *self.queues.lock().await)
            .into_iter()
            .collect();
        for (queue, slot) in drained {
            if let Some(consumer) = slot {
                self.stop_consumer(&queue, consumer).await;
            }
        }
        self.transport.close().await;
    }
}

impl Drop for QueueConnector {
    fn drop(&mut self) {
        for consumer in self.queues.get_mut().values().flatten() {
            consumer.pump.abort();
        }
    }
}
