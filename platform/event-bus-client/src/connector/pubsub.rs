//! Pub/sub connector: one channel subscription per routing key

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
use crate::transport::PubSubTransport;
use crate::{BusMessage, BusResult, PublishMode};

/// Connector for channel-based transports
///
/// Messages travel on `{bus_id}.{tag}.{event_id}`. Delivery is fire and
/// forget: whatever is published while a channel has no subscriber is lost.
pub struct PubSubConnector {
    transport: Arc<dyn PubSubTransport>,
    channels: Mutex<BTreeMap<String, JoinHandle<()>>>,
}

impl PubSubConnector {
    pub fn new(transport: Arc<dyn PubSubTransport>) -> Self {
        Self {
            transport,
            channels: Mutex::new(BTreeMap::new()),
        }
    }

    async fn subscribe(&self, ctx: &BusContext, route: &RoutingKey) -> BusResult<JoinHandle<()>> {
        let channel = route.channel(ctx.bus_id());
        let messages = self.transport.subscribe(&channel).await?;
        tracing::debug!(channel = %channel, "subscribed to channel");
        Ok(tokio::spawn(pump(messages, route.clone(), ctx.clone())))
    }
}

/// Dispatch each message under the route its subject names
async fn pump(mut messages: BoxStream<'static, BusMessage>, route: RoutingKey, ctx: BusContext) {
    while let Some(msg) = messages.next().await {
        let Some(target) = RoutingKey::from_channel(ctx.bus_id(), &msg.subject) else {
            tracing::warn!(subject = %msg.subject, route = %route, "skipping message on foreign channel");
            continue;
        };
        ctx.dispatch(&target, msg.payload.into()).await;
    }
    tracing::debug!(route = %route, "channel subscription ended");
}

#[async_trait]
impl Connector for PubSubConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::PubSub
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
        self.transport
            .publish(&route.channel(ctx.bus_id()), payload, mode)
            .await
    }

    async fn on_handler_add(&self, ctx: &BusContext, route: &RoutingKey) -> BusResult<()> {
        let mut channels = self.channels.lock().await;
        let channel = route.channel(ctx.bus_id());
        if ctx.is_paused() || channels.contains_key(&channel) {
            return Ok(());
        }

        let pump = self.subscribe(ctx, route).await?;
        channels.insert(channel, pump);
        Ok(())
    }

    async fn on_handlers_remove(&self, ctx: &BusContext, route: &RoutingKey) -> BusResult<()> {
        let mut channels = self.channels.lock().await;
        let channel = route.channel(ctx.bus_id());
        if let Some(pump) = channels.remove(&channel) {
            stop_task(pump).await;
            tracing::debug!(channel = %channel, "unsubscribed from channel");
        }
        Ok(())
    }

    async fn on_pause(&self, _ctx: &BusContext) -> BusResult<()> {
        let drained = std::mem::take(&mut *self.channels.lock().await);
        for (_, pump) in drained {
            stop_task(pump).await;
        }
        Ok(())
    }

    async fn on_resume(&self, ctx: &BusContext) -> BusResult<()> {
        let mut channels = self.channels.lock().await;
        for route in ctx.registry().routes() {
            let channel = route.channel(ctx.bus_id());
            if channels.contains_key(&channel) {
                continue;
            }
            let pump = self.subscribe(ctx, &route).await?;
            channels.insert(channel, pump);
        }
        Ok(())
    }

    async fn native_subscriptions(&self) -> Vec<String> {
        self.channels.lock().await.keys().cloned().collect()
    }

    async fn close(&self) {
        let drained = std::mem::take(&mut *self.channels.lock().await);
        for (_, pump) in drained {
            stop_task(pump).await;
        }
        self.transport.close().await;
    }
}

impl Drop for PubSubConnector {
    fn drop(&mut self) {
        for pump in self.channels.get_mut().values() {
            pump.abort();
        }
    }
}
