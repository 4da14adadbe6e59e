//! Partitioned-log connector: tag-named topics read by a background poll loop

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{stop_task, Connector};
use crate::config::ConnectorKind;
use crate::dispatch::{BusContext, DispatchOutcome};
use crate::envelope::RoutingKey;
use crate::transport::LogTransport;
use crate::{BusResult, PublishMode};

#[derive(Default)]
struct LogState {
    /// Topics the registry needs, in order of first use
    topics: Vec<String>,
    poller: Option<JoinHandle<()>>,
}

/// Connector for append-log transports
///
/// A message of tag `t` and event id `e` is produced to topic `t` with record
/// key `e`. The consumer group is the application id, so instances of one
/// application share the work while different applications each see every
/// record.
pub struct PartitionedLogConnector {
    transport: Arc<dyn LogTransport>,
    state: Arc<Mutex<LogState>>,
}

impl PartitionedLogConnector {
    pub fn new(transport: Arc<dyn LogTransport>) -> Self {
        Self {
            transport,
            state: Arc::new(Mutex::new(LogState::default())),
        }
    }

    /// Start the poll loop unless one is already running
    fn ensure_poller(&self, ctx: &BusContext, state: &mut LogState) {
        if state.poller.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let handle = tokio::spawn(poll_loop(
            self.transport.clone(),
            Arc::downgrade(&self.state),
            ctx.clone(),
        ));
        state.poller = Some(handle);
    }
}

/// Poll the log while the client is active and subscribed to any topic
///
/// The exit decision is taken under the state lock and clears `poller`, so
/// `ensure_poller` never mistakes an exiting loop for a running one. On exit
/// the last batch is settled: records a pause cut off go back to the group.
async fn poll_loop(transport: Arc<dyn LogTransport>, state: Weak<Mutex<LogState>>, ctx: BusContext) {
    tracing::debug!(bus_id = %ctx.bus_id(), "log poll loop started");

    // records of the last batch that reached the handlers (or were skipped)
    let mut handled = 0;
    loop {
        {
            let Some(state) = state.upgrade() else {
                break;
            };
            let mut guard = state.lock().await;
            if ctx.is_paused() || guard.topics.is_empty() {
                if let Err(e) = transport.rewind(handled).await {
                    tracing::warn!(bus_id = %ctx.bus_id(), error = %e, "failed to settle last log batch");
                }
                guard.poller = None;
                break;
            }
        }

        handled = 0;
        match transport.poll(ctx.poll_interval()).await {
            Ok(records) => {
                for record in records {
                    let Some(route) = RoutingKey::parse(&record.topic, &record.key) else {
                        tracing::warn!(topic = %record.topic, key = %record.key, "skipping record with unroutable topic");
                        handled += 1;
                        continue;
                    };
                    if let DispatchOutcome::Paused = ctx.dispatch(&route, record.payload.into()).await {
                        break;
                    }
                    handled += 1;
                }
            }
            Err(e) => {
                tracing::error!(bus_id = %ctx.bus_id(), error = %e, "log poll failed");
                tokio::time::sleep(ctx.poll_interval()).await;
            }
        }
    }

    tracing::debug!(bus_id = %ctx.bus_id(), "log poll loop stopped");
}

#[async_trait]
impl Connector for PartitionedLogConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Log
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
        _ctx: &BusContext,
        route: &RoutingKey,
        payload: Vec<u8>,
        mode: PublishMode,
    ) -> BusResult<()> {
        self.transport
            .produce(route.tag().as_str(), route.event_id().as_str(), payload, mode)
            .await
    }

    async fn on_handler_add(&self, ctx: &BusContext, route: &RoutingKey) -> BusResult<()> {
        let mut state = self.state.lock().await;
        if ctx.is_paused() {
            // Resume subscribes to whatever the registry holds by then
            return Ok(());
        }

        let topic = route.tag().as_str().to_string();
        if !state.topics.contains(&topic) {
            state.topics.push(topic.clone());
            if let Err(e) = self.transport.subscribe(&state.topics).await {
                state.topics.retain(|t| t != &topic);
                return Err(e);
            }
            tracing::debug!(topic = %topic, topics = ?state.topics, "subscribed to log topic");
        }

        self.ensure_poller(ctx, &mut state);
        Ok(())
    }

    async fn on_handlers_remove(&self, ctx: &BusContext, route: &RoutingKey) -> BusResult<()> {
        let mut state = self.state.lock().await;
        if ctx.registry().contains_tag(route.tag()) {
            return Ok(());
        }

        let topic = route.tag().as_str().to_string();
        let Some(position) = state.topics.iter().position(|t| t == &topic) else {
            return Ok(());
        };
        state.topics.remove(position);

        if !ctx.is_paused() {
            let result = if state.topics.is_empty() {
                self.transport.unsubscribe().await
            } else {
                self.transport.subscribe(&state.topics).await
            };
            if let Err(e) = result {
                state.topics.insert(position, topic);
                return Err(e);
            }
        }

        tracing::debug!(topic = %topic, "dropped log topic");
        Ok(())
    }

    async fn on_pause(&self, _ctx: &BusContext) -> BusResult<()> {
        let _state = self.state.lock().await;
        if !self.transport.subscription().is_empty() {
            self.transport.unsubscribe().await?;
        }
        Ok(())
    }

    async fn on_resume(&self, ctx: &BusContext) -> BusResult<()> {
        let mut state = self.state.lock().await;
        state.topics = ctx
            .registry()
            .tags()
            .into_iter()
            .map(|tag| tag.as_str().to_string())
            .collect();

        if state.topics.is_empty() {
            return Ok(());
        }

        self.transport.subscribe(&state.topics).await?;
        self.ensure_poller(ctx, &mut state);
        Ok(())
    }

    async fn native_subscriptions(&self) -> Vec<String> {
        self.transport.subscription()
    }

    async fn close(&self) {
        let poller = {
            let mut state = self.state.lock().await;
            state.topics.clear();
            state.poller.take()
        };
        if let Some(poller) = poller {
            stop_task(poller).await;
        }
        self.transport.close().await;
    }
}

impl Drop for PartitionedLogConnector {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.try_lock() {
            if let Some(poller) = state.poller.take() {
                poller.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{MessageHandler, Registration};
    use crate::messages::LogMessage;
    use crate::registry::HandlerRegistry;
    use crate::serializer::{JsonSerializer, Serializer};
    use crate::transport::InMemoryLog;
    use crate::{EventEnvelope, LogSeverity};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn context() -> BusContext {
        BusContext::new(
            "orders",
            "billing",
            Arc::new(HandlerRegistry::new()),
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn register(ctx: &BusContext, creator: &str) -> Arc<Registration> {
        let handler = MessageHandler::<LogMessage>::new(creator, |_| async { Ok(()) });
        let registration = Arc::new(Registration::bind(handler, Arc::new(JsonSerializer)));
        ctx.registry().add(registration.clone());
        registration
    }

    #[tokio::test]
    async fn test_topics_follow_handlers() {
        let ctx = context();
        let connector = PartitionedLogConnector::new(Arc::new(InMemoryLog::new()));
        connector.connect(&ctx).await.unwrap();
        let route = RoutingKey::of::<LogMessage>();

        let first = register(&ctx, "a");
        connector.on_handler_add(&ctx, &route).await.unwrap();
        register(&ctx, "b");
        connector.on_handler_add(&ctx, &route).await.unwrap();
        assert_eq!(connector.native_subscriptions().await, vec!["log"]);

        ctx.registry().remove_entry(&first);
        connector.on_handlers_remove(&ctx, &route).await.unwrap();
        assert_eq!(connector.native_subscriptions().await, vec!["log"]);

        ctx.registry().clear();
        connector.on_handlers_remove(&ctx, &route).await.unwrap();
        assert!(connector.native_subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn test_pause_and_resume_are_idempotent() {
        let ctx = context();
        let connector = PartitionedLogConnector::new(Arc::new(InMemoryLog::new()));
        connector.connect(&ctx).await.unwrap();
        register(&ctx, "a");
        connector
            .on_handler_add(&ctx, &RoutingKey::of::<LogMessage>())
            .await
            .unwrap();

        ctx.set_paused(true);
        connector.on_pause(&ctx).await.unwrap();
        connector.on_pause(&ctx).await.unwrap();
        assert!(connector.native_subscriptions().await.is_empty());

        ctx.set_paused(false);
        connector.on_resume(&ctx).await.unwrap();
        connector.on_resume(&ctx).await.unwrap();
        assert_eq!(connector.native_subscriptions().await, vec!["log"]);

        connector.close().await;
    }

    #[tokio::test]
    async fn test_poll_loop_stops_when_last_topic_is_dropped() {
        let ctx = context();
        let connector = PartitionedLogConnector::new(Arc::new(InMemoryLog::new()));
        connector.connect(&ctx).await.unwrap();
        let route = RoutingKey::of::<LogMessage>();
        register(&ctx, "a");
        connector.on_handler_add(&ctx, &route).await.unwrap();

        ctx.registry().clear();
        tokio::time::sleep(ctx.poll_interval() * 3).await;
        assert!(
            connector.state.lock().await.poller.is_some(),
            "an uncommitted removal must not stop the poll loop"
        );

        connector.on_handlers_remove(&ctx, &route).await.unwrap();
        tokio::time::sleep(ctx.poll_interval() * 3).await;
        assert!(connector.state.lock().await.poller.is_none());
    }

    #[tokio::test]
    async fn test_records_cut_off_by_pause_are_returned_to_the_group() {
        let ctx = context();
        let log = InMemoryLog::new();
        let connector = PartitionedLogConnector::new(Arc::new(log.attach()));
        connector.connect(&ctx).await.unwrap();
        let route = RoutingKey::of::<LogMessage>();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let pause_flag = ctx.clone();
        let handler = MessageHandler::<LogMessage>::new("a", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            pause_flag.set_paused(true);
            async { Ok(()) }
        });
        ctx.registry()
            .add(Arc::new(Registration::bind(handler, Arc::new(JsonSerializer))));
        connector.on_handler_add(&ctx, &route).await.unwrap();

        let producer = log.attach();
        producer.connect("producer").await.unwrap();
        let payload = JsonSerializer
            .encode(&EventEnvelope::new(LogMessage::new(LogSeverity::Info, "m")))
            .unwrap();
        for _ in 0..3 {
            producer
                .produce("log", "logmessage", payload.clone(), PublishMode::Confirmed)
                .await
                .unwrap();
        }

        tokio::time::sleep(ctx.poll_interval() * 3).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(connector.state.lock().await.poller.is_none());

        ctx.set_paused(false);
        connector.on_resume(&ctx).await.unwrap();
        tokio::time::sleep(ctx.poll_interval() * 3).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        connector.close().await;
    }
}
