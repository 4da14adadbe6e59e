//! The event bus client: lifecycle, validation and handler bookkeeping

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::{BusConfig, BusType, ConnectorKind};
use crate::connector::{Connector, PartitionedLogConnector, PubSubConnector, QueueConnector};
use crate::dispatch::{BusContext, DEFAULT_POLL_INTERVAL};
use crate::envelope::{EventEnvelope, EventId, MessageKind, MessageTag, RoutingKey};
use crate::handler::{MessageHandler, Registration};
use crate::registry::HandlerRegistry;
use crate::serializer::{JsonSerializer, Serializer};
use crate::transport::{
    InMemoryBus, InMemoryLog, InMemoryQueue, JetStreamLog, JetStreamQueue, LogTransport, NatsBus,
    PubSubTransport, QueueTransport,
};
use crate::{BusError, BusResult, PublishMode};

/// What to do when a handler is added for a routing key and creator that
/// already have one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Keep both; each is invoked for every matching message
    #[default]
    Allow,
    /// Fail the second registration with a `ValidationError`
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    pub duplicate_policy: DuplicatePolicy,
    /// Wait between polls of a partitioned log
    pub poll_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            duplicate_policy: DuplicatePolicy::Allow,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Broker-agnostic publish/subscribe client
///
/// The connector is chosen once, at construction. Every operation validates
/// its input before touching the network, and every operation that needs the
/// broker connects first, failing with [`BusError::ConnectionError`] if that
/// is not possible.
///
/// Handler additions and removals, pause and resume are serialized by an
/// internal lock that covers subscription bookkeeping only; message delivery
/// never waits on it.
pub struct EventBusClient<S: Serializer = JsonSerializer> {
    context: BusContext,
    serializer: Arc<S>,
    connector: Box<dyn Connector>,
    lifecycle: Mutex<()>,
    disposed: AtomicBool,
    options: ClientOptions,
}

impl<S: Serializer> EventBusClient<S> {
    /// Build a client around any connector
    ///
    /// `bus_id` and `application_id` are lower-cased.
    pub fn new(
        bus_id: impl Into<String>,
        application_id: impl Into<String>,
        serializer: S,
        connector: impl Connector + 'static,
        options: ClientOptions,
    ) -> Self {
        Self::assemble(bus_id, application_id, serializer, Box::new(connector), options)
    }

    fn assemble(
        bus_id: impl Into<String>,
        application_id: impl Into<String>,
        serializer: S,
        connector: Box<dyn Connector>,
        options: ClientOptions,
    ) -> Self {
        let context = BusContext::new(
            bus_id,
            application_id,
            Arc::new(HandlerRegistry::new()),
            Arc::new(AtomicBool::new(false)),
        )
        .with_poll_interval(options.poll_interval);

        Self {
            context,
            serializer: Arc::new(serializer),
            connector,
            lifecycle: Mutex::new(()),
            disposed: AtomicBool::new(false),
            options,
        }
    }

    /// Client over a partitioned append log
    pub fn partitioned_log(
        bus_id: impl Into<String>,
        application_id: impl Into<String>,
        serializer: S,
        transport: Arc<dyn LogTransport>,
    ) -> Self {
        Self::new(
            bus_id,
            application_id,
            serializer,
            PartitionedLogConnector::new(transport),
            ClientOptions::default(),
        )
    }

    /// Client over a routing broker with durable queues
    pub fn queue(
        bus_id: impl Into<String>,
        application_id: impl Into<String>,
        serializer: S,
        transport: Arc<dyn QueueTransport>,
    ) -> Self {
        Self::new(
            bus_id,
            application_id,
            serializer,
            QueueConnector::new(transport),
            ClientOptions::default(),
        )
    }

    /// Client over channel pub/sub
    pub fn pubsub(
        bus_id: impl Into<String>,
        application_id: impl Into<String>,
        serializer: S,
        transport: Arc<dyn PubSubTransport>,
    ) -> Self {
        Self::new(
            bus_id,
            application_id,
            serializer,
            PubSubConnector::new(transport),
            ClientOptions::default(),
        )
    }

    /// Build the connector and transport named by `config`
    ///
    /// In-memory transports created here are private to this client; share
    /// one across clients by constructing them with `attach()` instead.
    pub fn from_config(config: &BusConfig, serializer: S) -> Self {
        let connector: Box<dyn Connector> = match (config.connector, config.bus_type) {
            (ConnectorKind::Log, BusType::InMemory) => {
                Box::new(PartitionedLogConnector::new(Arc::new(InMemoryLog::new())))
            }
            (ConnectorKind::Log, BusType::Nats) => Box::new(PartitionedLogConnector::new(
                Arc::new(JetStreamLog::new(config.nats_endpoint())),
            )),
            (ConnectorKind::Queue, BusType::InMemory) => {
                Box::new(QueueConnector::new(Arc::new(InMemoryQueue::new())))
            }
            (ConnectorKind::Queue, BusType::Nats) => Box::new(QueueConnector::new(Arc::new(
                JetStreamQueue::new(config.nats_endpoint()),
            ))),
            (ConnectorKind::PubSub, BusType::InMemory) => {
                Box::new(PubSubConnector::new(Arc::new(InMemoryBus::new())))
            }
            (ConnectorKind::PubSub, BusType::Nats) => Box::new(PubSubConnector::new(Arc::new(
                NatsBus::with_endpoint(config.nats_endpoint()),
            ))),
        };

        tracing::info!(
            bus_id = %config.bus_id,
            app_id = %config.app_id,
            connector = %config.connector,
            bus_type = ?config.bus_type,
            "event bus client configured"
        );

        Self::assemble(
            config.bus_id.clone(),
            config.app_id.clone(),
            serializer,
            connector,
            config.client_options(),
        )
    }

    /// Replace the options of a client that has not connected yet
    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.context = self.context.with_poll_interval(options.poll_interval);
        self.options = options;
        self
    }

    pub fn bus_id(&self) -> &str {
        self.context.bus_id()
    }

    pub fn application_id(&self) -> &str {
        self.context.application_id()
    }

    pub fn connector_kind(&self) -> ConnectorKind {
        self.connector.kind()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn is_connected(&self) -> bool {
        self.connector.is_connected()
    }

    pub fn is_paused(&self) -> bool {
        self.context.is_paused()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn handler_count(&self) -> usize {
        self.context.registry().len()
    }

    /// Distinct routing keys with at least one handler
    pub fn routes(&self) -> Vec<RoutingKey> {
        self.context.registry().routes()
    }

    /// Native subscriptions the connector currently holds
    pub async fn native_subscriptions(&self) -> Vec<String> {
        self.connector.native_subscriptions().await
    }

    fn ensure_live(&self) -> BusResult<()> {
        if self.is_disposed() {
            return Err(BusError::Disposed);
        }
        Ok(())
    }

    /// Open the native handles if needed; idempotent
    pub async fn connect(&self) -> bool {
        if self.is_disposed() {
            return false;
        }
        if self.connector.is_connected() {
            return true;
        }

        match self.connector.connect(&self.context).await {
            Ok(()) => {
                tracing::info!(
                    bus_id = %self.bus_id(),
                    app_id = %self.application_id(),
                    connector = %self.connector.kind(),
                    "event bus connected"
                );
                true
            }
            Err(e) => {
                tracing::warn!(
                    bus_id = %self.bus_id(),
                    connector = %self.connector.kind(),
                    error = %e,
                    "event bus connection failed"
                );
                false
            }
        }
    }

    async fn ensure_connected(&self) -> BusResult<()> {
        if self.connect().await {
            Ok(())
        } else {
            Err(BusError::ConnectionError(format!(
                "can't connect {} connector for bus '{}' as '{}'",
                self.connector.kind(),
                self.bus_id(),
                self.application_id()
            )))
        }
    }

    async fn publish_with(
        &self,
        message: &EventEnvelope<impl MessageKind>,
        mode: PublishMode,
    ) -> BusResult<()> {
        self.ensure_live()?;
        message.validate()?;
        let payload = self.serializer.encode(message)?;
        self.ensure_connected().await?;

        let route = message.route();
        self.connector
            .publish(&self.context, &route, payload, mode)
            .await
            .map_err(|e| {
                tracing::error!(route = %route, message_id = %message.message_id(), error = %e, "failed to publish message");
                e
            })
    }

    /// Publish and wait for the broker to confirm it
    pub async fn publish_message<T: MessageKind>(&self, message: &EventEnvelope<T>) -> BusResult<()> {
        self.publish_with(message, PublishMode::Confirmed).await
    }

    /// Publish without waiting for a broker confirmation
    pub async fn publish_message_nowait<T: MessageKind>(
        &self,
        message: &EventEnvelope<T>,
    ) -> BusResult<()> {
        self.publish_with(message, PublishMode::FireAndForget).await
    }

    /// Register a handler and make sure its routing key is subscribed
    ///
    /// On failure the registry is left exactly as it was.
    pub async fn add_handler<T: MessageKind>(&self, handler: MessageHandler<T>) -> BusResult<()> {
        self.ensure_live()?;
        handler.validate()?;

        let _lifecycle = self.lifecycle.lock().await;
        let route = handler.route().clone();
        let registry = self.context.registry();

        if self.options.duplicate_policy == DuplicatePolicy::Reject
            && registry.contains(&route, handler.creator_id())
        {
            return Err(BusError::ValidationError(format!(
                "can't add handler for {} from '{}': one is already registered",
                route,
                handler.creator_id()
            )));
        }

        self.ensure_connected().await?;

        let registration = Arc::new(Registration::bind(handler, self.serializer.clone()));
        registry.add(registration.clone());

        if let Err(e) = self.connector.on_handler_add(&self.context, &route).await {
            registry.remove_entry(&registration);
            tracing::error!(route = %route, creator_id = %registration.creator_id(), error = %e, "failed to subscribe handler");
            return Err(e);
        }

        tracing::debug!(route = %route, creator_id = %registration.creator_id(), "handler added");
        Ok(())
    }

    /// Remove handlers for a routing key, optionally only those of one creator
    ///
    /// `None` (or an empty creator id) removes every handler for the key.
    /// The native subscription is released when no handler for the key is
    /// left. Returns how many handlers were removed.
    pub async fn remove_handlers(
        &self,
        event_id: impl Into<EventId>,
        tag: MessageTag,
        creator_id: Option<&str>,
    ) -> BusResult<usize> {
        let route = RoutingKey::new(tag, event_id);
        let creator = creator_id.filter(|c| !c.trim().is_empty());
        self.remove_matching(&route, |registration| {
            creator.map_or(true, |c| registration.creator_id() == c)
        })
        .await
    }

    /// Remove handlers decoding into `T`, optionally only those of one creator
    pub async fn remove_handlers_of<T: MessageKind>(&self, creator_id: Option<&str>) -> BusResult<usize> {
        let route = RoutingKey::of::<T>();
        let creator = creator_id.filter(|c| !c.trim().is_empty());
        self.remove_matching(&route, |registration| {
            registration.targets::<T>() && creator.map_or(true, |c| registration.creator_id() == c)
        })
        .await
    }

    async fn remove_matching(
        &self,
        route: &RoutingKey,
        predicate: impl Fn(&Registration) -> bool,
    ) -> BusResult<usize> {
        self.ensure_live()?;

        let _lifecycle = self.lifecycle.lock().await;
        let registry = self.context.registry();

        let removed = registry.remove_where(|r| r.route() == route && predicate(r));
        if removed.is_empty() {
            tracing::debug!(route = %route, "no matching handler to remove");
            return Ok(0);
        }
        let count = removed.len();

        if registry.contains_route(route) {
            tracing::debug!(route = %route, removed = count, "handlers removed, route still in use");
            return Ok(count);
        }

        if let Err(e) = self.ensure_connected().await {
            registry.restore(removed);
            return Err(e);
        }
        if let Err(e) = self.connector.on_handlers_remove(&self.context, route).await {
            registry.restore(removed);
            tracing::error!(route = %route, error = %e, "failed to release subscription");
            return Err(e);
        }

        tracing::debug!(route = %route, removed = count, "handlers removed, route released");
        Ok(count)
    }

    /// Stop delivery without forgetting any handler; idempotent
    pub async fn pause(&self) -> BusResult<()> {
        self.ensure_live()?;
        let _lifecycle = self.lifecycle.lock().await;

        if self.context.is_paused() {
            return Ok(());
        }
        if !self.context.registry().is_empty() {
            self.ensure_connected().await?;
        }

        self.context.set_paused(true);
        if let Err(e) = self.connector.on_pause(&self.context).await {
            self.context.set_paused(false);
            tracing::error!(bus_id = %self.bus_id(), error = %e, "failed to pause delivery");
            return Err(e);
        }

        tracing::info!(bus_id = %self.bus_id(), "event bus paused");
        Ok(())
    }

    /// Re-establish delivery for every registered routing key; idempotent
    pub async fn resume(&self) -> BusResult<()> {
        self.ensure_live()?;
        let _lifecycle = self.lifecycle.lock().await;

        if !self.context.is_paused() {
            return Ok(());
        }
        if !self.context.registry().is_empty() {
            self.ensure_connected().await?;
        }

        self.context.set_paused(false);
        if let Err(e) = self.connector.on_resume(&self.context).await {
            self.context.set_paused(true);
            if let Err(pause_err) = self.connector.on_pause(&self.context).await {
                tracing::warn!(error = %pause_err, "failed to undo partial resume");
            }
            tracing::error!(bus_id = %self.bus_id(), error = %e, "failed to resume delivery");
            return Err(e);
        }

        tracing::info!(bus_id = %self.bus_id(), "event bus resumed");
        Ok(())
    }

    /// Drop every handler and release the native handles
    ///
    /// Safe to call more than once. Other operations fail with
    /// [`BusError::Disposed`] afterwards.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _lifecycle = self.lifecycle.lock().await;

        self.context.set_paused(true);
        self.context.registry().clear();
        self.connector.close().await;

        tracing::info!(bus_id = %self.bus_id(), app_id = %self.application_id(), "event bus client disposed");
    }
}

impl<S: Serializer> std::fmt::Debug for EventBusClient<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBusClient")
            .field("bus_id", &self.bus_id())
            .field("application_id", &self.application_id())
            .field("connector", &self.connector.kind())
            .field("paused", &self.is_paused())
            .field("handlers", &self.handler_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{LogMessage, LogSeverity};

    fn client() -> EventBusClient {
        EventBusClient::pubsub("Orders", "Billing", JsonSerializer, Arc::new(InMemoryBus::new()))
    }

    fn noop(creator: &str) -> MessageHandler<LogMessage> {
        MessageHandler::new(creator, |_| async { Ok(()) })
    }

    #[test]
    fn test_identifiers_are_lower_cased() {
        let client = client();
        assert_eq!(client.bus_id(), "orders");
        assert_eq!(client.application_id(), "billing");
        assert_eq!(client.connector_kind(), ConnectorKind::PubSub);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let client = client();
        assert!(!client.is_connected());
        assert!(client.connect().await);
        assert!(client.connect().await);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_reject_policy_refuses_duplicates() {
        let client = client().with_options(ClientOptions {
            duplicate_policy: DuplicatePolicy::Reject,
            ..ClientOptions::default()
        });

        client.add_handler(noop("a")).await.unwrap();
        let err = client.add_handler(noop("a")).await.unwrap_err();

        assert!(matches!(err, BusError::ValidationError(_)));
        assert_eq!(client.handler_count(), 1);
        client.add_handler(noop("b")).await.unwrap();
        assert_eq!(client.handler_count(), 2);
    }

    #[tokio::test]
    async fn test_allow_policy_keeps_duplicates() {
        let client = client();
        client.add_handler(noop("a")).await.unwrap();
        client.add_handler(noop("a")).await.unwrap();
        assert_eq!(client.handler_count(), 2);
        assert_eq!(client.routes(), vec![RoutingKey::of::<LogMessage>()]);
    }

    #[tokio::test]
    async fn test_remove_with_blank_creator_removes_all() {
        let client = client();
        client.add_handler(noop("a")).await.unwrap();
        client.add_handler(noop("b")).await.unwrap();

        let removed = client
            .remove_handlers("LogMessage", MessageTag::Log, Some(""))
            .await
            .unwrap();

        assert_eq!(removed, 2);
        assert!(client.native_subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_handlers_of_kind() {
        let client = client();
        client.add_handler(noop("a")).await.unwrap();
        client.add_handler(noop("b")).await.unwrap();

        assert_eq!(client.remove_handlers_of::<LogMessage>(Some("a")).await.unwrap(), 1);
        assert_eq!(client.native_subscriptions().await.len(), 1);
        assert_eq!(client.remove_handlers_of::<LogMessage>(None).await.unwrap(), 1);
        assert!(client.native_subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_final() {
        let client = client();
        client.add_handler(noop("a")).await.unwrap();

        client.dispose().await;
        client.dispose().await;

        assert!(client.is_disposed());
        assert_eq!(client.handler_count(), 0);
        assert!(!client.connect().await);

        let message = EventEnvelope::new(LogMessage::new(LogSeverity::Info, "late"));
        assert!(matches!(
            client.publish_message(&message).await,
            Err(BusError::Disposed)
        ));
        assert!(matches!(
            client.add_handler(noop("b")).await,
            Err(BusError::Disposed)
        ));
        assert!(matches!(client.pause().await, Err(BusError::Disposed)));
    }

    #[test]
    fn test_from_config_selects_connector() {
        let config = BusConfig::from_lookup(|key| match key {
            "APP_ID" => Some("billing".to_string()),
            "BUS_CONNECTOR" => Some("log".to_string()),
            "BUS_POLL_INTERVAL_MS" => Some("20".to_string()),
            _ => None,
        })
        .unwrap();

        let client = EventBusClient::from_config(&config, JsonSerializer);
        assert_eq!(client.connector_kind(), ConnectorKind::Log);
        assert_eq!(client.bus_id(), "events");
        assert_eq!(client.options().poll_interval, Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_from_config_matches_explicit_construction() {
        let config = BusConfig::from_lookup(|key| match key {
            "EVENT_BUS_ID" => Some("Orders".to_string()),
            "APP_ID" => Some("Billing".to_string()),
            "BUS_CONNECTOR" => Some("pubsub".to_string()),
            "BUS_DUPLICATE_HANDLERS" => Some("reject".to_string()),
            "BUS_POLL_INTERVAL_MS" => Some("20".to_string()),
            _ => None,
        })
        .unwrap();

        let configured = EventBusClient::from_config(&config, JsonSerializer);
        let explicit = client().with_options(config.client_options());

        for client in [&configured, &explicit] {
            assert_eq!(client.bus_id(), "orders");
            assert_eq!(client.application_id(), "billing");
            assert_eq!(client.connector_kind(), ConnectorKind::PubSub);
            assert_eq!(client.context.poll_interval(), Duration::from_millis(20));
            assert!(!client.is_paused());

            client.add_handler(noop("a")).await.unwrap();
            assert!(matches!(
                client.add_handler(noop("a")).await,
                Err(BusError::ValidationError(_))
            ));
            client.dispose().await;
        }
    }
}
