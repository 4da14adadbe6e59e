//! Routing-broker queues on NATS JetStream
//!
//! An exchange is a subject prefix, so binding `key` on exchange `orders` to
//! a queue adds `orders.{key}` to the subjects captured by that queue's
//! stream. Queue streams use work-queue retention and file storage. Every
//! instance consuming a queue shares one durable pull consumer, so they
//! compete for messages.

use async_nats::jetstream::{self, consumer, stream};
use async_nats::HeaderMap;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;

use super::nats::{object_name, NatsConnection, NatsEndpoint};
use super::{DeliveryAcker, QueueDelivery, QueueTransport, APP_ID_HEADER};
use crate::{BusError, BusResult, PublishMode};

/// Time the server waits for an ack before redelivering
const ACK_WAIT: Duration = Duration::from_secs(30);

/// Queue transport backed by JetStream work-queue streams
pub struct JetStreamQueue {
    connection: NatsConnection,
    context: RwLock<Option<jetstream::Context>>,
    app_id: RwLock<String>,
    consumers: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

fn queue_stream(queue: &str) -> String {
    object_name("queue", queue)
}

/// Subject an unbound queue stream captures; nothing publishes to it
fn placeholder_subject(queue: &str) -> String {
    format!("_bus.queue.{}", queue)
}

fn routing_subject(exchange: &str, routing_key: &str) -> String {
    format!("{}.{}", exchange, routing_key)
}

fn into_delivery(queue: &str, message: jetstream::Message) -> QueueDelivery {
    let subject = message.message.subject.to_string();
    let routing_key = subject
        .rsplit_once('.')
        .map_or(subject.as_str(), |(_, key)| key)
        .to_string();
    let payload = message.message.payload.to_vec();
    let redelivered = message.info().map(|info| info.delivered > 1).unwrap_or(false);

    let acker = DeliveryAcker::new(move || async move {
        message
            .ack()
            .await
            .map_err(|e| BusError::SubscribeError(format!("ack failed: {}", e)))
    });

    QueueDelivery::new(queue, routing_key, payload, redelivered, acker)
}

impl JetStreamQueue {
    pub fn new(endpoint: NatsEndpoint) -> Self {
        Self::from_connection(NatsConnection::from_endpoint(endpoint))
    }

    /// Use a client the caller already connected
    pub fn with_client(client: async_nats::Client) -> Self {
        Self::from_connection(NatsConnection::from_client(client))
    }

    fn from_connection(connection: NatsConnection) -> Self {
        Self {
            connection,
            context: RwLock::new(None),
            app_id: RwLock::new(String::new()),
            consumers: Mutex::new(HashMap::new()),
        }
    }

    fn context(&self) -> BusResult<jetstream::Context> {
        self.context
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| BusError::SubscribeError("not connected".to_string()))
    }

    /// Apply `change` to the subjects captured by a queue's stream
    async fn update_subjects(
        &self,
        queue: &str,
        change: impl FnOnce(&mut Vec<String>),
    ) -> BusResult<()> {
        let context = self.context()?;
        let name = queue_stream(queue);

        let mut stream = context
            .get_stream(&name)
            .await
            .map_err(|e| BusError::SubscribeError(format!("no queue '{}': {}", queue, e)))?;
        let mut config = stream
            .info()
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?
            .config
            .clone();

        let before = config.subjects.clone();
        change(&mut config.subjects);
        if config.subjects.is_empty() {
            // A stream needs at least one subject; park it on its own name
            config.subjects.push(placeholder_subject(queue));
        }
        if config.subjects == before {
            return Ok(());
        }

        context
            .update_stream(&config)
            .await
            .map_err(|e| BusError::SubscribeError(format!("failed to update '{}': {}", name, e)))?;
        Ok(())
    }
}

#[async_trait]
impl QueueTransport for JetStreamQueue {
    async fn connect(&self, app_id: &str) -> BusResult<()> {
        let client = self.connection.connect(app_id).await?;
        *self.context.write().unwrap_or_else(PoisonError::into_inner) = Some(jetstream::new(client));
        *self.app_id.write().unwrap_or_else(PoisonError::into_inner) = app_id.to_string();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    async fn declare_exchange(&self, exchange: &str) -> BusResult<()> {
        // Exchanges are subject prefixes and need no server-side object
        self.context()?;
        tracing::trace!(exchange = %exchange, "exchange declared");
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> BusResult<()> {
        let context = self.context()?;
        let name = queue_stream(queue);

        if context.get_stream(&name).await.is_ok() {
            return Ok(());
        }

        let config = stream::Config {
            name: name.clone(),
            subjects: vec![placeholder_subject(queue)],
            retention: stream::RetentionPolicy::WorkQueue,
            storage: stream::StorageType::File,
            ..Default::default()
        };
        context
            .create_stream(config)
            .await
            .map_err(|e| BusError::SubscribeError(format!("failed to declare '{}': {}", queue, e)))?;

        tracing::debug!(queue = %queue, stream = %name, "declared queue stream");
        Ok(())
    }

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()> {
        let subject = routing_subject(exchange, routing_key);
        let placeholder = placeholder_subject(queue);
        self.update_subjects(queue, |subjects| {
            subjects.retain(|s| s != &placeholder);
            if !subjects.contains(&subject) {
                subjects.push(subject.clone());
            }
        })
        .await
    }

    async fn unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()> {
        let subject = routing_subject(exchange, routing_key);
        self.update_subjects(queue, |subjects| subjects.retain(|s| s != &subject))
            .await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        mode: PublishMode,
    ) -> BusResult<()> {
        let context = self
            .context()
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        let mut headers = HeaderMap::new();
        let app_id = self.app_id.read().unwrap_or_else(PoisonError::into_inner).clone();
        headers.insert(APP_ID_HEADER, app_id.as_str());

        let ack = context
            .publish_with_headers(routing_subject(exchange, routing_key), headers, payload.into())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        if mode == PublishMode::Confirmed {
            ack.await
                .map_err(|e| BusError::PublishError(e.to_string()))?;
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> BusResult<(String, BoxStream<'static, QueueDelivery>)> {
        let context = self.context()?;
        let stream = context
            .get_stream(queue_stream(queue))
            .await
            .map_err(|e| BusError::SubscribeError(format!("no queue '{}': {}", queue, e)))?;

        let durable = object_name("workers", queue);
        let consumer = stream
            .get_or_create_consumer(
                &durable,
                consumer::pull::Config {
                    durable_name: Some(durable.clone()),
                    ack_policy: consumer::AckPolicy::Explicit,
                    ack_wait: ACK_WAIT,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let app_id = self.app_id.read().unwrap_or_else(PoisonError::into_inner).clone();
        let consumer_tag = format!("{}-{}", app_id, uuid::Uuid::new_v4());
        let (stop, stopped) = oneshot::channel();
        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(consumer_tag.clone(), stop);

        let queue = queue.to_string();
        let deliveries = messages
            .take_until(stopped)
            .filter_map(move |next| {
                let delivery = match next {
                    Ok(message) => Some(into_delivery(&queue, message)),
                    Err(e) => {
                        tracing::warn!(queue = %queue, error = %e, "failed to receive queue message");
                        None
                    }
                };
                futures::future::ready(delivery)
            })
            .boxed();

        Ok((consumer_tag, deliveries))
    }

    async fn cancel(&self, consumer_tag: &str) -> BusResult<()> {
        let stop = self
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(consumer_tag)
            .ok_or_else(|| BusError::SubscribeError(format!("unknown consumer '{}'", consumer_tag)))?;

        // The receiving side is gone if the stream was already dropped
        let _ = stop.send(());
        Ok(())
    }

    async fn close(&self) {
        let stops: Vec<_> = self
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, stop)| stop)
            .collect();
        for stop in stops {
            let _ = stop.send(());
        }
        *self.context.write().unwrap_or_else(PoisonError::into_inner) = None;
        self.connection.close().await;
    }
}
