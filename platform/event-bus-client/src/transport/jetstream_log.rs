//! Partitioned log on NATS JetStream
//!
//! Each topic is a stream capturing `_bus.log.{topic}.>`; the record key is the
//! last subject token. A consumer group is a durable pull consumer per topic,
//! so the server keeps the group's offset and members of one group share
//! records. A polled batch is acked when the next poll starts or when `rewind`
//! settles it; records `rewind` hands back are nak'd so the server redelivers
//! them. Unsettled records left at close are redelivered after the ack wait.

use async_nats::jetstream::{self, consumer, stream};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use super::nats::{object_name, NatsConnection, NatsEndpoint};
use super::{LogRecord, LogTransport};
use crate::{BusError, BusResult, PublishMode};

/// Records fetched per topic on each poll
const FETCH_BATCH: usize = 100;

const SUBJECT_PREFIX: &str = "_bus.log";

type PullConsumer = consumer::Consumer<consumer::pull::Config>;

#[derive(Default)]
struct Session {
    group: Option<String>,
    context: Option<jetstream::Context>,
    consumers: Vec<(String, PullConsumer)>,
    /// Messages of the last poll, not yet acked
    pending: Vec<jetstream::Message>,
}

impl Session {
    async fn commit_pending(&mut self) {
        for message in self.pending.drain(..) {
            if let Err(e) = message.ack().await {
                tracing::warn!(subject = %message.message.subject, error = %e, "failed to commit log record");
            }
        }
    }
}

/// Log transport backed by JetStream streams and durable pull consumers
pub struct JetStreamLog {
    connection: NatsConnection,
    session: tokio::sync::Mutex<Session>,
    subscription: Mutex<Vec<String>>,
    known_streams: Mutex<HashSet<String>>,
}

fn subject(topic: &str, key: &str) -> String {
    format!("{}.{}.{}", SUBJECT_PREFIX, topic, key)
}

fn topic_prefix(topic: &str) -> String {
    format!("{}.{}.", SUBJECT_PREFIX, topic)
}

impl JetStreamLog {
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
            session: tokio::sync::Mutex::new(Session::default()),
            subscription: Mutex::new(Vec::new()),
            known_streams: Mutex::new(HashSet::new()),
        }
    }

    async fn ensure_stream(
        &self,
        context: &jetstream::Context,
        topic: &str,
    ) -> BusResult<stream::Stream> {
        let name = object_name("log", topic);

        if let Ok(existing) = context.get_stream(&name).await {
            self.remember_stream(name);
            return Ok(existing);
        }

        let config = stream::Config {
            name: name.clone(),
            subjects: vec![format!("{}>", topic_prefix(topic))],
            ..Default::default()
        };
        let created = context
            .create_stream(config)
            .await
            .map_err(|e| BusError::SubscribeError(format!("failed to create stream {}: {}", name, e)))?;

        tracing::debug!(stream = %name, "created log stream");
        self.remember_stream(name);
        Ok(created)
    }

    fn remember_stream(&self, name: String) {
        self.known_streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name);
    }

    fn stream_known(&self, topic: &str) -> bool {
        self.known_streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&object_name("log", topic))
    }
}

#[async_trait]
impl LogTransport for JetStreamLog {
    async fn connect(&self, group_id: &str) -> BusResult<()> {
        let client = self.connection.connect(group_id).await?;
        let mut session = self.session.lock().await;
        session.group = Some(group_id.to_string());
        session.context = Some(jetstream::new(client));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    async fn produce(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
        mode: PublishMode,
    ) -> BusResult<()> {
        let context = self
            .session
            .lock()
            .await
            .context
            .clone()
            .ok_or_else(|| BusError::PublishError("not connected".to_string()))?;

        if !self.stream_known(topic) {
            self.ensure_stream(&context, topic)
                .await
                .map_err(|e| BusError::PublishError(e.to_string()))?;
        }

        let ack = context
            .publish(subject(topic, key), payload.into())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        if mode == PublishMode::Confirmed {
            ack.await
                .map_err(|e| BusError::PublishError(e.to_string()))?;
        }
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> BusResult<()> {
        let mut session = self.session.lock().await;
        let (group, context) = match (&session.group, &session.context) {
            (Some(group), Some(context)) => (group.clone(), context.clone()),
            _ => return Err(BusError::SubscribeError("not connected".to_string())),
        };

        let mut consumers = Vec::with_capacity(topics.len());
        for topic in topics {
            let stream = self.ensure_stream(&context, topic).await?;
            let durable = object_name("group", &group);
            let consumer = stream
                .get_or_create_consumer(
                    &durable,
                    consumer::pull::Config {
                        durable_name: Some(durable.clone()),
                        deliver_policy: consumer::DeliverPolicy::New,
                        ack_policy: consumer::AckPolicy::Explicit,
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| BusError::SubscribeError(format!("topic {}: {}", topic, e)))?;
            consumers.push((topic.clone(), consumer));
        }

        session.consumers = consumers;
        *self.subscription.lock().unwrap_or_else(PoisonError::into_inner) = topics.to_vec();
        tracing::debug!(group = %group, topics = ?topics, "log subscription replaced");
        Ok(())
    }

    async fn unsubscribe(&self) -> BusResult<()> {
        self.session.lock().await.consumers.clear();
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    fn subscription(&self) -> Vec<String> {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn poll(&self, timeout: Duration) -> BusResult<Vec<LogRecord>> {
        let mut records = Vec::new();
        {
            let mut session = self.session.lock().await;
            if session.context.is_none() {
                return Err(BusError::SubscribeError("not connected".to_string()));
            }
            session.commit_pending().await;

            let mut fetched = Vec::new();
            for (topic, consumer) in &session.consumers {
                let mut batch = consumer
                    .fetch()
                    .max_messages(FETCH_BATCH)
                    .messages()
                    .await
                    .map_err(|e| BusError::SubscribeError(format!("fetch from {}: {}", topic, e)))?;

                let prefix = topic_prefix(topic);
                while let Some(next) = batch.next().await {
                    let message = match next {
                        Ok(message) => message,
                        Err(e) => {
                            tracing::warn!(topic = %topic, error = %e, "failed to read log record");
                            continue;
                        }
                    };

                    let key = message
                        .message
                        .subject
                        .as_str()
                        .strip_prefix(&prefix)
                        .unwrap_or_default()
                        .to_string();
                    records.push(LogRecord {
                        topic: topic.clone(),
                        key,
                        payload: message.message.payload.to_vec(),
                    });
                    fetched.push(message);
                }
            }
            session.pending = fetched;
        }

        if records.is_empty() {
            tokio::time::sleep(timeout).await;
        }
        Ok(records)
    }

    async fn rewind(&self, delivered: usize) -> BusResult<()> {
        let mut session = self.session.lock().await;
        let mut pending = std::mem::take(&mut session.pending);
        let returned = pending.split_off(delivered.min(pending.len()));
        session.pending = pending;
        session.commit_pending().await;

        for message in returned {
            message
                .ack_with(jetstream::AckKind::Nak(None))
                .await
                .map_err(|e| BusError::SubscribeError(format!("failed to return log record: {}", e)))?;
        }
        Ok(())
    }

    async fn close(&self) {
        *self.session.lock().await = Session::default();
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.connection.close().await;
    }
}
