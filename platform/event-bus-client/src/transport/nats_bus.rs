//! NATS core subjects as pub/sub channels

use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use super::nats::{NatsConnection, NatsEndpoint};
use super::{PubSubTransport, APP_ID_HEADER};
use crate::{BusError, BusMessage, BusResult, PublishMode};

/// Pub/sub transport over plain NATS subjects
///
/// Core NATS has no persistence: a channel message reaches whoever is
/// subscribed when it is published.
///
/// # Example
/// ```rust,no_run
/// use event_bus_client::{NatsBus, NatsEndpoint, PubSubTransport, PublishMode};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = NatsBus::with_endpoint(NatsEndpoint::new("nats://localhost:4222"));
/// bus.connect("billing").await?;
/// bus.publish("orders.data.orderplaced", b"{}".to_vec(), PublishMode::Confirmed).await?;
/// # Ok(())
/// # }
/// ```
pub struct NatsBus {
    connection: NatsConnection,
    app_id: RwLock<String>,
}

impl NatsBus {
    /// Wrap an already-connected client
    pub fn new(client: Client) -> Self {
        Self {
            connection: NatsConnection::from_client(client),
            app_id: RwLock::new(String::new()),
        }
    }

    /// Dial `endpoint` on the first `connect`
    pub fn with_endpoint(endpoint: NatsEndpoint) -> Self {
        Self {
            connection: NatsConnection::from_endpoint(endpoint),
            app_id: RwLock::new(String::new()),
        }
    }

    /// Underlying NATS client, if connected
    pub fn client(&self) -> Option<Client> {
        self.connection.client().ok()
    }
}

fn into_bus_message(nats_msg: async_nats::Message) -> BusMessage {
    let mut msg = BusMessage::new(nats_msg.subject.to_string(), nats_msg.payload.to_vec());

    if let Some(reply) = nats_msg.reply {
        msg = msg.with_reply_to(reply.to_string());
    }

    if let Some(nats_headers) = nats_msg.headers {
        let mut headers = HashMap::new();
        for (key, values) in nats_headers.iter() {
            if let Some(value) = values.first() {
                headers.insert(key.to_string(), value.to_string());
            }
        }
        if !headers.is_empty() {
            msg = msg.with_headers(headers);
        }
    }

    msg
}

#[async_trait]
impl PubSubTransport for NatsBus {
    async fn connect(&self, app_id: &str) -> BusResult<()> {
        self.connection.connect(app_id).await?;
        *self.app_id.write().unwrap_or_else(PoisonError::into_inner) = app_id.to_string();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>, mode: PublishMode) -> BusResult<()> {
        let client = self.connection.client()?;

        let mut headers = HeaderMap::new();
        let app_id = self.app_id.read().unwrap_or_else(PoisonError::into_inner).clone();
        headers.insert(APP_ID_HEADER, app_id.as_str());

        client
            .publish_with_headers(channel.to_string(), headers, payload.into())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        if mode == PublishMode::Confirmed {
            client
                .flush()
                .await
                .map_err(|e| BusError::PublishError(e.to_string()))?;
        }

        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let subscriber = self
            .connection
            .client()
            .map_err(|e| BusError::SubscribeError(e.to_string()))?
            .subscribe(channel.to_string())
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        Ok(subscriber.map(into_bus_message).boxed())
    }

    async fn close(&self) {
        self.connection.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    // These tests require a running NATS server:
    // docker run -p 4222:4222 nats:2.10-alpine

    #[tokio::test]
    async fn test_publish_before_connect_fails() {
        let bus = NatsBus::with_endpoint(NatsEndpoint::default());
        let result = bus.publish("x.y", b"z".to_vec(), PublishMode::FireAndForget).await;
        assert!(matches!(result, Err(BusError::ConnectionError(_))));
    }

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_nats_bus_publish_subscribe() {
        let bus = NatsBus::with_endpoint(NatsEndpoint::default());
        bus.connect("nats-bus-test")
            .await
            .expect("NATS server must be running on localhost:4222");

        let mut stream = bus.subscribe("test.nats.hello").await.unwrap();

        let payload = b"test message".to_vec();
        bus.publish("test.nats.hello", payload.clone(), PublishMode::Confirmed)
            .await
            .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended");

        assert_eq!(msg.subject, "test.nats.hello");
        assert_eq!(msg.payload, payload);
        assert_eq!(msg.headers.unwrap()[APP_ID_HEADER], "nats-bus-test");
    }
}
