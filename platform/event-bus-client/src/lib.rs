//! # Event Bus Client
//!
//! A broker-agnostic publish/subscribe facade. Application code publishes
//! typed envelopes and registers typed handlers against one [`EventBusClient`];
//! which transport carries the bytes is decided once, at construction, by the
//! [`Connector`] the client is built with.
//!
//! ## Connectors
//!
//! - **PartitionedLogConnector**: append-log topics polled by a background loop
//! - **QueueConnector**: durable routing-broker queues with explicit acks
//! - **PubSubConnector**: fire-and-forget channel subscriptions
//!
//! Each connector drives a transport trait ([`LogTransport`], [`QueueTransport`],
//! [`PubSubTransport`]). NATS-backed transports are used in production and
//! in-memory ones in tests and local development.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus_client::{
//!     EventBusClient, EventEnvelope, InMemoryBus, JsonSerializer, LogMessage, LogSeverity,
//!     MessageHandler,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = EventBusClient::pubsub("orders", "billing", JsonSerializer, Arc::new(InMemoryBus::new()));
//!
//! client
//!     .add_handler(MessageHandler::<LogMessage>::new("billing-audit", |envelope| async move {
//!         println!("log: {}", envelope.payload().message);
//!         Ok(())
//!     }))
//!     .await?;
//!
//! let message = EventEnvelope::new(LogMessage::new(LogSeverity::Info, "invoice issued"));
//! client.publish_message(&message).await?;
//!
//! client.dispose().await;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod connector;
mod dispatch;
mod envelope;
mod handler;
mod messages;
mod registry;
mod serializer;
mod transport;

pub use client::{ClientOptions, DuplicatePolicy, EventBusClient};
pub use config::{BusConfig, BusType, ConnectorKind};
pub use connector::{Connector, PartitionedLogConnector, PubSubConnector, QueueConnector};
pub use dispatch::{BusContext, DispatchOutcome};
pub use envelope::{EventEnvelope, EventId, MessageKind, MessageTag, RoutingKey};
pub use handler::{HandlerFailure, MessageHandler, Registration};
pub use messages::{LogMessage, LogSeverity};
pub use registry::HandlerRegistry;
pub use serializer::{JsonSerializer, Serializer};
pub use transport::{
    DeliveryAcker, InMemoryBus, InMemoryLog, InMemoryQueue, JetStreamLog, JetStreamQueue,
    LogRecord, LogTransport, NatsBus, NatsEndpoint, PubSubTransport, QueueDelivery,
    QueueTransport,
};

use std::collections::HashMap;

/// A message received from a pub/sub channel
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// The channel/subject this message was published to
    pub subject: String,
    /// The message payload (raw bytes)
    pub payload: Vec<u8>,
    /// Optional transport headers
    pub headers: Option<HashMap<String, String>>,
    /// Optional reply-to subject (for request-response patterns)
    pub reply_to: Option<String>,
}

impl BusMessage {
    pub fn new(subject: String, payload: Vec<u8>) -> Self {
        Self {
            subject,
            payload,
            headers: None,
            reply_to: None,
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_reply_to(mut self, reply_to: String) -> Self {
        self.reply_to = Some(reply_to);
        self
    }
}

/// How long a publish waits before returning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    /// Wait until the broker confirms it has the message
    Confirmed,
    /// Return once the transport has accepted the bytes
    FireAndForget,
}

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("validation failed: {0}")]
    ValidationError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to change subscription: {0}")]
    SubscribeError(String),

    #[error("handler {creator_id} failed for {route}: {reason}")]
    HandlerError {
        creator_id: String,
        route: String,
        reason: String,
    },

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("event bus client has been disposed")]
    Disposed,
}

impl BusError {
    /// True for failures of a native publish/subscribe/bind call
    pub fn is_transport(&self) -> bool {
        matches!(self, BusError::PublishError(_) | BusError::SubscribeError(_))
    }
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;
