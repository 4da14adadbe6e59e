//! # Message Envelope
//!
//! Every message that crosses the bus travels inside an [`EventEnvelope`].
//! The envelope carries the routing metadata handlers are matched on:
//!
//! - `tag`: coarse classification ([`MessageTag`]) used as the routing namespace
//! - `event_id`: fine-grained routing key derived from the payload kind
//!
//! Together they form a [`RoutingKey`]. Both parts are normalized to lower case
//! on construction, so a key built from `"Data"` and `"LogMessage"` compares
//! equal to one decoded from the wire as `"data"` / `"logmessage"`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{BusError, BusResult};

/// Coarse message classification, used as the routing namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageTag {
    #[default]
    Unknown,
    Data,
    Log,
}

impl MessageTag {
    /// Lower-case wire form of the tag
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageTag::Unknown => "unknown",
            MessageTag::Data => "data",
            MessageTag::Log => "log",
        }
    }
}

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageTag {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "unknown" => Ok(MessageTag::Unknown),
            "data" => Ok(MessageTag::Data),
            "log" => Ok(MessageTag::Log),
            other => Err(BusError::ValidationError(format!(
                "unrecognised message tag '{}'",
                other
            ))),
        }
    }
}

/// Fine-grained routing key derived from a message kind
///
/// Always stored trimmed and lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct EventId(String);

impl EventId {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_lowercase())
    }

    /// Event id of a Rust type: its short name, lower-cased
    ///
    /// Module path and generic arguments are stripped, so
    /// `orders::events::OrderPlaced<V2>` becomes `orderplaced`.
    pub fn of<T: ?Sized>() -> Self {
        let full = std::any::type_name::<T>();
        let without_generics = full.split('<').next().unwrap_or(full);
        let short = without_generics
            .rsplit("::")
            .next()
            .unwrap_or(without_generics);
        Self::new(short)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for EventId {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl From<&str> for EventId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<EventId> for String {
    fn from(id: EventId) -> Self {
        id.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The (tag, event id) pair matching publishers to handlers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingKey {
    tag: MessageTag,
    event_id: EventId,
}

impl RoutingKey {
    pub fn new(tag: MessageTag, event_id: impl Into<EventId>) -> Self {
        Self {
            tag,
            event_id: event_id.into(),
        }
    }

    /// Routing key of a message kind
    pub fn of<T: MessageKind>() -> Self {
        Self::new(T::TAG, T::event_id())
    }

    /// Rebuild a routing key from inbound wire metadata
    ///
    /// Returns `None` when the tag is not one the bus knows about.
    pub fn parse(tag: &str, event_id: &str) -> Option<Self> {
        let tag = MessageTag::from_str(tag).ok()?;
        Some(Self::new(tag, event_id))
    }

    pub fn tag(&self) -> MessageTag {
        self.tag
    }

    pub fn event_id(&self) -> &EventId {
        &self.event_id
    }

    /// True when neither part of the key is a placeholder
    pub fn is_routable(&self) -> bool {
        self.tag != MessageTag::Unknown && !self.event_id.is_empty()
    }

    /// Channel name used by pub/sub transports: `{bus_id}.{tag}.{event_id}`
    pub fn channel(&self, bus_id: &str) -> String {
        format!("{}.{}.{}", bus_id, self.tag, self.event_id)
    }

    /// Inverse of [`RoutingKey::channel`]
    pub fn from_channel(bus_id: &str, channel: &str) -> Option<Self> {
        let rest = channel.strip_prefix(bus_id)?.strip_prefix('.')?;
        let (tag, event_id) = rest.split_once('.')?;
        Self::parse(tag, event_id)
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tag, self.event_id)
    }
}

/// A concrete kind of message that can be published on the bus
///
/// The routing metadata is a property of the type, not of the value: every
/// `OrderPlaced` travels under the same tag and event id.
///
/// ```rust
/// use event_bus_client::{MessageKind, MessageTag};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// struct OrderPlaced {
///     order_id: String,
/// }
///
/// impl MessageKind for OrderPlaced {
///     const TAG: MessageTag = MessageTag::Data;
/// }
///
/// assert_eq!(OrderPlaced::event_id().as_str(), "orderplaced");
/// ```
pub trait MessageKind: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Routing namespace of this kind
    const TAG: MessageTag;

    /// Routing key within the namespace; defaults to the lower-cased type name
    fn event_id() -> EventId {
        EventId::of::<Self>()
    }
}

/// Immutable envelope around a message payload
///
/// The envelope is what gets serialized onto the wire: identity, creation
/// timestamp, routing metadata and the payload itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    message_id: Uuid,
    created_at: DateTime<Utc>,
    tag: MessageTag,
    event_id: EventId,
    payload: T,
}

impl<T: MessageKind> EventEnvelope<T> {
    /// Wrap a payload, deriving the routing metadata from its kind
    pub fn new(payload: T) -> Self {
        Self::with_message_id(Uuid::new_v4(), payload)
    }

    /// Create an envelope with explicit message_id (useful for testing)
    pub fn with_message_id(message_id: Uuid, payload: T) -> Self {
        Self {
            message_id,
            created_at: Utc::now(),
            tag: T::TAG,
            event_id: T::event_id(),
            payload,
        }
    }
}

impl<T> EventEnvelope<T> {
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn tag(&self) -> MessageTag {
        self.tag
    }

    pub fn event_id(&self) -> &EventId {
        &self.event_id
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    pub fn route(&self) -> RoutingKey {
        RoutingKey::new(self.tag, self.event_id.clone())
    }

    /// A message is valid iff its tag is known and its event id is non-empty
    pub fn is_valid(&self) -> bool {
        self.tag != MessageTag::Unknown && !self.event_id.is_empty()
    }

    /// Validate the routing metadata, describing the offending fields
    pub fn validate(&self) -> BusResult<()> {
        let mut problems = Vec::new();
        if self.tag == MessageTag::Unknown {
            problems.push("tag must not be 'unknown'");
        }
        if self.event_id.is_empty() {
            problems.push("event id must not be empty");
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(BusError::ValidationError(format!(
                "can't publish invalid message [{}]: {}",
                self,
                problems.join(", ")
            )))
        }
    }
}

impl<T> fmt::Display for EventEnvelope<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tag: {}; event id: {}; created: {}; message id: {}",
            self.tag,
            self.event_id,
            self.created_at.to_rfc3339(),
            self.message_id
        )
    }
}
