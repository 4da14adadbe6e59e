//! Handler registrations
//!
//! Application code builds a typed [`MessageHandler<T>`]. When it is added to a
//! client, the client pairs it with its serializer and stores a type-erased
//! [`Registration`] that connectors can invoke with raw bytes.

use futures::future::{BoxFuture, FutureExt};
use std::any::TypeId;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::envelope::{EventEnvelope, MessageKind, RoutingKey};
use crate::serializer::Serializer;
use crate::{BusError, BusResult};

/// Error returned by a handler callback
pub type HandlerFailure = Box<dyn std::error::Error + Send + Sync>;

type TypedCallback<T> =
    Arc<dyn Fn(EventEnvelope<T>) -> BoxFuture<'static, Result<(), HandlerFailure>> + Send + Sync>;

type ErasedCallback =
    Arc<dyn Fn(Arc<[u8]>) -> BoxFuture<'static, Result<(), HandlerFailure>> + Send + Sync>;

/// Binding of a creator to a message kind and an async callback
pub struct MessageHandler<T> {
    creator_id: String,
    route: RoutingKey,
    callback: TypedCallback<T>,
}

impl<T: MessageKind> MessageHandler<T> {
    /// Create a handler for messages of kind `T`
    ///
    /// # Example
    /// ```rust
    /// use event_bus_client::{LogMessage, MessageHandler};
    ///
    /// let handler = MessageHandler::<LogMessage>::new("audit-service", |envelope| async move {
    ///     let log: &LogMessage = envelope.payload();
    ///     println!("{}", log.message);
    ///     Ok(())
    /// });
    /// assert_eq!(handler.creator_id(), "audit-service");
    /// ```
    pub fn new<F, Fut>(creator_id: impl Into<String>, callback: F) -> Self
    where
        F: Fn(EventEnvelope<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerFailure>> + Send + 'static,
    {
        Self {
            creator_id: creator_id.into(),
            route: RoutingKey::of::<T>(),
            callback: Arc::new(move |envelope| callback(envelope).boxed()),
        }
    }
}

impl<T> MessageHandler<T> {
    pub fn creator_id(&self) -> &str {
        &self.creator_id
    }

    pub fn route(&self) -> &RoutingKey {
        &self.route
    }

    /// Validate the handler, describing the offending fields
    pub fn validate(&self) -> BusResult<()> {
        let mut problems = Vec::new();
        if self.creator_id.trim().is_empty() {
            problems.push("creator id must not be empty");
        }
        if !self.route.is_routable() {
            problems.push("message kind must have a known tag and a non-empty event id");
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(BusError::ValidationError(format!(
                "can't add invalid handler for {} from '{}': {}",
                self.route,
                self.creator_id,
                problems.join(", ")
            )))
        }
    }
}

impl<T> fmt::Debug for MessageHandler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHandler")
            .field("creator_id", &self.creator_id)
            .field("route", &self.route)
            .finish()
    }
}

/// Type-erased handler entry held by the registry
pub struct Registration {
    creator_id: String,
    route: RoutingKey,
    target: TypeId,
    target_name: &'static str,
    callback: ErasedCallback,
}

impl Registration {
    /// Bind a typed handler to the serializer that decodes its target kind
    pub fn bind<T, S>(handler: MessageHandler<T>, serializer: Arc<S>) -> Self
    where
        T: MessageKind,
        S: Serializer,
    {
        let typed = handler.callback;
        let callback: ErasedCallback = Arc::new(move |payload: Arc<[u8]>| {
            let decoded = serializer.decode::<EventEnvelope<T>>(&payload);
            let typed = typed.clone();
            async move {
                let envelope = decoded.map_err(|e| Box::new(e) as HandlerFailure)?;
                typed(envelope).await
            }
            .boxed()
        });

        Self {
            creator_id: handler.creator_id,
            route: handler.route,
            target: TypeId::of::<T>(),
            target_name: std::any::type_name::<T>(),
            callback,
        }
    }

    pub fn creator_id(&self) -> &str {
        &self.creator_id
    }

    pub fn route(&self) -> &RoutingKey {
        &self.route
    }

    /// Whether this registration decodes into `T`
    pub fn targets<T: 'static>(&self) -> bool {
        self.target == TypeId::of::<T>()
    }

    pub fn target_name(&self) -> &'static str {
        self.target_name
    }

    /// Decode the payload into the target kind and run the callback
    pub fn invoke(&self, payload: Arc<[u8]>) -> BoxFuture<'static, Result<(), HandlerFailure>> {
        (self.callback)(payload)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("creator_id", &self.creator_id)
            .field("route", &self.route)
            .field("target", &self.target_name)
            .finish()
    }
}

impl fmt::Display for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from '{}'", self.route, self.creator_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageTag;
    use crate::messages::{LogMessage, LogSeverity};
    use crate::serializer::JsonSerializer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop(creator: &str) -> MessageHandler<LogMessage> {
        MessageHandler::new(creator, |_| async { Ok(()) })
    }

    #[test]
    fn test_handler_route_follows_kind() {
        let handler = noop("svc-a");
        assert_eq!(handler.route().tag(), MessageTag::Log);
        assert_eq!(handler.route().event_id().as_str(), "logmessage");
        assert!(handler.validate().is_ok());
    }

    #[test]
    fn test_blank_creator_is_rejected() {
        let err = noop("  ").validate().unwrap_err();
        assert!(matches!(err, BusError::ValidationError(_)));
        assert!(err.to_string().contains("creator id must not be empty"));
    }

    #[tokio::test]
    async fn test_registration_decodes_payload() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let handler = MessageHandler::new("svc-a", move |envelope: EventEnvelope<LogMessage>| {
            let seen = seen_clone.clone();
            async move {
                assert_eq!(envelope.payload().message, "hello");
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let registration = Registration::bind(handler, Arc::new(JsonSerializer));
        assert!(registration.targets::<LogMessage>());

        let envelope = EventEnvelope::new(LogMessage::new(LogSeverity::Info, "hello"));
        let bytes: Arc<[u8]> = serde_json::to_vec(&envelope).unwrap().into();
        registration.invoke(bytes).await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_registration_reports_decode_failure() {
        let registration = Registration::bind(noop("svc-a"), Arc::new(JsonSerializer));
        let result = registration.invoke(Arc::from(&b"{}"[..])).await;
        assert!(result.is_err());
    }
}
