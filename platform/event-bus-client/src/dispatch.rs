//! Inbound delivery: match bytes against the registry and fan out to handlers

use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::envelope::RoutingKey;
use crate::registry::HandlerRegistry;
use crate::BusError;

/// State a client shares with its connector
///
/// Connectors read the identifiers to name native resources and use the
/// registry and pause flag to decide what to subscribe and what to deliver.
#[derive(Debug, Clone)]
pub struct BusContext {
    bus_id: String,
    application_id: String,
    registry: Arc<HandlerRegistry>,
    paused: Arc<AtomicBool>,
    poll_interval: Duration,
}

/// Default delay between polls of a partitioned log
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Result of delivering one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The client was paused; nothing was invoked
    Paused,
    /// Every matched handler ran to completion (successfully or not)
    Delivered { matched: usize, failed: usize },
}

impl DispatchOutcome {
    /// Whether a queue delivery may be acknowledged
    ///
    /// A delivery is acked when all matched handlers succeeded, including the
    /// case where nothing matched. Failures and paused deliveries are left
    /// unacked so the broker redelivers them.
    pub fn should_ack(&self) -> bool {
        matches!(self, DispatchOutcome::Delivered { failed: 0, .. })
    }
}

impl BusContext {
    pub fn new(
        bus_id: impl Into<String>,
        application_id: impl Into<String>,
        registry: Arc<HandlerRegistry>,
        paused: Arc<AtomicBool>,
    ) -> Self {
        Self {
            bus_id: bus_id.into().to_lowercase(),
            application_id: application_id.into().to_lowercase(),
            registry,
            paused,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn bus_id(&self) -> &str {
        &self.bus_id
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// How long a poll loop waits for records before checking its state again
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub(crate) fn set_paused(&self, paused: bool) -> bool {
        self.paused.swap(paused, Ordering::SeqCst)
    }

    /// Deliver a payload to every handler registered for `route`
    ///
    /// Handlers run concurrently, each on its own task so a panic in one is
    /// contained. The future resolves once all of them have finished.
    pub async fn dispatch(&self, route: &RoutingKey, payload: Arc<[u8]>) -> DispatchOutcome {
        if self.is_paused() {
            tracing::debug!(route = %route, "client paused, skipping delivery");
            return DispatchOutcome::Paused;
        }

        let matched = self.registry.matching(route);
        if matched.is_empty() {
            tracing::debug!(route = %route, "no handler registered for inbound message");
            return DispatchOutcome::Delivered {
                matched: 0,
                failed: 0,
            };
        }

        let tasks = matched.iter().map(|registration| {
            let invocation = registration.invoke(payload.clone());
            tokio::spawn(invocation)
        });
        let results = join_all(tasks).await;

        let mut failed = 0;
        for (registration, result) in matched.iter().zip(results) {
            let reason = match result {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(join_error) if join_error.is_panic() => "handler panicked".to_string(),
                Err(join_error) => join_error.to_string(),
            };
            failed += 1;
            let error = BusError::HandlerError {
                creator_id: registration.creator_id().to_string(),
                route: route.to_string(),
                reason,
            };
            tracing::warn!(
                route = %route,
                creator_id = %registration.creator_id(),
                error = %error,
                "message handler failed"
            );
        }

        DispatchOutcome::Delivered {
            matched: matched.len(),
            failed,
        }
    }
}
