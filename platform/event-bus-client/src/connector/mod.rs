//! Connectors: backend-specific subscription bookkeeping over a transport
//!
//! The client calls a connector whenever the set of routing keys it needs
//! changes. The connector turns that into native subscribe/bind/consume calls
//! and runs the background tasks that feed inbound bytes to
//! [`BusContext::dispatch`].

mod partitioned_log;
mod pubsub;
mod queue;

pub use partitioned_log::PartitionedLogConnector;
pub use pubsub::PubSubConnector;
pub use queue::QueueConnector;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::ConnectorKind;
use crate::dispatch::BusContext;
use crate::envelope::RoutingKey;
use crate::{BusResult, PublishMode};

/// Publish/subscribe primitives for one transport family
#[async_trait]
pub trait Connector: Send + Sync {
    fn kind(&self) -> ConnectorKind;

    /// Whether the native handles are open
    fn is_connected(&self) -> bool;

    /// Open the native handles if they are not open yet
    async fn connect(&self, ctx: &BusContext) -> BusResult<()>;

    async fn publish(
        &self,
        ctx: &BusContext,
        route: &RoutingKey,
        payload: Vec<u8>,
        mode: PublishMode,
    ) -> BusResult<()>;

    /// A handler for `route` has just been added to the registry
    async fn on_handler_add(&self, ctx: &BusContext, route: &RoutingKey) -> BusResult<()>;

    /// The last handler for `route` has just been removed from the registry
    async fn on_handlers_remove(&self, ctx: &BusContext, route: &RoutingKey) -> BusResult<()>;

    /// Stop native delivery, keeping enough state to resume
    async fn on_pause(&self, ctx: &BusContext) -> BusResult<()>;

    /// Re-establish delivery for every routing key in the registry
    async fn on_resume(&self, ctx: &BusContext) -> BusResult<()>;

    /// Native subscriptions currently held, for diagnostics
    async fn native_subscriptions(&self) -> Vec<String>;

    /// Stop background tasks and release the native handles
    async fn close(&self);
}

/// Abort a background task and wait until it has been torn down
pub(crate) async fn stop_task(handle: JoinHandle<()>) {
    handle.abort();
    if let Err(e) = handle.await {
        if e.is_panic() {
            tracing::warn!(error = %e, "background task panicked");
        }
    }
}
