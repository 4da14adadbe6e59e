//! Connection handling shared by the NATS-backed transports

use async_nats::connection::State;
use async_nats::{Client, ConnectOptions};
use std::sync::{PoisonError, RwLock};

use crate::{BusError, BusResult};

/// Where and how to reach a NATS server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatsEndpoint {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl NatsEndpoint {
    pub const DEFAULT_URL: &'static str = "nats://localhost:4222";

    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }
}

impl Default for NatsEndpoint {
    fn default() -> Self {
        Self::new(Self::DEFAULT_URL)
    }
}

/// Lazily opened NATS client
///
/// Built either from an endpoint, in which case the first `connect` dials the
/// server, or from a client the caller already connected.
pub(crate) struct NatsConnection {
    endpoint: Option<NatsEndpoint>,
    client: RwLock<Option<Client>>,
}

impl NatsConnection {
    pub(crate) fn from_endpoint(endpoint: NatsEndpoint) -> Self {
        Self {
            endpoint: Some(endpoint),
            client: RwLock::new(None),
        }
    }

    pub(crate) fn from_client(client: Client) -> Self {
        Self {
            endpoint: None,
            client: RwLock::new(Some(client)),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|client| client.connection_state() == State::Connected)
    }

    /// Return the live client, dialing the endpoint if there is none yet
    pub(crate) async fn connect(&self, name: &str) -> BusResult<Client> {
        if let Some(client) = self.existing() {
            return Ok(client);
        }

        let endpoint = self.endpoint.as_ref().ok_or_else(|| {
            BusError::ConnectionError("NATS client was closed and has no endpoint to redial".to_string())
        })?;

        let mut options = ConnectOptions::new().name(name);
        if let (Some(user), Some(password)) = (&endpoint.user, &endpoint.password) {
            options = options.user_and_password(user.clone(), password.clone());
        }

        let client = options.connect(endpoint.url.as_str()).await.map_err(|e| {
            BusError::ConnectionError(format!("failed to connect to {}: {}", endpoint.url, e))
        })?;

        tracing::info!(url = %endpoint.url, name = %name, "connected to NATS");
        *self.client.write().unwrap_or_else(PoisonError::into_inner) = Some(client.clone());
        Ok(client)
    }

    /// The connected client, or a `ConnectionError` if `connect` has not run
    pub(crate) fn client(&self) -> BusResult<Client> {
        self.existing()
            .ok_or_else(|| BusError::ConnectionError("not connected to NATS".to_string()))
    }

    fn existing(&self) -> Option<Client> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Flush pending publishes and forget the client
    pub(crate) async fn close(&self) {
        let client = self
            .client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(client) = client {
            if let Err(e) = client.flush().await {
                tracing::debug!(error = %e, "flush on close failed");
            }
        }
    }
}

/// Turn arbitrary text into a valid JetStream stream/consumer name
pub(crate) fn object_name(prefix: &str, raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' | '/' | '\\' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();
    format!("{}-{}", prefix, cleaned)
}
