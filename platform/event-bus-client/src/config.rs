//! Client configuration loaded from the environment
//!
//! `APP_ID` is required; everything else has a default. Unknown `BUS_TYPE`
//! values fall back to the in-memory transports with a warning.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::client::{ClientOptions, DuplicatePolicy};
use crate::dispatch::DEFAULT_POLL_INTERVAL;
use crate::transport::NatsEndpoint;

/// Which connector family a client uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorKind {
    Log,
    Queue,
    PubSub,
}

impl ConnectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorKind::Log => "log",
            ConnectorKind::Queue => "queue",
            ConnectorKind::PubSub => "pubsub",
        }
    }
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "log" => Ok(ConnectorKind::Log),
            "queue" => Ok(ConnectorKind::Queue),
            "pubsub" => Ok(ConnectorKind::PubSub),
            other => Err(format!(
                "Invalid BUS_CONNECTOR: {}. Must be 'log', 'queue' or 'pubsub'",
                other
            )),
        }
    }
}

/// Which transport implementation backs the connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    Nats,
    InMemory,
}

impl BusType {
    fn parse_or_default(raw: Option<String>) -> Self {
        match raw
            .unwrap_or_else(|| "inmemory".to_string())
            .to_lowercase()
            .as_str()
        {
            "nats" => BusType::Nats,
            "inmemory" => BusType::InMemory,
            other => {
                tracing::warn!(bus_type = %other, "Unknown BUS_TYPE, defaulting to inmemory");
                BusType::InMemory
            }
        }
    }
}

/// Event bus configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub bus_id: String,
    pub app_id: String,
    pub connector: ConnectorKind,
    pub bus_type: BusType,
    pub nats_url: String,
    pub nats_user: Option<String>,
    pub nats_password: Option<String>,
    pub poll_interval: Duration,
    pub duplicate_policy: DuplicatePolicy,
}

impl BusConfig {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key/value source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bus_id = non_empty("EVENT_BUS_ID").unwrap_or_else(|| "events".to_string());
        let app_id = non_empty("APP_ID").ok_or_else(|| "APP_ID must be set".to_string())?;

        let connector = match non_empty("BUS_CONNECTOR") {
            Some(raw) => raw.parse()?,
            None => ConnectorKind::PubSub,
        };
        let bus_type = BusType::parse_or_default(non_empty("BUS_TYPE"));

        let nats_url =
            non_empty("NATS_URL").unwrap_or_else(|| NatsEndpoint::DEFAULT_URL.to_string());

        let poll_interval = match non_empty("BUS_POLL_INTERVAL_MS") {
            Some(raw) => {
                let millis: u64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| "BUS_POLL_INTERVAL_MS must be a valid u64".to_string())?;
                if millis == 0 {
                    return Err("BUS_POLL_INTERVAL_MS must be greater than zero".to_string());
                }
                Duration::from_millis(millis)
            }
            None => DEFAULT_POLL_INTERVAL,
        };

        let duplicate_policy = match non_empty("BUS_DUPLICATE_HANDLERS")
            .map(|v| v.to_lowercase())
            .as_deref()
        {
            None | Some("allow") => DuplicatePolicy::Allow,
            Some("reject") => DuplicatePolicy::Reject,
            Some(other) => {
                return Err(format!(
                    "Invalid BUS_DUPLICATE_HANDLERS: {}. Must be 'allow' or 'reject'",
                    other
                ))
            }
        };

        Ok(Self {
            bus_id,
            app_id,
            connector,
            bus_type,
            nats_url,
            nats_user: non_empty("NATS_USER"),
            nats_password: non_empty("NATS_PASSWORD"),
            poll_interval,
            duplicate_policy,
        })
    }

    pub fn nats_endpoint(&self) -> NatsEndpoint {
        let endpoint = NatsEndpoint::new(self.nats_url.clone());
        match (&self.nats_user, &self.nats_password) {
            (Some(user), Some(password)) => endpoint.with_credentials(user.clone(), password.clone()),
            _ => endpoint,
        }
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            duplicate_policy: self.duplicate_policy,
            poll_interval: self.poll_interval,
        }
    }
}
