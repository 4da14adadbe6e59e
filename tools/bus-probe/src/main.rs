use anyhow::Context;
use clap::Parser;
use event_bus_client::{
    BusConfig, EventBusClient, EventEnvelope, JsonSerializer, LogMessage, LogSeverity,
    MessageHandler, Serializer,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Connect to the configured event bus, publish probe log messages and
/// report how many came back.
///
/// Bus settings come from the environment (and `.env`); flags override them.
#[derive(Debug, Parser)]
#[command(name = "bus-probe", version)]
struct Args {
    /// Bus to probe (EVENT_BUS_ID)
    #[arg(long)]
    bus_id: Option<String>,

    /// Application id the probe connects as (APP_ID)
    #[arg(long)]
    app_id: Option<String>,

    /// Connector family: log, queue or pubsub (BUS_CONNECTOR)
    #[arg(long)]
    connector: Option<String>,

    /// Transport: nats or inmemory (BUS_TYPE)
    #[arg(long)]
    bus_type: Option<String>,

    /// Number of probe messages to publish
    #[arg(long, env = "PROBE_COUNT", default_value_t = 3)]
    count: usize,

    /// Seconds to wait for the probes to come back
    #[arg(long, env = "PROBE_WAIT_SECS", default_value_t = 5)]
    wait_secs: u64,

    /// Publish without waiting for broker confirmation
    #[arg(long)]
    nowait: bool,
}

impl Args {
    fn overrides(&self) -> HashMap<&'static str, String> {
        [
            ("EVENT_BUS_ID", &self.bus_id),
            ("APP_ID", &self.app_id),
            ("BUS_CONNECTOR", &self.connector),
            ("BUS_TYPE", &self.bus_type),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.clone().map(|v| (key, v)))
        .collect()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let overrides = args.overrides();
    let config = BusConfig::from_lookup(|key| {
        overrides
            .get(key)
            .cloned()
            .or_else(|| std::env::var(key).ok())
    })
    .map_err(anyhow::Error::msg)
    .context("Failed to load bus configuration")?;

    tracing::info!(
        "Configuration loaded: bus_id={}, app_id={}, connector={}, bus_type={:?}",
        config.bus_id,
        config.app_id,
        config.connector,
        config.bus_type
    );

    let client = EventBusClient::from_config(&config, JsonSerializer);
    if !client.connect().await {
        anyhow::bail!("can't connect to the {} bus '{}'", config.connector, config.bus_id);
    }

    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    client
        .add_handler(MessageHandler::<LogMessage>::new("bus-probe", move |envelope| {
            let counter = counter.clone();
            async move {
                let seen = counter.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::info!(
                    message_id = %envelope.message_id(),
                    seen,
                    "probe received: {}",
                    envelope.payload().message
                );
                Ok(())
            }
        }))
        .await
        .context("Failed to register probe handler")?;

    for i in 1..=args.count {
        let message = EventEnvelope::new(LogMessage::new(
            LogSeverity::Info,
            format!("probe {} of {} from {}", i, args.count, config.app_id),
        ));
        let wire = JsonSerializer
            .encode_to_string(&message)
            .with_context(|| format!("Failed to encode probe {}", i))?;
        tracing::debug!(message_id = %message.message_id(), "publishing {}", wire);

        let result = if args.nowait {
            client.publish_message_nowait(&message).await
        } else {
            client.publish_message(&message).await
        };
        result.with_context(|| format!("Failed to publish probe {}", i))?;
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.wait_secs);
    while received.load(Ordering::SeqCst) < args.count && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let seen = received.load(Ordering::SeqCst);
    tracing::info!(published = args.count, received = seen, "probe finished");
    client.dispose().await;

    if seen < args.count {
        anyhow::bail!("only {} of {} probes came back", seen, args.count);
    }
    Ok(())
}
