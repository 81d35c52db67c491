//! Feed backend example
//!
//! Wires a PostgreSQL pool, a notification dispatcher, an event gateway and a
//! static asset catalog through one registry. Nothing connects at
//! registration time; the batch provide below brings up exactly what it
//! needs (the pool comes up implicitly, requested by the notifications
//! service), and teardown releases everything in reverse acquisition order.
//!
//! Expects a reachable database and feed, overridable through `DATABASE_URL`
//! and `GATEWAY_ADDRESS`.

use std::time::Duration;

use anyhow::Result;
use quartermaster::{Registry, RetryPolicy};
use quartermaster_examples::gateway::{self, GatewayConfig};
use quartermaster_examples::notifications::{self, Recipient};
use quartermaster_examples::{assets, POSTGRES};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("starting feed example");

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/quartermaster_feed".to_string());
    let gateway_address =
        std::env::var("GATEWAY_ADDRESS").unwrap_or_else(|_| "127.0.0.1:7878".to_string());

    let registry = Registry::new();
    registry.register(POSTGRES, quartermaster_postgres::lifecycle(database_url))?;
    registry.register(
        notifications::NOTIFICATIONS,
        notifications::lifecycle(Duration::from_secs(2)),
    )?;
    registry.register(
        gateway::GATEWAY,
        gateway::lifecycle(GatewayConfig::new(gateway_address).with_connect_retry(
            RetryPolicy::every(Duration::from_secs(5)).with_max_attempts(12),
        )),
    )?;
    registry.register(assets::ASSETS, assets::lifecycle("http://assets.local"))?;

    info!("bringing up the notification dispatcher and the gateway feed");
    let (notifications_service, gateway_transport) = registry
        .provide((notifications::NOTIFICATIONS, gateway::GATEWAY))
        .await?;

    let recipient = Recipient::try_new("ops@example.com".to_string())?;
    notifications_service
        .notify(&recipient, "feed example started")
        .await?;
    info!("queued a startup notification");

    info!("waiting for one gateway event");
    match tokio::time::timeout(Duration::from_secs(10), gateway_transport.next_event()).await {
        Ok(Some(event)) => info!(?event, "received gateway event"),
        Ok(None) => info!("gateway event stream ended"),
        Err(_) => info!("no gateway event within 10 seconds"),
    }

    let catalog = registry.provide_one(assets::ASSETS).await?;
    info!(url = %catalog.url_for("banner.png"), "resolved an asset url");

    info!("shutting down");
    let failures = registry.cleanup().await;
    if !failures.is_empty() {
        for failure in &failures {
            error!(key = %failure.key, error = %failure.error, "release failed");
        }
        anyhow::bail!("cleanup finished with {} failure(s)", failures.len());
    }

    info!("feed example completed successfully");
    Ok(())
}
