use anyhow::{Context, Result};
use event_guidance::{Config, KafkaEventSource, PgMetricStore, Pipeline};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,event_guidance=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting event-guidance");

    let config = Config::from_env();
    config.log();

    let store = PgMetricStore::connect(&config.database_url, config.max_db_connections)
        .await
        .context("Failed to create database pool")?;

    let source = KafkaEventSource::new(&config).context("Failed to create Kafka consumer")?;

    let pipeline = Pipeline::new(source, store, config.batch_size);

    // Every pipeline error is fatal by design: log it, exit non-zero, and let
    // process supervision plus broker redelivery handle recovery.
    if let Err(e) = pipeline.run().await {
        tracing::error!("Pipeline terminated: {e}");
        return Err(e).context("pipeline terminated");
    }

    Ok(())
}
