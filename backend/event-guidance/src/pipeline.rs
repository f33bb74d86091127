use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use tracing::{debug, error, info};

use crate::batch::EventBatch;
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::event::decode_record;
use crate::storage::MetricStore;

/// One record out of a fetch result: the opaque payload plus the position it
/// was read from.
#[derive(Debug, Clone)]
pub struct FetchedRecord {
    pub payload: Vec<u8>,
    pub partition: i32,
    pub offset: i64,
}

/// The narrow broker surface the coordinator consumes.
///
/// `fetch` blocks until the broker yields at least one record or fails in a
/// non-retriable way; records are returned in delivery order, which defines
/// replay order on restart. `commit_consumed` durably advances the consumed
/// position for everything fetched so far.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<FetchedRecord>>;

    async fn commit_consumed(&self) -> Result<()>;
}

/// Kafka-backed [`EventSource`] over an rdkafka `StreamConsumer`.
///
/// Auto-commit is disabled; offsets advance only through `commit_consumed`,
/// which the coordinator calls strictly after the storage commit covering
/// those records. Broker-internal retries are exhausted before an error
/// surfaces from `recv`, so any error here is fatal.
pub struct KafkaEventSource {
    consumer: StreamConsumer,
    max_fetch_records: usize,
}

impl KafkaEventSource {
    pub fn new(config: &Config) -> Result<Self> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("group.id", &config.group_id)
            .set("bootstrap.servers", &config.kafka_brokers)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .set("enable.partition.eof", "false");

        if let (Some(username), Some(password)) = (&config.sasl_username, &config.sasl_password) {
            client_config
                .set("security.protocol", "SASL_SSL")
                .set("sasl.mechanisms", "SCRAM-SHA-512")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        let consumer: StreamConsumer = client_config.create().map_err(|e| {
            error!("Failed to create Kafka consumer: {}", e);
            PipelineError::Kafka(e)
        })?;

        consumer.subscribe(&[&config.topic]).map_err(|e| {
            error!("Failed to subscribe to topic {}: {}", config.topic, e);
            PipelineError::Kafka(e)
        })?;

        info!(topic = %config.topic, group = %config.group_id, "Kafka consumer subscribed");

        Ok(Self {
            consumer,
            max_fetch_records: config.max_fetch_records,
        })
    }

    fn to_record(msg: &BorrowedMessage<'_>) -> FetchedRecord {
        FetchedRecord {
            payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            partition: msg.partition(),
            offset: msg.offset(),
        }
    }
}

#[async_trait]
impl EventSource for KafkaEventSource {
    async fn fetch(&self) -> Result<Vec<FetchedRecord>> {
        // Block for the first record, then drain whatever the client has
        // already buffered without waiting, preserving delivery order.
        let first = self.consumer.recv().await?;
        debug!(
            partition = first.partition(),
            offset = first.offset(),
            "received record"
        );
        let mut records = vec![Self::to_record(&first)];

        while records.len() < self.max_fetch_records {
            match tokio::time::timeout(Duration::ZERO, self.consumer.recv()).await {
                Ok(Ok(msg)) => {
                    debug!(
                        partition = msg.partition(),
                        offset = msg.offset(),
                        "received record"
                    );
                    records.push(Self::to_record(&msg));
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => break,
            }
        }

        Ok(records)
    }

    async fn commit_consumed(&self) -> Result<()> {
        self.consumer
            .commit_consumer_state(CommitMode::Sync)
            .map_err(PipelineError::OffsetCommit)
    }
}

/// Drives the fetch → decode → accumulate → insert → commit-offset cycle.
///
/// The one correctness property everything hangs on: a broker offset is never
/// advanced before the storage transaction containing its events has been
/// durably committed. A crash between the two re-fetches already-persisted
/// events on restart, and the stored procedure's idempotency-key conflict
/// policy absorbs the replay.
pub struct Pipeline<B, S> {
    source: B,
    store: S,
    batch_size: usize,
}

impl<B: EventSource, S: MetricStore> Pipeline<B, S> {
    pub fn new(source: B, store: S, batch_size: usize) -> Self {
        Self {
            source,
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Run fetch cycles until a fatal error.
    ///
    /// Every error path terminates the loop: no record is skipped, no insert
    /// retried, no inconsistent state left running. Supervision restarts the
    /// process and redelivery takes over from the last committed offset.
    pub async fn run(&self) -> Result<()> {
        info!(batch_size = self.batch_size, "starting event fetch loop");
        loop {
            self.run_cycle().await?;
        }
    }

    /// One Polling → Draining → Settling cycle.
    pub async fn run_cycle(&self) -> Result<()> {
        let records = self.source.fetch().await?;
        debug!(records = records.len(), "draining fetch result");

        let mut batch = EventBatch::begin(&self.store, self.batch_size).await?;

        for record in &records {
            let event = decode_record(&record.payload).map_err(|e| {
                error!(
                    partition = record.partition,
                    offset = record.offset,
                    "failed to decode record: {e}"
                );
                e
            })?;
            if batch.add_record(&event).await? {
                self.source.commit_consumed().await?;
            }
        }

        if batch.settle().await? {
            self.source.commit_consumed().await?;
        }

        Ok(())
    }
}
