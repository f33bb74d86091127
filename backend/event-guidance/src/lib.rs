//! Event guidance: bridges the events Kafka topic and the metrics store.
//!
//! Consumes raw event envelopes, decodes them into normalized events, persists
//! them in bounded transactions through the `insert_metric` stored procedure,
//! and advances consumed offsets only after the covering storage commit
//! succeeds. At-least-once delivery; duplicates are absorbed downstream by the
//! idempotency-key conflict policy.

pub mod batch;
pub mod config;
pub mod error;
pub mod event;
pub mod pipeline;
pub mod storage;

pub use config::Config;
pub use error::{PipelineError, Result};
pub use event::{decode_record, NormalizedEvent};
pub use pipeline::{EventSource, KafkaEventSource, Pipeline};
pub use storage::PgMetricStore;
