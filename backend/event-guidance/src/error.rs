use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error taxonomy for the ingest pipeline.
///
/// Every variant is fatal: the coordinator never skips a malformed record or
/// retries a failed insert, because doing so could silently lose data with no
/// offset/storage discrepancy left behind to detect it. Recovery is process
/// restart + broker redelivery + the storage layer's idempotency key.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed event payload: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("unparsable event timestamp: {value:?}")]
    MalformedTimestamp { value: String },

    #[error("envelope carries neither a singular event nor a non-empty event list")]
    EmptyEnvelope,

    #[error("failed to encode event properties: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("offset commit failed: {0}")]
    OffsetCommit(#[source] rdkafka::error::KafkaError),
}

impl PipelineError {
    /// True for errors produced while decoding a record payload, as opposed
    /// to broker or storage failures.
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            PipelineError::Decode(_)
                | PipelineError::MalformedTimestamp { .. }
                | PipelineError::EmptyEnvelope
        )
    }
}
