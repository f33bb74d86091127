use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::event::NormalizedEvent;
use crate::storage::{MetricRow, MetricStore, MetricTx};

/// A bounded, in-flight unit of work: one open storage transaction plus the
/// count of rows inserted into it since the last commit.
///
/// One batch exists per fetch cycle. Reaching the threshold commits the open
/// transaction and resets the count; a replacement transaction is opened
/// lazily, only when the next record arrives. A batch is therefore never
/// partially committed and then continued on the same transaction, and a
/// cycle ending exactly on the threshold leaves nothing open to settle.
pub struct EventBatch<'a, S: MetricStore> {
    store: &'a S,
    tx: Option<S::Tx>,
    count: usize,
    threshold: usize,
}

impl<'a, S: MetricStore> EventBatch<'a, S> {
    /// Open the cycle's transaction and an empty batch over it.
    pub async fn begin(store: &'a S, threshold: usize) -> Result<Self> {
        let tx = store.begin().await?;
        Ok(Self {
            store,
            tx: Some(tx),
            count: 0,
            threshold,
        })
    }

    /// Insert one event. Returns `true` when this insert filled the batch
    /// and the transaction was committed.
    ///
    /// Properties are serialized before the insert is attempted; a
    /// serialization failure aborts the add. Statement and commit errors
    /// propagate uninterpreted, with no retry.
    pub async fn add_record(&mut self, event: &NormalizedEvent) -> Result<bool> {
        let properties_json =
            serde_json::to_string(&event.properties).map_err(PipelineError::Serialize)?;

        // Errors below are fatal to the cycle, so a transaction taken out of
        // the slot is simply abandoned when one occurs.
        let mut tx = match self.tx.take() {
            Some(tx) => tx,
            None => self.store.begin().await?,
        };

        tx.insert_metric(MetricRow {
            organization_id: event.organization_id,
            customer_id: &event.customer_id,
            event_name: &event.event_name,
            occurred_at: event.occurred_at,
            properties_json: &properties_json,
            idempotency_id: &event.idempotency_id,
        })
        .await?;

        self.count += 1;
        if self.count >= self.threshold {
            tx.commit().await?;
            debug!(count = self.count, "batch threshold reached, committed");
            self.count = 0;
            return Ok(true);
        }

        self.tx = Some(tx);
        Ok(false)
    }

    /// Rows inserted since the last commit.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Destroy the batch at the end of its cycle. Commits the transaction if
    /// any rows are uncommitted and returns `true`; rolls back a still-open
    /// empty transaction; does nothing when the final `add_record` already
    /// committed on the threshold.
    pub async fn settle(mut self) -> Result<bool> {
        match self.tx.take() {
            Some(tx) if self.count > 0 => {
                tx.commit().await?;
                debug!(count = self.count, "batch settled, committed remainder");
                Ok(true)
            }
            Some(tx) => {
                tx.rollback().await?;
                Ok(false)
            }
            None => Ok(false),
        }
    }
}
