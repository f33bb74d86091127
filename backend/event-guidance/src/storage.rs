use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;

use crate::error::Result;

/// The six arguments of the `insert_metric` stored procedure, in call order.
///
/// `properties_json` is already serialized by the accumulator; this layer
/// only moves it across the wire. Conflict resolution on `idempotency_id`
/// (insert, ignore duplicate key) lives in the procedure itself.
#[derive(Debug)]
pub struct MetricRow<'a> {
    pub organization_id: i64,
    pub customer_id: &'a str,
    pub event_name: &'a str,
    pub occurred_at: DateTime<Utc>,
    pub properties_json: &'a str,
    pub idempotency_id: &'a str,
}

/// Handle to the relational store, able to open one transaction per cycle.
#[async_trait]
pub trait MetricStore: Send + Sync {
    type Tx: MetricTx;

    async fn begin(&self) -> Result<Self::Tx>;
}

/// One open storage transaction. Consumed exactly once, by either `commit`
/// or `rollback`; `insert_metric` reports only whether the statement ran,
/// never whether the row was inserted or deduplicated.
#[async_trait]
pub trait MetricTx: Send {
    async fn insert_metric(&mut self, row: MetricRow<'_>) -> Result<()>;

    async fn commit(self) -> Result<()>;

    async fn rollback(self) -> Result<()>;
}

/// Postgres-backed [`MetricStore`] over a shared connection pool.
pub struct PgMetricStore {
    pool: PgPool,
}

impl PgMetricStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool and wrap it.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        info!(max_connections, "Postgres pool created");
        Ok(Self::new(pool))
    }
}

pub struct PgMetricTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl MetricStore for PgMetricStore {
    type Tx = PgMetricTx;

    async fn begin(&self) -> Result<PgMetricTx> {
        let tx = self.pool.begin().await?;
        Ok(PgMetricTx { tx })
    }
}

#[async_trait]
impl MetricTx for PgMetricTx {
    async fn insert_metric(&mut self, row: MetricRow<'_>) -> Result<()> {
        sqlx::query("SELECT insert_metric($1, $2, $3, $4, $5::jsonb, $6)")
            .bind(row.organization_id)
            .bind(row.customer_id)
            .bind(row.event_name)
            .bind(row.occurred_at)
            .bind(row.properties_json)
            .bind(row.idempotency_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
