use crate::client::MaterializeClient;
use anyhow::anyhow;
use async_trait::async_trait;
use bidwatch_domain::{CheckpointStore, DomainError, DomainResult, Timestamp};
use chrono::Utc;
use tracing::debug;

/// Checkpoint persistence in a SQL table reached over the same wire
/// protocol as the feed.
///
/// The replace is a delete-then-insert inside one transaction, so a
/// concurrent reader never observes the prior checkpoint gone with the new
/// one absent. Materialize tables have no `ON CONFLICT`; the same
/// statements work unchanged against vanilla Postgres.
pub struct SqlCheckpointStore {
    client: MaterializeClient,
}

impl SqlCheckpointStore {
    pub fn new(client: MaterializeClient) -> Self {
        Self { client }
    }

    /// Creates the checkpoint table when absent.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        let conn = self.client.get_connection().await?;
        conn.batch_execute(
            "CREATE TABLE IF NOT EXISTS notify_checkpoints (
                subscription TEXT NOT NULL,
                last_completed_ts BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )",
        )
        .await?;
        debug!("checkpoint table ready");
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for SqlCheckpointStore {
    async fn read_latest(&self, subscription: &str) -> DomainResult<Option<Timestamp>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::Store)?;
        let row = conn
            .query_opt(
                "SELECT last_completed_ts FROM notify_checkpoints WHERE subscription = $1",
                &[&subscription],
            )
            .await
            .map_err(|e| DomainError::Store(e.into()))?;

        match row {
            None => Ok(None),
            Some(row) => {
                let stored: i64 = row.get(0);
                let ts = Timestamp::try_from(stored).map_err(|_| {
                    DomainError::Store(anyhow!("stored checkpoint {stored} is negative"))
                })?;
                Ok(Some(ts))
            }
        }
    }

    async fn replace(&self, subscription: &str, ts: Timestamp) -> DomainResult<()> {
        let ts_value = i64::try_from(ts).map_err(|_| {
            DomainError::Store(anyhow!("checkpoint {ts} exceeds the storable range"))
        })?;

        let mut conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::Store)?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DomainError::Store(e.into()))?;
        tx.execute(
            "DELETE FROM notify_checkpoints WHERE subscription = $1",
            &[&subscription],
        )
        .await
        .map_err(|e| DomainError::Store(e.into()))?;
        tx.execute(
            "INSERT INTO notify_checkpoints (subscription, last_completed_ts, updated_at) \
             VALUES ($1, $2, $3)",
            &[&subscription, &ts_value, &Utc::now()],
        )
        .await
        .map_err(|e| DomainError::Store(e.into()))?;
        tx.commit()
            .await
            .map_err(|e| DomainError::Store(e.into()))?;

        debug!(subscription, checkpoint = ts, "checkpoint replaced");
        Ok(())
    }
}
