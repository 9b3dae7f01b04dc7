use async_trait::async_trait;
use chrono::Utc;
use conveyor_domain::{NormalizedRecord, RecordSink, SinkError};
use serde_json::Value;
use tracing::debug;

use crate::client::PostgresClient;

/// PostgreSQL implementation of the idempotent record sink.
///
/// Records land in a JSONB table keyed by identity, with
/// `INSERT .. ON CONFLICT DO UPDATE` giving replace-by-identity semantics:
/// re-upserting the same record after a retry or redelivery leaves the same
/// stored state.
#[derive(Clone)]
pub struct PostgresRecordSink {
    client: PostgresClient,
    table: String,
}

impl PostgresRecordSink {
    pub fn new(client: PostgresClient, table: String) -> Self {
        Self { client, table }
    }

    /// Create the target table if it does not exist yet.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        let conn = self.client.get_connection().await?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                     identity TEXT PRIMARY KEY,
                     record JSONB NOT NULL,
                     first_seen_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                     updated_at TIMESTAMPTZ NOT NULL
                 )",
                self.table
            ),
            &[],
        )
        .await?;
        debug!(table = %self.table, "sink schema ensured");
        Ok(())
    }
}

#[async_trait]
impl RecordSink for PostgresRecordSink {
    async fn upsert(&self, record: &NormalizedRecord) -> Result<(), SinkError> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(SinkError::Transient)?;

        let now = Utc::now();
        let body = Value::Object(record.fields.clone());

        conn.execute(
            &format!(
                "INSERT INTO {} (identity, record, updated_at)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (identity)
                 DO UPDATE SET record = EXCLUDED.record, updated_at = EXCLUDED.updated_at",
                self.table
            ),
            &[&record.identity, &body, &now],
        )
        .await
        .map_err(classify)?;

        debug!(identity = %record.identity, table = %self.table, "record upserted");
        Ok(())
    }
}

/// Split database failures into the retryable and the hopeless.
///
/// SQLSTATE classes 22 (data), 23 (integrity) and 42 (syntax/schema) mean the
/// record itself can never be stored; everything else — closed connections,
/// timeouts, pool trouble — is worth retrying.
fn classify(error: tokio_postgres::Error) -> SinkError {
    let permanent = error
        .as_db_error()
        .map(|db| matches!(&db.code().code()[..2], "22" | "23" | "42"))
        .unwrap_or(false);

    if permanent {
        SinkError::Permanent(error.into())
    } else {
        SinkError::Transient(error.into())
    }
}
