use async_trait::async_trait;
use conveyor_domain::{MirrorError, OutcomeMirror, ProcessingOutcome};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ClickHouseClient;
use crate::models::OutcomeRow;

/// Create the audit table if it does not exist yet.
pub async fn ensure_outcomes_table(client: &ClickHouseClient, table: &str) -> anyhow::Result<()> {
    client
        .get_client()
        .query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                 partition UInt32,
                 `offset` UInt64,
                 identity Nullable(String),
                 status String,
                 error Nullable(String),
                 recorded_at DateTime
             ) ENGINE = MergeTree ORDER BY (partition, `offset`)",
            table
        ))
        .execute()
        .await?;
    debug!(table = %table, "outcomes table ensured");
    Ok(())
}

/// Build the mirror handle and its background flusher as a pair sharing a
/// bounded channel of `capacity` outcomes.
pub fn buffered_mirror(
    client: ClickHouseClient,
    table: String,
    capacity: usize,
    flush_interval: Duration,
    flush_max_batch: usize,
) -> (BufferedOutcomeMirror, OutcomeFlusher) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        BufferedOutcomeMirror { tx },
        OutcomeFlusher {
            rx,
            client,
            table,
            flush_interval,
            flush_max_batch,
        },
    )
}

/// Fire-and-forget mirror front end: `record` only enqueues.
///
/// A full buffer surfaces as a `MirrorError` and the outcome is dropped by
/// the caller — the pipeline must never wait on the warehouse.
#[derive(Clone)]
pub struct BufferedOutcomeMirror {
    tx: mpsc::Sender<ProcessingOutcome>,
}

#[async_trait]
impl OutcomeMirror for BufferedOutcomeMirror {
    async fn record(&self, outcome: ProcessingOutcome) -> Result<(), MirrorError> {
        self.tx
            .try_send(outcome)
            .map_err(|e| MirrorError(anyhow::anyhow!("outcome buffer unavailable: {}", e)))
    }
}

/// Background process draining the outcome buffer into ClickHouse.
///
/// Flushes when `flush_max_batch` outcomes have accumulated or
/// `flush_interval` elapses, whichever comes first. Insert failures are
/// logged and the rows dropped. On shutdown the remaining buffer is drained
/// and flushed once.
pub struct OutcomeFlusher {
    rx: mpsc::Receiver<ProcessingOutcome>,
    client: ClickHouseClient,
    table: String,
    flush_interval: Duration,
    flush_max_batch: usize,
}

impl OutcomeFlusher {
    pub async fn run(mut self, ctx: CancellationToken) -> anyhow::Result<()> {
        info!(table = %self.table, "starting outcome flusher");

        let mut buffer: Vec<ProcessingOutcome> = Vec::with_capacity(self.flush_max_batch);
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    // Drain whatever is still queued before exiting
                    while let Ok(outcome) = self.rx.try_recv() {
                        buffer.push(outcome);
                    }
                    self.flush(&mut buffer).await;
                    break;
                }
                _ = ticker.tick() => {
                    self.flush(&mut buffer).await;
                }
                received = self.rx.recv() => match received {
                    Some(outcome) => {
                        buffer.push(outcome);
                        if buffer.len() >= self.flush_max_batch {
                            self.flush(&mut buffer).await;
                        }
                    }
                    None => {
                        self.flush(&mut buffer).await;
                        break;
                    }
                },
            }
        }

        info!(table = %self.table, "outcome flusher stopped");
        Ok(())
    }

    /// Best-effort batch insert; rows are dropped on failure.
    async fn flush(&self, buffer: &mut Vec<ProcessingOutcome>) {
        if buffer.is_empty() {
            return;
        }

        let rows: Vec<OutcomeRow> = buffer.iter().map(OutcomeRow::from).collect();
        let count = rows.len();

        let result = async {
            let mut insert = self.client.get_client().insert::<OutcomeRow>(&self.table)?;
            for row in &rows {
                insert.write(row).await?;
            }
            insert.end().await
        }
        .await;

        match result {
            Ok(()) => {
                debug!(rows_inserted = count, table = %self.table, "flushed outcome batch");
            }
            Err(e) => {
                warn!(
                    dropped_rows = count,
                    table = %self.table,
                    error = %e,
                    "failed to flush outcomes, dropping batch"
                );
            }
        }

        buffer.clear();
    }
}
