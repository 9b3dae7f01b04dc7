use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::error::{BrokerError, SinkError};
use crate::pipeline::{MessageSource, OutcomeMirror, RecordSink};
use crate::transform::Transform;
use crate::types::{Checkpoint, ProcessingOutcome, RawMessage};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Most messages pulled per poll; also bounds crash redelivery.
    pub max_batch: usize,
    /// How long a poll may wait for messages before returning empty.
    pub poll_timeout: Duration,
    /// Shared budget of transient-failure retries per batch. Once spent,
    /// further transient failures demote messages to `Failed`.
    pub retry_budget: u32,
    pub backoff: BackoffPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_batch: 64,
            poll_timeout: Duration::from_secs(5),
            retry_budget: 5,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// How one polled batch ended.
enum BatchDisposition {
    /// Every message reached a terminal outcome and the batch was committed.
    Committed,
    /// Outcomes are terminal but the commit was abandoned after repeated
    /// transient failures; the broker will redeliver the batch.
    CommitAbandoned,
    /// Shutdown arrived mid-batch; the remainder is left for redelivery.
    ShutdownRequested,
}

/// Per-partition pipeline driver.
///
/// Wires source → transform → sink → acknowledge → mirror with retry and
/// backoff. Exactly one coordinator owns a partition's offset cursor;
/// partitions scale by running independent coordinators.
///
/// Steady-state processing failures never escape the loop. The only hard
/// exits are cancellation and an out-of-order acknowledge, which indicates a
/// bug rather than an operational fault.
pub struct Coordinator {
    partition: u32,
    source: Arc<dyn MessageSource>,
    transform: Arc<dyn Transform>,
    sink: Arc<dyn RecordSink>,
    mirror: Arc<dyn OutcomeMirror>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(
        partition: u32,
        source: Arc<dyn MessageSource>,
        transform: Arc<dyn Transform>,
        sink: Arc<dyn RecordSink>,
        mirror: Arc<dyn OutcomeMirror>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            partition,
            source,
            transform,
            sink,
            mirror,
            config,
        }
    }

    pub async fn run(&self, ctx: CancellationToken) -> anyhow::Result<()> {
        info!(partition = self.partition, "starting coordinator loop");

        let mut checkpoint = Checkpoint::new(self.partition);
        let mut poll_failures: u32 = 0;

        loop {
            let polled = tokio::select! {
                _ = ctx.cancelled() => {
                    info!(partition = self.partition, "received shutdown signal");
                    break;
                }
                polled = self.source.poll(self.config.max_batch, self.config.poll_timeout) => polled,
            };

            match polled {
                Ok(batch) => {
                    poll_failures = 0;

                    let Some(last_offset) = batch.last().map(|m| m.offset) else {
                        debug!(partition = self.partition, "empty poll");
                        continue;
                    };

                    match self.process_batch(&batch, last_offset, &ctx).await? {
                        BatchDisposition::Committed => {
                            checkpoint.advance(last_offset)?;
                            debug!(
                                partition = self.partition,
                                committed = last_offset,
                                "checkpoint advanced"
                            );
                        }
                        BatchDisposition::CommitAbandoned => {
                            warn!(
                                partition = self.partition,
                                offset = last_offset,
                                "batch commit abandoned, broker will redeliver"
                            );
                        }
                        BatchDisposition::ShutdownRequested => {
                            info!(
                                partition = self.partition,
                                "shutdown during batch, leaving unacknowledged messages for redelivery"
                            );
                            break;
                        }
                    }
                }
                Err(BrokerError::Transient(e)) => {
                    warn!(
                        partition = self.partition,
                        error = %e,
                        consecutive_failures = poll_failures + 1,
                        "poll failed, backing off"
                    );
                    if !self.backoff_wait(poll_failures, &ctx).await {
                        break;
                    }
                    poll_failures += 1;
                }
                Err(err @ BrokerError::OutOfOrderAck { .. }) => {
                    error!(partition = self.partition, error = %err, "broker ordering invariant violated");
                    return Err(err.into());
                }
            }
        }

        info!(partition = self.partition, "coordinator stopped");
        Ok(())
    }

    /// Drive every message of the batch to a terminal outcome, then commit
    /// the batch's last offset and mirror the outcomes.
    async fn process_batch(
        &self,
        batch: &[RawMessage],
        last_offset: u64,
        ctx: &CancellationToken,
    ) -> Result<BatchDisposition, BrokerError> {
        debug!(
            partition = self.partition,
            message_count = batch.len(),
            "processing batch"
        );

        let mut outcomes = Vec::with_capacity(batch.len());
        let mut retries_left = self.config.retry_budget;

        for message in batch {
            match self.process_message(message, &mut retries_left, ctx).await {
                Some(outcome) => outcomes.push(outcome),
                None => return Ok(BatchDisposition::ShutdownRequested),
            }
        }

        let committed = self.acknowledge_with_retry(last_offset, ctx).await?;
        self.record_outcomes(outcomes).await;

        Ok(if committed {
            BatchDisposition::Committed
        } else {
            BatchDisposition::CommitAbandoned
        })
    }

    /// Transform and upsert one message. Returns its terminal outcome, or
    /// `None` when shutdown interrupted a backoff wait.
    async fn process_message(
        &self,
        message: &RawMessage,
        retries_left: &mut u32,
        ctx: &CancellationToken,
    ) -> Option<ProcessingOutcome> {
        let record = match self.transform.transform(message) {
            Ok(record) => record,
            Err(rejection) => {
                warn!(
                    partition = self.partition,
                    offset = message.offset,
                    reason = %rejection.reason,
                    "message rejected"
                );
                return Some(ProcessingOutcome::rejected(
                    message,
                    rejection.identity,
                    rejection.reason.to_string(),
                ));
            }
        };

        let mut attempt: u32 = 0;
        loop {
            match self.sink.upsert(&record).await {
                Ok(()) => {
                    debug!(
                        partition = self.partition,
                        offset = message.offset,
                        identity = %record.identity,
                        "record upserted"
                    );
                    return Some(ProcessingOutcome::success(message, record.identity));
                }
                Err(SinkError::Permanent(e)) => {
                    warn!(
                        partition = self.partition,
                        offset = message.offset,
                        identity = %record.identity,
                        error = %e,
                        "permanent sink failure, not retrying"
                    );
                    return Some(ProcessingOutcome::failed(
                        message,
                        Some(record.identity),
                        e.to_string(),
                    ));
                }
                Err(SinkError::Transient(e)) => {
                    if *retries_left == 0 {
                        error!(
                            partition = self.partition,
                            offset = message.offset,
                            identity = %record.identity,
                            error = %e,
                            "retry budget exhausted, demoting message to failed"
                        );
                        return Some(ProcessingOutcome::failed(
                            message,
                            Some(record.identity),
                            format!("retry budget exhausted: {}", e),
                        ));
                    }
                    *retries_left -= 1;
                    warn!(
                        partition = self.partition,
                        offset = message.offset,
                        error = %e,
                        retries_left = *retries_left,
                        "transient sink failure, backing off"
                    );
                    if !self.backoff_wait(attempt, ctx).await {
                        return None;
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Commit `offset`. Transient failures are retried up to the batch retry
    /// budget; an abandoned commit is safe because the sink is idempotent
    /// under redelivery. Out-of-order commits propagate as hard errors.
    async fn acknowledge_with_retry(
        &self,
        offset: u64,
        ctx: &CancellationToken,
    ) -> Result<bool, BrokerError> {
        let mut attempt: u32 = 0;
        loop {
            match self.source.acknowledge(offset).await {
                Ok(()) => return Ok(true),
                Err(err @ BrokerError::OutOfOrderAck { .. }) => return Err(err),
                Err(BrokerError::Transient(e)) => {
                    if attempt >= self.config.retry_budget {
                        error!(
                            partition = self.partition,
                            offset,
                            error = %e,
                            "giving up on acknowledge, batch will be redelivered"
                        );
                        return Ok(false);
                    }
                    warn!(
                        partition = self.partition,
                        offset,
                        error = %e,
                        "acknowledge failed, backing off"
                    );
                    if !self.backoff_wait(attempt, ctx).await {
                        return Ok(false);
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Fire-and-forget outcome recording; a lost row costs observability,
    /// never correctness.
    async fn record_outcomes(&self, outcomes: Vec<ProcessingOutcome>) {
        for outcome in outcomes {
            let offset = outcome.offset;
            if let Err(e) = self.mirror.record(outcome).await {
                warn!(
                    partition = self.partition,
                    offset,
                    error = %e,
                    "failed to mirror outcome, dropping"
                );
            }
        }
    }

    /// Sleep for the backoff delay of `attempt`. Returns false when shutdown
    /// interrupted the wait.
    async fn backoff_wait(&self, attempt: u32, ctx: &CancellationToken) -> bool {
        let delay = self.config.backoff.delay(attempt);
        debug!(
            partition = self.partition,
            delay_ms = delay.as_millis() as u64,
            "backing off"
        );
        tokio::select! {
            _ = ctx.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
