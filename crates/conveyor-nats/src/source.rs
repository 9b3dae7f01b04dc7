use anyhow::{anyhow, Context, Result};
use async_nats::jetstream::{self, consumer::PullConsumer, Message};
use async_trait::async_trait;
use chrono::Utc;
use conveyor_domain::{BrokerError, MessageSource, RawMessage};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Messages fetched but not yet committed, keyed by stream sequence.
struct Pending<M> {
    messages: BTreeMap<u64, M>,
    committed: Option<u64>,
}

impl<M> Default for Pending<M> {
    fn default() -> Self {
        Self {
            messages: BTreeMap::new(),
            committed: None,
        }
    }
}

impl<M> Pending<M> {
    fn insert(&mut self, offset: u64, message: M) {
        self.messages.insert(offset, message);
    }

    /// Drop entries below `floor`. Once the broker restarts delivery at
    /// `floor`, nothing older can be the target of a commit anymore, so
    /// keeping those entries would grow the map across abandoned commits.
    fn prune_below(&mut self, floor: u64) {
        self.messages = self.messages.split_off(&floor);
    }

    /// Record a cumulative commit and discard everything it covered.
    fn commit_up_to(&mut self, offset: u64) {
        self.committed = Some(offset);
        self.messages = self.messages.split_off(&(offset + 1));
    }
}

/// JetStream-backed message source for one partition.
///
/// The durable consumer uses `AckPolicy::All`, so acknowledging one message
/// commits everything before it — the same cumulative-offset semantics the
/// coordinator's checkpoint expects. Fetched messages stay pending until the
/// coordinator acknowledges their offset.
pub struct JetStreamSource {
    consumer: PullConsumer,
    partition: u32,
    pending: Mutex<Pending<Message>>,
}

impl JetStreamSource {
    pub async fn new(
        jetstream: &jetstream::Context,
        stream_name: &str,
        consumer_name: &str,
        subject_filter: &str,
        partition: u32,
    ) -> Result<Self> {
        debug!(
            stream = stream_name,
            consumer = consumer_name,
            subject = subject_filter,
            partition,
            "Creating JetStream consumer"
        );

        // Create or look up the durable consumer for this partition
        let consumer = jetstream
            .create_consumer_on_stream(
                jetstream::consumer::pull::Config {
                    name: Some(consumer_name.to_string()),
                    durable_name: Some(consumer_name.to_string()),
                    filter_subject: subject_filter.to_string(),
                    ack_policy: jetstream::consumer::AckPolicy::All,
                    ..Default::default()
                },
                stream_name,
            )
            .await
            .context("Failed to create consumer")?;

        info!(
            stream = stream_name,
            consumer = consumer_name,
            partition,
            "Consumer created successfully"
        );

        Ok(Self {
            consumer,
            partition,
            pending: Mutex::new(Pending::default()),
        })
    }
}

#[async_trait]
impl MessageSource for JetStreamSource {
    async fn poll(
        &self,
        max_batch: usize,
        timeout: Duration,
    ) -> Result<Vec<RawMessage>, BrokerError> {
        let mut messages = self
            .consumer
            .fetch()
            .max_messages(max_batch)
            .expires(timeout)
            .messages()
            .await
            .map_err(|e| BrokerError::Transient(anyhow!("fetch failed: {}", e)))?;

        let mut fetched = Vec::new();
        while let Some(result) = messages.next().await {
            match result {
                Ok(message) => {
                    let info = message
                        .info()
                        .map_err(|e| BrokerError::Transient(anyhow!("missing ack info: {}", e)))?;
                    fetched.push((info.stream_sequence, message));
                }
                Err(e) => {
                    warn!(partition = self.partition, error = %e, "Error receiving message from batch");
                }
            }
        }

        let mut pending = self.pending.lock().await;

        // Delivery has moved (or restarted) at the batch's first offset;
        // stale entries below it would otherwise pile up when commits are
        // abandoned and the broker keeps redelivering.
        if let Some((first_offset, _)) = fetched.first() {
            pending.prune_below(*first_offset);
        }

        let mut batch = Vec::with_capacity(fetched.len());
        for (offset, message) in fetched {
            batch.push(RawMessage {
                partition: self.partition,
                offset,
                payload: message.payload.to_vec(),
                received_at: Utc::now(),
            });
            pending.insert(offset, message);
        }

        if !batch.is_empty() {
            debug!(
                partition = self.partition,
                message_count = batch.len(),
                "Received message batch"
            );
        }

        Ok(batch)
    }

    async fn acknowledge(&self, offset: u64) -> Result<(), BrokerError> {
        let mut pending = self.pending.lock().await;

        if let Some(committed) = pending.committed {
            if offset < committed {
                return Err(BrokerError::OutOfOrderAck {
                    partition: self.partition,
                    attempted: offset,
                    committed,
                });
            }
            // Re-committing the current offset is a no-op
            if offset == committed {
                return Ok(());
            }
        }

        let message = pending.messages.get(&offset).ok_or_else(|| {
            BrokerError::Transient(anyhow!(
                "offset {} is not pending on partition {}",
                offset,
                self.partition
            ))
        })?;

        // AckPolicy::All makes this a cumulative commit of everything up to
        // and including `offset`. Double-ack waits for broker confirmation.
        message
            .double_ack()
            .await
            .map_err(|e| BrokerError::Transient(anyhow!("ack failed: {}", e)))?;

        pending.commit_up_to(offset);

        debug!(partition = self.partition, offset, "Offset committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_commit_discards_covered_entries() {
        let mut pending: Pending<&str> = Pending::default();
        for offset in 1..=5 {
            pending.insert(offset, "msg");
        }

        pending.commit_up_to(3);

        assert_eq!(pending.committed, Some(3));
        assert_eq!(
            pending.messages.keys().copied().collect::<Vec<_>>(),
            vec![4, 5]
        );
    }

    #[test]
    fn test_pending_prunes_entries_below_redelivery_floor() {
        let mut pending: Pending<&str> = Pending::default();
        for offset in 1..=4 {
            pending.insert(offset, "msg");
        }

        // The next fetch starts at 3, so 1 and 2 can never be committed
        pending.prune_below(3);

        assert_eq!(
            pending.messages.keys().copied().collect::<Vec<_>>(),
            vec![3, 4]
        );
    }

    #[test]
    fn test_pending_stays_bounded_across_abandoned_commits() {
        let mut pending: Pending<&str> = Pending::default();

        // The same three-message batch keeps being redelivered because its
        // commit never lands
        for _ in 0..10 {
            pending.prune_below(1);
            for offset in 1..=3 {
                pending.insert(offset, "msg");
            }
        }

        assert_eq!(pending.messages.len(), 3);
    }
}
