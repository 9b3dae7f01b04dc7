use async_trait::async_trait;
use std::time::Duration;

use crate::error::{BrokerError, MirrorError, SinkError};
use crate::types::{NormalizedRecord, ProcessingOutcome, RawMessage};

/// Ordered, acknowledgable message stream for one partition.
/// Infrastructure layer (conveyor-nats) implements this trait.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Pull up to `max_batch` messages, waiting at most `timeout`. The
    /// returned batch may be empty and is ordered by offset.
    async fn poll(&self, max_batch: usize, timeout: Duration)
        -> Result<Vec<RawMessage>, BrokerError>;

    /// Commit every message up to and including `offset` as durably
    /// processed. Offsets must be non-decreasing; re-acknowledging the
    /// committed offset is a no-op.
    async fn acknowledge(&self, offset: u64) -> Result<(), BrokerError>;
}

/// Replace-by-identity write into the document store. Calling `upsert` twice
/// with an identical record must leave the same stored state as calling it
/// once; this is what makes at-least-once delivery safe.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn upsert(&self, record: &NormalizedRecord) -> Result<(), SinkError>;
}

/// Best-effort audit trail of per-message outcomes. Implementations buffer
/// locally and flush in the background; a failure here must never block or
/// retry the main pipeline.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OutcomeMirror: Send + Sync {
    async fn record(&self, outcome: ProcessingOutcome) -> Result<(), MirrorError>;
}
