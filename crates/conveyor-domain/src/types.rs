use chrono::{DateTime, Utc};

use crate::error::BrokerError;

/// A message as pulled from the broker, before any interpretation.
/// Owned by the source adapter until acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub partition: u32,
    pub offset: u64,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Output of the transform stage, keyed by a stable identity.
///
/// The identity is a deterministic function of the payload, so retrying the
/// same raw message always targets the same upsert key.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub identity: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// Terminal per-message result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Success,
    Rejected,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Rejected => "rejected",
            OutcomeStatus::Failed => "failed",
        }
    }
}

/// Audit row describing what happened to one raw message. Append-only.
///
/// `identity` is absent when the payload was too malformed to derive one.
/// `error` is present iff the status is not `Success`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingOutcome {
    pub identity: Option<String>,
    pub partition: u32,
    pub offset: u64,
    pub status: OutcomeStatus,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl ProcessingOutcome {
    pub fn success(message: &RawMessage, identity: String) -> Self {
        Self {
            identity: Some(identity),
            partition: message.partition,
            offset: message.offset,
            status: OutcomeStatus::Success,
            error: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn rejected(message: &RawMessage, identity: Option<String>, reason: String) -> Self {
        Self {
            identity,
            partition: message.partition,
            offset: message.offset,
            status: OutcomeStatus::Rejected,
            error: Some(reason),
            recorded_at: Utc::now(),
        }
    }

    pub fn failed(message: &RawMessage, identity: Option<String>, error: String) -> Self {
        Self {
            identity,
            partition: message.partition,
            offset: message.offset,
            status: OutcomeStatus::Failed,
            error: Some(error),
            recorded_at: Utc::now(),
        }
    }
}

/// Highest offset known to be fully committed for one partition.
///
/// Owned exclusively by the coordinator. The broker's own ack mechanism is
/// the durable source of truth; this only guards the in-process ordering
/// invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub partition: u32,
    pub committed: Option<u64>,
}

impl Checkpoint {
    pub fn new(partition: u32) -> Self {
        Self {
            partition,
            committed: None,
        }
    }

    /// Advance the checkpoint. Offsets must be non-decreasing; moving
    /// backwards is a programming error.
    pub fn advance(&mut self, offset: u64) -> Result<(), BrokerError> {
        if let Some(committed) = self.committed {
            if offset < committed {
                return Err(BrokerError::OutOfOrderAck {
                    partition: self.partition,
                    attempted: offset,
                    committed,
                });
            }
        }
        self.committed = Some(offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(offset: u64) -> RawMessage {
        RawMessage {
            partition: 0,
            offset,
            payload: b"{}".to_vec(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_checkpoint_advances_monotonically() {
        let mut checkpoint = Checkpoint::new(3);
        assert_eq!(checkpoint.committed, None);

        checkpoint.advance(5).unwrap();
        assert_eq!(checkpoint.committed, Some(5));

        // Re-committing the same offset is allowed
        checkpoint.advance(5).unwrap();
        checkpoint.advance(9).unwrap();
        assert_eq!(checkpoint.committed, Some(9));
    }

    #[test]
    fn test_checkpoint_rejects_backwards_advance() {
        let mut checkpoint = Checkpoint::new(1);
        checkpoint.advance(10).unwrap();

        let err = checkpoint.advance(4).unwrap_err();
        assert!(matches!(
            err,
            BrokerError::OutOfOrderAck {
                partition: 1,
                attempted: 4,
                committed: 10,
            }
        ));
        // Failed advance does not move the checkpoint
        assert_eq!(checkpoint.committed, Some(10));
    }

    #[test]
    fn test_outcome_error_presence_matches_status() {
        let msg = message(7);

        let ok = ProcessingOutcome::success(&msg, "SO-1".to_string());
        assert_eq!(ok.status, OutcomeStatus::Success);
        assert!(ok.error.is_none());

        let rejected =
            ProcessingOutcome::rejected(&msg, None, "missing mandatory field: code".to_string());
        assert_eq!(rejected.status, OutcomeStatus::Rejected);
        assert!(rejected.error.is_some());

        let failed = ProcessingOutcome::failed(
            &msg,
            Some("SO-1".to_string()),
            "retry budget exhausted".to_string(),
        );
        assert_eq!(failed.status, OutcomeStatus::Failed);
        assert!(failed.error.is_some());
        assert_eq!(failed.offset, 7);
    }
}
