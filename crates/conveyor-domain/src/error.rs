use thiserror::Error;

/// Failures raised by the broker adapter.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Broker unreachable, poll or ack timed out. Retryable with backoff.
    #[error("transient broker failure: {0}")]
    Transient(#[source] anyhow::Error),

    /// Acknowledgements must be non-decreasing per partition. This is a
    /// programming error and terminates the coordinator.
    #[error(
        "out-of-order acknowledge on partition {partition}: offset {attempted} after {committed}"
    )]
    OutOfOrderAck {
        partition: u32,
        attempted: u64,
        committed: u64,
    },
}

/// Failures raised by the record sink.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Connection reset, timeout, pool exhaustion. Retryable with backoff.
    #[error("transient sink failure: {0}")]
    Transient(#[source] anyhow::Error),

    /// Schema or constraint violation. Never retried.
    #[error("permanent sink failure: {0}")]
    Permanent(#[source] anyhow::Error),
}

/// Terminal per-message transform failures. Never retried; the message is
/// still acknowledged so a poison message cannot block the partition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("missing mandatory field: {0}")]
    MissingField(String),

    #[error("invalid value for field {field}: {detail}")]
    InvalidField { field: String, detail: String },
}

/// A transform verdict, carrying the order identity when the payload was
/// intact enough to yield one. Only a payload whose identity field itself is
/// missing or malformed leaves `identity` empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub identity: Option<String>,
    pub reason: RejectionReason,
}

impl Rejection {
    pub fn unidentified(reason: RejectionReason) -> Self {
        Self {
            identity: None,
            reason,
        }
    }

    pub fn identified(identity: &str, reason: RejectionReason) -> Self {
        Self {
            identity: Some(identity.to_string()),
            reason,
        }
    }
}

/// Failure recording a processing outcome. Logged and swallowed by the
/// coordinator; loss degrades observability only, never correctness.
#[derive(Error, Debug)]
#[error("status mirror failure: {0}")]
pub struct MirrorError(#[from] pub anyhow::Error);
