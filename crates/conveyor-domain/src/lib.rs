pub mod backoff;
pub mod coordinator;
pub mod error;
pub mod pipeline;
pub mod transform;
pub mod types;

pub use backoff::BackoffPolicy;
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use error::{BrokerError, MirrorError, Rejection, RejectionReason, SinkError};
pub use pipeline::{MessageSource, OutcomeMirror, RecordSink};
pub use transform::{SaleOrderTransform, Transform};
pub use types::{Checkpoint, NormalizedRecord, OutcomeStatus, ProcessingOutcome, RawMessage};
