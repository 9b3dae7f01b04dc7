use chrono::Utc;
use conveyor_domain::{
    BrokerError, Coordinator, CoordinatorConfig, MessageSource, NormalizedRecord, OutcomeMirror,
    OutcomeStatus, ProcessingOutcome, RawMessage, RecordSink, SaleOrderTransform, SinkError,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// In-memory implementations for integration testing
mod fakes {
    use super::*;
    use async_trait::async_trait;
    use conveyor_domain::MirrorError;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Serves prepared batches in order, then cancels the token.
    pub struct ScriptedSource {
        batches: Mutex<VecDeque<Vec<RawMessage>>>,
        pub acked: Mutex<Vec<u64>>,
        ctx: CancellationToken,
    }

    impl ScriptedSource {
        pub fn new(batches: Vec<Vec<RawMessage>>, ctx: CancellationToken) -> Self {
            Self {
                batches: Mutex::new(batches.into()),
                acked: Mutex::new(Vec::new()),
                ctx,
            }
        }
    }

    #[async_trait]
    impl MessageSource for ScriptedSource {
        async fn poll(
            &self,
            _max_batch: usize,
            _timeout: Duration,
        ) -> Result<Vec<RawMessage>, BrokerError> {
            match self.batches.lock().unwrap().pop_front() {
                Some(batch) => Ok(batch),
                None => {
                    self.ctx.cancel();
                    Ok(Vec::new())
                }
            }
        }

        async fn acknowledge(&self, offset: u64) -> Result<(), BrokerError> {
            let mut acked = self.acked.lock().unwrap();
            if let Some(last) = acked.last() {
                if offset < *last {
                    return Err(BrokerError::OutOfOrderAck {
                        partition: 0,
                        attempted: offset,
                        committed: *last,
                    });
                }
            }
            acked.push(offset);
            Ok(())
        }
    }

    /// Replace-by-identity store with optional injected transient failures.
    pub struct InMemorySink {
        pub stored: Mutex<HashMap<String, serde_json::Map<String, serde_json::Value>>>,
        pub upsert_calls: Mutex<u32>,
        failures_remaining: Mutex<u32>,
    }

    impl InMemorySink {
        pub fn new() -> Self {
            Self::failing_first(0)
        }

        /// Fail the first `n` upserts with a transient error.
        pub fn failing_first(n: u32) -> Self {
            Self {
                stored: Mutex::new(HashMap::new()),
                upsert_calls: Mutex::new(0),
                failures_remaining: Mutex::new(n),
            }
        }
    }

    #[async_trait]
    impl RecordSink for InMemorySink {
        async fn upsert(&self, record: &NormalizedRecord) -> Result<(), SinkError> {
            *self.upsert_calls.lock().unwrap() += 1;

            let mut failures = self.failures_remaining.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(SinkError::Transient(anyhow::anyhow!("injected failure")));
            }

            self.stored
                .lock()
                .unwrap()
                .insert(record.identity.clone(), record.fields.clone());
            Ok(())
        }
    }

    pub struct InMemoryMirror {
        pub outcomes: Mutex<Vec<ProcessingOutcome>>,
    }

    impl InMemoryMirror {
        pub fn new() -> Self {
            Self {
                outcomes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl OutcomeMirror for InMemoryMirror {
        async fn record(&self, outcome: ProcessingOutcome) -> Result<(), MirrorError> {
            self.outcomes.lock().unwrap().push(outcome);
            Ok(())
        }
    }
}

use fakes::{InMemoryMirror, InMemorySink, ScriptedSource};

fn order_message(offset: u64, code: &str, status: &str) -> RawMessage {
    RawMessage {
        partition: 0,
        offset,
        payload: format!(
            r#"{{"code": "{}", "customer": "acme", "status": "{}"}}"#,
            code, status
        )
        .into_bytes(),
        received_at: Utc::now(),
    }
}

fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        backoff: conveyor_domain::BackoffPolicy {
            base: std::time::Duration::from_millis(1),
            factor: 2.0,
            cap: std::time::Duration::from_millis(5),
            jitter: 0.0,
        },
        ..CoordinatorConfig::default()
    }
}

fn build(
    source: Arc<ScriptedSource>,
    sink: Arc<InMemorySink>,
    mirror: Arc<InMemoryMirror>,
) -> Coordinator {
    Coordinator::new(
        0,
        source,
        Arc::new(SaleOrderTransform::new()),
        sink,
        mirror,
        fast_config(),
    )
}

#[tokio::test]
async fn test_pipeline_end_to_end_with_poison_message() {
    let ctx = CancellationToken::new();
    let batch = vec![
        order_message(1, "SO-1", "CREATED"),
        order_message(2, "SO-2", "PAID"),
        RawMessage {
            partition: 0,
            offset: 3,
            payload: b"not json".to_vec(),
            received_at: Utc::now(),
        },
        order_message(4, "SO-4", "DELIVERED"),
        order_message(5, "SO-5", "CREATED"),
    ];

    let source = Arc::new(ScriptedSource::new(vec![batch], ctx.clone()));
    let sink = Arc::new(InMemorySink::new());
    let mirror = Arc::new(InMemoryMirror::new());

    build(source.clone(), sink.clone(), mirror.clone())
        .run(ctx)
        .await
        .unwrap();

    // Four orders stored, the poison message skipped
    let stored = sink.stored.lock().unwrap();
    assert_eq!(stored.len(), 4);
    assert_eq!(stored["SO-2"]["status"], "PAID");

    // Whole batch acknowledged in one commit
    assert_eq!(*source.acked.lock().unwrap(), vec![5]);

    // Outcomes in arrival order with the rejection in the middle
    let outcomes = mirror.outcomes.lock().unwrap();
    let statuses: Vec<OutcomeStatus> = outcomes.iter().map(|o| o.status).collect();
    assert_eq!(
        statuses,
        vec![
            OutcomeStatus::Success,
            OutcomeStatus::Success,
            OutcomeStatus::Rejected,
            OutcomeStatus::Success,
            OutcomeStatus::Success,
        ]
    );
    // An unparseable payload yields no identity to audit under
    assert_eq!(outcomes[2].identity, None);
}

#[tokio::test]
async fn test_redelivered_message_is_idempotent() {
    let ctx = CancellationToken::new();
    // The same order arrives twice under different offsets, as it would
    // after a crash between upsert and acknowledge
    let batches = vec![
        vec![order_message(1, "SO-42", "CREATED")],
        vec![order_message(2, "SO-42", "CREATED")],
    ];

    let source = Arc::new(ScriptedSource::new(batches, ctx.clone()));
    let sink = Arc::new(InMemorySink::new());
    let mirror = Arc::new(InMemoryMirror::new());

    build(source.clone(), sink.clone(), mirror.clone())
        .run(ctx)
        .await
        .unwrap();

    let stored = sink.stored.lock().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored["SO-42"]["status"], "CREATED");

    // Acknowledged offsets are non-decreasing
    let acked = source.acked.lock().unwrap();
    assert_eq!(*acked, vec![1, 2]);
}

#[tokio::test]
async fn test_transient_failures_below_budget_recover() {
    let ctx = CancellationToken::new();
    let source = Arc::new(ScriptedSource::new(
        vec![vec![order_message(1, "SO-7", "CREATED")]],
        ctx.clone(),
    ));
    // Two injected failures, budget of five
    let sink = Arc::new(InMemorySink::failing_first(2));
    let mirror = Arc::new(InMemoryMirror::new());

    build(source.clone(), sink.clone(), mirror.clone())
        .run(ctx)
        .await
        .unwrap();

    assert_eq!(*sink.upsert_calls.lock().unwrap(), 3);
    assert_eq!(sink.stored.lock().unwrap().len(), 1);
    assert_eq!(*source.acked.lock().unwrap(), vec![1]);

    let outcomes = mirror.outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, OutcomeStatus::Success);
}
