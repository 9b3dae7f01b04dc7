use chrono::{DateTime, Utc};
use clickhouse::Row;
use conveyor_domain::ProcessingOutcome;
use serde::{Deserialize, Serialize};

/// Append-only audit row, one per processed raw message.
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct OutcomeRow {
    pub partition: u32,
    pub offset: u64,
    // Nullable(String): a rejected message may have no derivable identity
    pub identity: Option<String>,
    pub status: String,
    pub error: Option<String>,
    #[serde(with = "clickhouse::serde::chrono::datetime")]
    pub recorded_at: DateTime<Utc>,
}

impl From<&ProcessingOutcome> for OutcomeRow {
    fn from(outcome: &ProcessingOutcome) -> Self {
        Self {
            partition: outcome.partition,
            offset: outcome.offset,
            identity: outcome.identity.clone(),
            status: outcome.status.as_str().to_string(),
            error: outcome.error.clone(),
            recorded_at: outcome.recorded_at,
        }
    }
}
