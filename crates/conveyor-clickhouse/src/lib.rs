pub mod client;
pub mod models;
pub mod outcome_mirror;

pub use client::ClickHouseClient;
pub use models::OutcomeRow;
pub use outcome_mirror::{
    buffered_mirror, ensure_outcomes_table, BufferedOutcomeMirror, OutcomeFlusher,
};
