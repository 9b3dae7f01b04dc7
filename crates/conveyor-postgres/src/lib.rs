pub mod client;
pub mod order_sink;

pub use client::PostgresClient;
pub use order_sink::PostgresRecordSink;
