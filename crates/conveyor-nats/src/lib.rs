pub mod client;
pub mod source;

pub use client::NatsClient;
pub use source::JetStreamSource;
