//! The durable, subject-partitioned event log used to fan out new
//! transactions.
//!
//! Each persisted transaction is published on `txn.<address>`; subscribers
//! attach with an address filter or a wildcard. Live delivery to attached
//! subscribers is at-least-once and per-subject FIFO — consumers must
//! deduplicate by signature.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::types::TransactionEvent;

pub mod memory;
pub mod nats;

pub use memory::MemoryEventLog;
pub use nats::JetStreamEventLog;

/// Subject prefix for transaction events.
pub const SUBJECT_PREFIX: &str = "txn";

/// Subject carrying events for one address.
pub fn subject_for_address(address: &str) -> String {
    format!("{SUBJECT_PREFIX}.{address}")
}

/// Which subjects a subscriber wants.
#[derive(Debug, Clone)]
pub enum SubjectFilter {
    /// Every transaction event.
    All,
    /// Events for a single address.
    Address(String),
}

impl SubjectFilter {
    /// The wire-level filter subject; empty means unfiltered.
    pub fn filter_subject(&self) -> String {
        match self {
            SubjectFilter::All => String::new(),
            SubjectFilter::Address(address) => subject_for_address(address),
        }
    }

    pub fn matches(&self, address: &str) -> bool {
        match self {
            SubjectFilter::All => true,
            SubjectFilter::Address(wanted) => wanted == address,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("event log connection failed: {0}")]
    Connect(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("event stream error: {0}")]
    Stream(String),
}

/// A live subscription: events delivered from attach time onward.
pub type EventStream = BoxStream<'static, Result<TransactionEvent, EventLogError>>;

/// Publish/subscribe transport for transaction events.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn publish(&self, event: &TransactionEvent) -> Result<(), EventLogError>;

    /// Attach a live subscription delivering new events from now on.
    async fn subscribe(&self, filter: SubjectFilter) -> Result<EventStream, EventLogError>;
}
