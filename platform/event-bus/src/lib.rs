//! # Event Bus
//!
//! The delivery-guarantee half of the event platform. Domain services publish
//! [`EventEnvelope`](event_contracts::EventEnvelope)s onto named, partitioned
//! topics; other services consume them with at-least-once delivery and
//! manual acknowledgment.
//!
//! ## Pieces
//!
//! - [`MessageBus`]: the broker seen as a black box (send, describe/create
//!   topics, poll, commit)
//! - [`EventPublisher`]: enrich → derive key → submit → observe outcome, with
//!   idempotent sends, bounded retry, and opportunistic batching
//! - [`provision_topics`]: reconcile a static [`TopicCatalog`] against the bus
//!   at startup
//! - [`EventConsumer`]: fixed worker pool, commit-after-processing, and
//!   dead-letter routing for records that cannot be processed
//!
//! ## Implementations
//!
//! - **NatsBus**: Production implementation using NATS JetStream
//! - **InMemoryBus**: Test/dev implementation with in-process partition logs
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{EventPublisher, InMemoryBus, MessageBus, NatsBus, ProducerConfig};
//! use event_contracts::{EventEnvelope, InvoiceCreated};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Production: NATS JetStream
//! let nats_client = async_nats::connect("nats://localhost:4222").await?;
//! let bus: Arc<dyn MessageBus> = Arc::new(NatsBus::new(nats_client));
//!
//! // Dev/Test: In-Memory
//! let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
//!
//! let publisher = EventPublisher::new(bus, ProducerConfig::default());
//! # let invoice: InvoiceCreated = unimplemented!();
//! let receipt = publisher
//!     .publish("billing.invoice.created", None, EventEnvelope::new(invoice))
//!     .await?;
//! println!("stored at {}:{}", receipt.partition, receipt.offset);
//!
//! publisher.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod consumer;
mod delivery;
pub mod dlq;
mod inmemory_bus;
mod nats_bus;
pub mod partitioner;
pub mod provisioning;
mod publisher;
pub mod retry;

pub use config::{Acks, ConsumerConfig, OffsetReset, ProducerConfig};
pub use consumer::{
    ConsumerHandle, DecodeError, DecodedRecord, DeliveryState, EventConsumer, HandlerError,
    RecordHandler, RecordOutcome,
};
pub use delivery::{DeliveryHandle, DeliveryReport, PublishError, PublishFailure, SendReceipt};
pub use dlq::{
    BusDeadLetterSink, DeadLetterRecord, DeadLetterSink, FailureKind, DEAD_LETTER_TOPIC,
};
pub use inmemory_bus::InMemoryBus;
pub use nats_bus::NatsBus;
pub use provisioning::{
    provision_topics, CompressionType, ProvisioningError, ProvisioningReport, RetentionClass,
    TopicCatalog, TopicDescriptor,
};
pub use publisher::{
    spawn_delivery_logger, EventPublisher, CONTENT_TYPE_HEADER, EVENT_TYPE_HEADER,
};

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// A record on its way to the bus
#[derive(Debug, Clone)]
pub struct OutboundRecord {
    /// Destination topic
    pub topic: String,
    /// Partition key; `None` lets the bus spread records round-robin
    pub key: Option<String>,
    /// Serialized record value
    pub payload: Vec<u8>,
    /// Transport headers
    pub headers: HashMap<String, String>,
    /// Stable identity used by the bus to drop retried duplicates
    pub idempotence_key: Option<String>,
    /// Replica acknowledgment required before the send counts as done
    pub acks: Acks,
}

impl OutboundRecord {
    pub fn new(topic: impl Into<String>, key: Option<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key,
            payload,
            headers: HashMap::new(),
            idempotence_key: None,
            acks: Acks::All,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_idempotence_key(mut self, key: Option<String>) -> Self {
        self.idempotence_key = key;
        self
    }

    pub fn with_acks(mut self, acks: Acks) -> Self {
        self.acks = acks;
        self
    }
}

/// Where the bus stored a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}

/// A record handed to a consumer
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
}

/// What the bus knows about a live topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicDescription {
    pub name: String,
    pub partitions: u32,
}

/// One fetch against a single partition on behalf of a consumer group
#[derive(Debug, Clone)]
pub struct PollRequest {
    pub group_id: String,
    pub topic: String,
    pub partition: u32,
    pub max_records: usize,
    /// Upper bound on how long the bus may wait for records to arrive
    pub max_wait: Duration,
    /// Starting position when the group has no committed offset yet
    pub offset_reset: OffsetReset,
    /// How long delivered but unacknowledged records stay with this member
    /// before the bus hands them out again
    pub session_timeout: Duration,
    /// Liveness signal expected from the bus while a poll is waiting
    pub heartbeat_interval: Duration,
}

/// Window in which a repeated idempotence key is dropped by the bus
pub(crate) const DUPLICATE_WINDOW: Duration = Duration::from_secs(120);

/// Errors that can occur when using the message bus
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("broker did not answer in time: {0}")]
    Timeout(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("failed to poll records: {0}")]
    PollError(String),

    #[error("failed to commit offset: {0}")]
    CommitError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("topic administration failed: {0}")]
    AdminError(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl BusError {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BusError::PublishError(_) | BusError::Timeout(_) | BusError::ConnectionError(_)
        )
    }
}

/// Result type for message bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Core message bus abstraction for partitioned, offset-addressed topics
///
/// Implementations must be safe to share across tasks: one bus instance is
/// the process-wide connection used by every publisher and consumer.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Transmit a single record
    ///
    /// # Returns
    /// * `Ok(RecordMetadata)` once the bus has stored the record with the
    ///   requested acknowledgment level
    /// * `Err(BusError)` if this attempt failed; retry policy belongs to the caller
    async fn send(&self, record: OutboundRecord) -> BusResult<RecordMetadata>;

    /// Transmit records in order, stopping at the first failure
    ///
    /// The returned vector is positionally aligned with `records`. It is
    /// shorter than the input when a send failed: the last element is the
    /// failure and every record after it was not attempted.
    async fn send_batch(&self, records: Vec<OutboundRecord>) -> Vec<BusResult<RecordMetadata>> {
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            let result = self.send(record).await;
            let failed = result.is_err();
            results.push(result);
            if failed {
                break;
            }
        }
        results
    }

    /// Look up a topic; `Ok(None)` when it does not exist
    async fn describe_topic(&self, topic: &str) -> BusResult<Option<TopicDescription>>;

    /// Create a topic from its catalog descriptor
    async fn create_topic(&self, descriptor: &TopicDescriptor) -> BusResult<()>;

    /// Fetch up to `max_records` records after the group's committed position
    async fn poll(&self, request: &PollRequest) -> BusResult<Vec<ConsumedRecord>>;

    /// Mark `record` as processed for `group_id`
    async fn commit(&self, group_id: &str, record: &ConsumedRecord) -> BusResult<()>;

    /// Give `record` and every record delivered after it on the same
    /// partition back to the group, to be delivered again in order
    ///
    /// Buses whose poll always resumes from the committed position need no
    /// extra work here.
    async fn release(&self, _group_id: &str, _record: &ConsumedRecord) -> BusResult<()> {
        Ok(())
    }
}

impl fmt::Debug for dyn MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageBus")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BusError::PublishError("x".into()).is_transient());
        assert!(BusError::Timeout("x".into()).is_transient());
        assert!(BusError::ConnectionError("x".into()).is_transient());
        assert!(!BusError::UnknownTopic("x".into()).is_transient());
        assert!(!BusError::SerializationError("x".into()).is_transient());
    }

    #[test]
    fn test_outbound_record_builder() {
        let record = OutboundRecord::new("t", Some("k".into()), b"v".to_vec())
            .with_header("content-type", "application/json")
            .with_idempotence_key(Some("evt-1".into()))
            .with_acks(Acks::Leader);

        assert_eq!(record.headers["content-type"], "application/json");
        assert_eq!(record.idempotence_key.as_deref(), Some("evt-1"));
        assert_eq!(record.acks, Acks::Leader);
    }
}
