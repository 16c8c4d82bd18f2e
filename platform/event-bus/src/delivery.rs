//! Outcome types for a single publish

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use event_contracts::ValidationError;
use tokio::sync::oneshot;

use crate::{BusError, RecordMetadata};

/// Where a published event ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub event_id: String,
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Option<String>,
}

impl SendReceipt {
    pub(crate) fn new(event_id: String, key: Option<String>, metadata: RecordMetadata) -> Self {
        Self {
            event_id,
            topic: metadata.topic,
            partition: metadata.partition,
            offset: metadata.offset,
            key,
        }
    }
}

/// Why a publish did not reach the bus
#[derive(Debug, Clone, thiserror::Error)]
pub enum PublishFailure {
    #[error("topic name is blank")]
    InvalidTopic,

    #[error("invalid event: {0}")]
    Invalid(#[from] ValidationError),

    #[error("failed to encode event: {0}")]
    Serialization(String),

    #[error("send buffer is full")]
    BufferFull,

    #[error("publisher is closed")]
    Closed,

    #[error("rejected by the bus: {0}")]
    Rejected(BusError),

    #[error("gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: BusError },

    #[error("not delivered within {0:?}")]
    DeliveryTimeout(Duration),
}

/// Permanent failure for one event
#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to publish event {event_id} to '{topic}': {reason}")]
pub struct PublishError {
    pub event_id: String,
    pub topic: String,
    #[source]
    pub reason: PublishFailure,
}

impl PublishError {
    pub fn new(
        event_id: impl Into<String>,
        topic: impl Into<String>,
        reason: PublishFailure,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            topic: topic.into(),
            reason,
        }
    }
}

/// Final outcome of one publish, as seen by report observers
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub event_id: String,
    pub topic: String,
    pub outcome: Result<SendReceipt, PublishError>,
}

impl DeliveryReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

pub(crate) type DeliverySender = oneshot::Sender<Result<SendReceipt, PublishError>>;

/// Resolves once the event has been stored by the bus or has permanently failed
///
/// Dropping the handle does not cancel the send.
#[derive(Debug)]
pub struct DeliveryHandle {
    event_id: String,
    topic: String,
    rx: oneshot::Receiver<Result<SendReceipt, PublishError>>,
}

impl DeliveryHandle {
    pub(crate) fn pending(event_id: String, topic: String) -> (Self, DeliverySender) {
        let (tx, rx) = oneshot::channel();
        (Self { event_id, topic, rx }, tx)
    }

    pub(crate) fn resolved(error: PublishError) -> Self {
        let (handle, tx) = Self::pending(error.event_id.clone(), error.topic.clone());
        let _ = tx.send(Err(error));
        handle
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Future for DeliveryHandle {
    type Output = Result<SendReceipt, PublishError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // Dispatcher went away without settling the record
            Poll::Ready(Err(_)) => Poll::Ready(Err(PublishError::new(
                self.event_id.clone(),
                self.topic.clone(),
                PublishFailure::Closed,
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}
