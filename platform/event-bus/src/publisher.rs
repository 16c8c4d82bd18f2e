//! Event publisher
//!
//! `publish` never blocks and never panics. It enriches and validates the
//! envelope, derives the partition key, encodes the wire form and queues the
//! record for a single dispatcher task. The dispatcher sends records in FIFO
//! order in small batches and owns the retry loop, so two records that share
//! a key reach their partition in the order they were published.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};

use event_contracts::{resolve_key, EventEnvelope, PartitionKeyStrategy, SourceKeyStrategy};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::config::ProducerConfig;
use crate::delivery::{
    DeliveryHandle, DeliveryReport, DeliverySender, PublishError, PublishFailure, SendReceipt,
};
use crate::retry::{deadline_after, retry_with_backoff_if, RetryConfig};
use crate::{BusError, BusResult, MessageBus, OutboundRecord, RecordMetadata};

const REPORT_CHANNEL_CAPACITY: usize = 1024;

/// Header carrying the event type, so consumers can route without decoding
pub const EVENT_TYPE_HEADER: &str = "event-type";
pub const CONTENT_TYPE_HEADER: &str = "content-type";

struct PendingRecord {
    record: OutboundRecord,
    event_id: String,
    enqueued_at: Instant,
    reply: DeliverySender,
}

/// Open side of the publisher; dropped on close
struct Intake {
    queue: mpsc::Sender<PendingRecord>,
    reports: broadcast::Sender<DeliveryReport>,
}

/// Publishes envelopes onto the bus with retry, idempotence and batching
pub struct EventPublisher {
    config: ProducerConfig,
    key_strategy: Arc<dyn PartitionKeyStrategy>,
    intake: RwLock<Option<Intake>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl EventPublisher {
    /// Start a publisher keyed by event source
    ///
    /// Must be called from within a Tokio runtime; the dispatcher task is
    /// spawned immediately.
    pub fn new(bus: Arc<dyn MessageBus>, config: ProducerConfig) -> Self {
        Self::with_key_strategy(bus, config, Arc::new(SourceKeyStrategy))
    }

    pub fn with_key_strategy(
        bus: Arc<dyn MessageBus>,
        config: ProducerConfig,
        key_strategy: Arc<dyn PartitionKeyStrategy>,
    ) -> Self {
        let (queue, rx) = mpsc::channel(config.buffer_capacity.max(1));
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);

        let dispatcher = tokio::spawn(run_dispatcher(
            bus,
            config.clone(),
            rx,
            reports.clone(),
        ));

        Self {
            config,
            key_strategy,
            intake: RwLock::new(Some(Intake { queue, reports })),
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    /// Submit an event for delivery
    ///
    /// `key` overrides the partition key strategy. The returned handle
    /// resolves once the bus has stored the event or the event has
    /// permanently failed; invalid input resolves it immediately.
    pub fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        envelope: EventEnvelope,
    ) -> DeliveryHandle {
        let envelope = envelope.enrich();
        let event_id = envelope.event_id().unwrap_or_default().to_string();

        let intake = match self.intake.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(intake) = intake.as_ref() else {
            return reject(None, event_id, topic, PublishFailure::Closed);
        };

        if topic.trim().is_empty() {
            return reject(Some(&intake.reports), event_id, topic, PublishFailure::InvalidTopic);
        }
        if let Err(e) = envelope.validate() {
            return reject(Some(&intake.reports), event_id, topic, e.into());
        }

        let key = resolve_key(key, self.key_strategy.as_ref(), &envelope);
        let payload = match envelope.to_wire() {
            Ok(payload) => payload,
            Err(e) => {
                return reject(
                    Some(&intake.reports),
                    event_id,
                    topic,
                    PublishFailure::Serialization(e.to_string()),
                )
            }
        };

        let record = OutboundRecord::new(topic, key, payload)
            .with_header(EVENT_TYPE_HEADER, envelope.event_type())
            .with_header(CONTENT_TYPE_HEADER, "application/json")
            .with_idempotence_key(self.config.enable_idempotence.then(|| event_id.clone()))
            .with_acks(self.config.acks);

        let (handle, reply) = DeliveryHandle::pending(event_id.clone(), topic.to_string());
        let pending = PendingRecord {
            record,
            event_id,
            enqueued_at: Instant::now(),
            reply,
        };

        match intake.queue.try_send(pending) {
            Ok(()) => {
                debug!(
                    event_id = %handle.event_id(),
                    topic = %topic,
                    event_type = %envelope.event_type(),
                    "Event queued for delivery"
                );
            }
            Err(mpsc::error::TrySendError::Full(pending)) => {
                settle(&intake.reports, pending, Err(PublishFailure::BufferFull));
            }
            Err(mpsc::error::TrySendError::Closed(pending)) => {
                settle(&intake.reports, pending, Err(PublishFailure::Closed));
            }
        }

        handle
    }

    /// Stream of every publish outcome from now on
    ///
    /// The stream ends once the publisher is closed and the dispatcher has
    /// drained.
    pub fn delivery_reports(&self) -> BoxStream<'static, DeliveryReport> {
        let intake = match self.intake.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(intake) = intake.as_ref() else {
            return stream::empty().boxed();
        };
        let mut receiver = intake.reports.subscribe();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(report) => yield report,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Delivery report observer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        stream.boxed()
    }

    /// Stop accepting events and wait for everything queued to settle
    pub async fn close(&self) {
        let intake = match self.intake.write() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(intake);

        let dispatcher = match self.dispatcher.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                error!(error = %e, "Publisher dispatcher terminated abnormally");
            }
            info!("Publisher closed");
        }
    }
}

/// Log every delivery outcome until the publisher closes
pub fn spawn_delivery_logger(publisher: &EventPublisher) -> JoinHandle<()> {
    let mut reports = publisher.delivery_reports();
    tokio::spawn(async move {
        while let Some(report) = reports.next().await {
            match &report.outcome {
                Ok(receipt) => info!(
                    event_id = %receipt.event_id,
                    topic = %receipt.topic,
                    partition = receipt.partition,
                    offset = receipt.offset,
                    key = %receipt.key.as_deref().unwrap_or("none"),
                    "Event delivered"
                ),
                Err(e) => error!(
                    event_id = %e.event_id,
                    topic = %e.topic,
                    error = %e.reason,
                    "Event delivery failed"
                ),
            }
        }
    })
}

fn reject(
    reports: Option<&broadcast::Sender<DeliveryReport>>,
    event_id: String,
    topic: &str,
    reason: PublishFailure,
) -> DeliveryHandle {
    warn!(event_id = %event_id, topic = %topic, error = %reason, "Event rejected before send");
    let error = PublishError::new(event_id, topic, reason);
    if let Some(reports) = reports {
        let _ = reports.send(DeliveryReport {
            event_id: error.event_id.clone(),
            topic: error.topic.clone(),
            outcome: Err(error.clone()),
        });
    }
    DeliveryHandle::resolved(error)
}

fn settle(
    reports: &broadcast::Sender<DeliveryReport>,
    pending: PendingRecord,
    outcome: Result<RecordMetadata, PublishFailure>,
) {
    let PendingRecord {
        record,
        event_id,
        reply,
        ..
    } = pending;

    let outcome = match outcome {
        Ok(metadata) => {
            debug!(
                event_id = %event_id,
                topic = %metadata.topic,
                partition = metadata.partition,
                offset = metadata.offset,
                "Event stored"
            );
            Ok(SendReceipt::new(event_id.clone(), record.key, metadata))
        }
        Err(reason) => {
            warn!(
                event_id = %event_id,
                topic = %record.topic,
                error = %reason,
                "Event permanently failed"
            );
            Err(PublishError::new(event_id.clone(), record.topic.clone(), reason))
        }
    };

    // No observers is fine
    let _ = reports.send(DeliveryReport {
        event_id,
        topic: record.topic,
        outcome: outcome.clone(),
    });
    // Caller may have dropped the handle
    let _ = reply.send(outcome);
}

async fn run_dispatcher(
    bus: Arc<dyn MessageBus>,
    config: ProducerConfig,
    mut rx: mpsc::Receiver<PendingRecord>,
    reports: broadcast::Sender<DeliveryReport>,
) {
    debug!("Publisher dispatcher started");

    while let Some(first) = rx.recv().await {
        let mut bytes = first.record.payload.len();
        let mut batch = vec![first];
        let linger_until = deadline_after(Instant::now(), config.linger);

        while bytes < config.batch_size {
            match timeout_at(linger_until, rx.recv()).await {
                Ok(Some(next)) => {
                    bytes += next.record.payload.len();
                    batch.push(next);
                }
                Ok(None) | Err(_) => break,
            }
        }

        dispatch_batch(bus.as_ref(), &config, batch, &reports).await;
    }

    debug!("Publisher dispatcher drained");
}

async fn dispatch_batch(
    bus: &dyn MessageBus,
    config: &ProducerConfig,
    batch: Vec<PendingRecord>,
    reports: &broadcast::Sender<DeliveryReport>,
) {
    let mut remaining: VecDeque<PendingRecord> = batch.into();

    while !remaining.is_empty() {
        let records: Vec<OutboundRecord> = remaining.iter().map(|p| p.record.clone()).collect();
        let results = bus.send_batch(records).await;

        if results.is_empty() {
            for pending in remaining.drain(..) {
                let failure = PublishFailure::Rejected(BusError::InternalError(
                    "bus returned no result for batch".to_string(),
                ));
                settle(reports, pending, Err(failure));
            }
            break;
        }

        for result in results {
            let Some(pending) = remaining.pop_front() else {
                break;
            };
            match result {
                Ok(metadata) => settle(reports, pending, Ok(metadata)),
                Err(e) => {
                    // Everything behind this record waits until it settles
                    let outcome = retry_record(bus, config, &pending, e).await;
                    settle(reports, pending, outcome);
                }
            }
        }
    }
}

async fn retry_record(
    bus: &dyn MessageBus,
    config: &ProducerConfig,
    pending: &PendingRecord,
    first_error: BusError,
) -> Result<RecordMetadata, PublishFailure> {
    let schedule = config.retry_config();

    if !first_error.is_transient() {
        return Err(PublishFailure::Rejected(first_error));
    }
    if schedule.max_attempts <= 1 {
        return Err(PublishFailure::RetriesExhausted {
            attempts: 1,
            last_error: first_error,
        });
    }

    warn!(
        event_id = %pending.event_id,
        topic = %pending.record.topic,
        error = %first_error,
        "Send failed, retrying"
    );

    let remaining = RetryConfig {
        max_attempts: schedule.max_attempts - 1,
        ..schedule.clone()
    };
    let deadline = deadline_after(pending.enqueued_at, config.delivery_timeout);

    let attempts = async {
        sleep(schedule.initial_backoff).await;
        retry_with_backoff_if(
            || send_one(bus, pending.record.clone()),
            &remaining,
            "publish_event",
            BusError::is_transient,
        )
        .await
    };

    match timeout_at(deadline, attempts).await {
        Ok(Ok(metadata)) => Ok(metadata),
        Ok(Err(e)) if e.is_transient() => Err(PublishFailure::RetriesExhausted {
            attempts: schedule.max_attempts,
            last_error: e,
        }),
        Ok(Err(e)) => Err(PublishFailure::Rejected(e)),
        Err(_) => Err(PublishFailure::DeliveryTimeout(config.delivery_timeout)),
    }
}

async fn send_one(bus: &dyn MessageBus, record: OutboundRecord) -> BusResult<RecordMetadata> {
    bus.send(record).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryBus, TopicDescriptor};
    use chrono::NaiveDate;
    use event_contracts::InvoiceCreated;
    use rust_decimal::Decimal;
    use std::time::Duration;

    fn invoice(id: &str) -> EventEnvelope {
        EventEnvelope::new(InvoiceCreated::new(
            id,
            "EMP-7",
            "Initech",
            Decimal::new(10000, 2),
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            None,
        ))
    }

    fn fast_config() -> ProducerConfig {
        ProducerConfig {
            retry_backoff: Duration::from_millis(5),
            linger: Duration::from_millis(1),
            ..ProducerConfig::default()
        }
    }

    async fn bus_with_topic(name: &str, partitions: u32) -> Arc<InMemoryBus> {
        let bus = Arc::new(InMemoryBus::new());
        bus.create_topic(&TopicDescriptor::new(name, partitions, Duration::from_secs(60)))
            .await
            .unwrap();
        bus
    }

    #[tokio::test]
    async fn test_blank_topic_fails_without_sending() {
        let bus = bus_with_topic("billing.invoice.created", 1).await;
        let publisher = EventPublisher::new(bus.clone(), fast_config());

        let err = publisher.publish("  ", None, invoice("INV-1")).await.unwrap_err();

        assert!(matches!(err.reason, PublishFailure::InvalidTopic));
        assert!(!err.event_id.is_empty());
        publisher.close().await;
        assert!(bus.records("billing.invoice.created").is_empty());
    }

    #[tokio::test]
    async fn test_invalid_envelope_fails_immediately() {
        let bus = bus_with_topic("billing.invoice.created", 1).await;
        let publisher = EventPublisher::new(bus, fast_config());
        let bad = EventEnvelope::new(InvoiceCreated::new(
            "INV-1",
            "EMP-7",
            "Initech",
            Decimal::ZERO,
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            None,
        ));

        let err = publisher
            .publish("billing.invoice.created", None, bad)
            .await
            .unwrap_err();
        assert!(matches!(err.reason, PublishFailure::Invalid(_)));
    }

    #[tokio::test]
    async fn test_publish_after_close_fails() {
        let bus = bus_with_topic("billing.invoice.created", 1).await;
        let publisher = EventPublisher::new(bus, fast_config());
        publisher.close().await;

        let err = publisher
            .publish("billing.invoice.created", None, invoice("INV-1"))
            .await
            .unwrap_err();
        assert!(matches!(err.reason, PublishFailure::Closed));
    }

    #[tokio::test]
    async fn test_non_transient_error_is_not_retried() {
        let bus = Arc::new(InMemoryBus::new());
        let publisher = EventPublisher::new(bus, fast_config());

        let err = publisher
            .publish("no.such.topic", None, invoice("INV-1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.reason,
            PublishFailure::Rejected(BusError::UnknownTopic(_))
        ));
    }

    #[tokio::test]
    async fn test_idempotence_key_is_event_id() {
        let bus = bus_with_topic("billing.invoice.created", 1).await;
        let publisher = EventPublisher::new(bus.clone(), fast_config());

        let receipt = publisher
            .publish("billing.invoice.created", None, invoice("INV-1"))
            .await
            .unwrap();

        let stored = bus.records("billing.invoice.created");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].headers[EVENT_TYPE_HEADER], "billing.invoice.created");
        assert_eq!(bus.dedupe_entries(), 1);
        assert_eq!(receipt.offset, stored[0].offset);
    }
}
